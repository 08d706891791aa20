use std::collections::BTreeSet;

use chrono::NaiveDate;
use consensus_core::{PriceSnapshot, PriceSource, RankingSnapshot, RankingSource};
use rust_decimal::prelude::*;

use crate::error::{BacktestError, LedgerError};
use crate::ledger::LedgerStore;
use crate::metrics;
use crate::models::*;
use crate::retry::RetryError;

/// Where the driver is in its replay.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    AwaitingFirstPeriod,
    /// Open entries valued at `date`; selection not yet decided.
    Priced { date: NaiveDate, total_value: Decimal },
    Rebalanced { date: NaiveDate },
    Held { date: NaiveDate },
    Liquidated { date: NaiveDate },
    Terminated,
}

/// Open entries marked to market at one evaluation date.
#[derive(Debug, Clone)]
pub struct PricedPortfolio {
    pub date: NaiveDate,
    pub marked: Vec<LedgerEntry>,
    pub cash: Decimal,
    pub total_value: Decimal,
}

/// A selected asset with a usable entry price.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rank: i64,
    pub asset_id: String,
    pub entry_price: Decimal,
}

/// Value every open entry at `date`: the latest positive close on or before
/// the date, or the entry price when the asset has never printed one.
pub fn price_holdings(
    date: NaiveDate,
    open: &[LedgerEntry],
    cash: Decimal,
    prices: &PriceSnapshot,
) -> PricedPortfolio {
    let marked: Vec<LedgerEntry> = open
        .iter()
        .map(|entry| {
            let price = match prices.valuation_price(&entry.asset_id) {
                Some(price) => price,
                None => {
                    tracing::warn!(
                        "No positive close for {} on or before {}, valuing at entry price {}",
                        entry.asset_id,
                        date,
                        entry.entry_price
                    );
                    entry.entry_price
                }
            };
            entry.marked(date, price)
        })
        .collect();

    let total_value = marked.iter().map(|e| e.current_value).sum::<Decimal>() + cash;
    PricedPortfolio {
        date,
        marked,
        cash,
        total_value,
    }
}

/// Filter and order the ranking rows for one date and keep the top `top_k`.
///
/// An asset qualifies with enough combined-cohort analysts, a combined
/// dispersion within bounds (a missing dispersion never qualifies) and a
/// combined expected return, optionally above a floor.
pub fn select_assets<'r>(
    rankings: &'r [RankingSnapshot],
    config: &BacktestConfig,
) -> Vec<&'r RankingSnapshot> {
    let mut selected: Vec<(&RankingSnapshot, f64)> = rankings
        .iter()
        .filter(|r| r.combined.analyst_count >= config.min_analysts)
        .filter(|r| {
            r.combined
                .dispersion
                .is_some_and(|d| d <= config.max_dispersion)
        })
        .filter_map(|r| {
            let er = r.expected_return_combined()?;
            if !er.is_finite() {
                return None;
            }
            match config.min_expected_return {
                Some(floor) if er < floor => None,
                _ => Some((r, er)),
            }
        })
        .collect();

    selected.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.asset_id.cmp(&b.0.asset_id)));
    selected.truncate(config.top_k);
    selected.into_iter().map(|(r, _)| r).collect()
}

/// Attach entry prices to the selection. Assets without a positive latest
/// close are skipped so their share goes to the rest.
pub fn resolve_entries(
    date: NaiveDate,
    selection: &[&RankingSnapshot],
    prices: &PriceSnapshot,
) -> Vec<Candidate> {
    selection
        .iter()
        .enumerate()
        .filter_map(|(i, row)| match prices.latest(&row.asset_id) {
            Some(close) if close.close > Decimal::ZERO => Some(Candidate {
                rank: i as i64 + 1,
                asset_id: row.asset_id.clone(),
                entry_price: close.close,
            }),
            Some(close) => {
                tracing::warn!(
                    "Skipping {} on {}: latest close {} on {} is not positive",
                    row.asset_id,
                    date,
                    close.close,
                    close.date
                );
                None
            }
            None => {
                tracing::warn!("Skipping {} on {}: no close on or before date", row.asset_id, date);
                None
            }
        })
        .collect()
}

/// Decide what a priced step does and build the rows it writes.
pub fn plan_period(
    priced: &PricedPortfolio,
    candidates: &[Candidate],
    config: &BacktestConfig,
    is_final: bool,
) -> Result<PeriodWrite, BacktestError> {
    let date = priced.date;
    let held: BTreeSet<&str> = priced.marked.iter().map(|e| e.asset_id.as_str()).collect();
    let chosen: BTreeSet<&str> = candidates.iter().map(|c| c.asset_id.as_str()).collect();

    let action = if is_final && config.liquidate_at_end {
        PeriodAction::Liquidate
    } else if candidates.is_empty() || chosen == held {
        PeriodAction::Hold
    } else {
        PeriodAction::Rebalance
    };

    let checkpoint = |action, cash, opened: &[LedgerEntry], closed: &[LedgerEntry]| {
        PeriodCheckpoint {
            portfolio: config.portfolio.clone(),
            evaluation_date: date,
            action,
            total_value: priced.total_value,
            cash,
            opened: opened.len() as i64,
            closed: closed.len() as i64,
        }
    };

    if action == PeriodAction::Hold {
        if candidates.is_empty() && !held.is_empty() {
            tracing::info!("No tradable selection on {}, carrying current holdings", date);
        }
        return Ok(PeriodWrite {
            checkpoint: checkpoint(action, priced.cash, &[], &[]),
            closed: Vec::new(),
            marked: priced.marked.clone(),
            opened: Vec::new(),
        });
    }

    let closed: Vec<LedgerEntry> = priced
        .marked
        .iter()
        .map(|e| e.closed(date, e.current_price))
        .collect();
    let capital = closed
        .iter()
        .filter_map(|e| e.exit_value)
        .sum::<Decimal>()
        + priced.cash;

    // 1e-9 relative
    let tolerance = priced.total_value.abs() * Decimal::new(1, 9);
    if (capital - priced.total_value).abs() > tolerance {
        return Err(BacktestError::Reconciliation {
            date,
            expected: priced.total_value,
            actual: capital,
        });
    }

    let opened: Vec<LedgerEntry> = if action == PeriodAction::Rebalance {
        let per_asset = capital / Decimal::from(candidates.len());
        candidates
            .iter()
            .map(|c| {
                LedgerEntry::open(
                    &config.portfolio,
                    date,
                    c.rank,
                    &c.asset_id,
                    c.entry_price,
                    per_asset,
                )
            })
            .collect()
    } else {
        Vec::new()
    };
    // What the equal split could not place (division remainder, or all of
    // it on liquidation) stays as cash.
    let cash = capital - opened.iter().map(|e| e.entry_value).sum::<Decimal>();

    Ok(PeriodWrite {
        checkpoint: checkpoint(action, cash, &opened, &closed),
        closed,
        marked: Vec::new(),
        opened,
    })
}

/// Replays the weekly rebalance over `[start_date, end_date]`, resuming after
/// the last committed checkpoint of the configured portfolio. The replay never
/// runs past the last date the rankings have been computed for.
pub struct BacktestDriver<'a, M, L> {
    market: &'a M,
    ledger: &'a L,
    config: &'a BacktestConfig,
    state: DriverState,
}

impl<'a, M, L> BacktestDriver<'a, M, L>
where
    M: RankingSource + PriceSource,
    L: LedgerStore,
{
    pub fn new(market: &'a M, ledger: &'a L, config: &'a BacktestConfig) -> Self {
        Self {
            market,
            ledger,
            config,
            state: DriverState::AwaitingFirstPeriod,
        }
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub async fn run(&mut self) -> Result<BacktestReport, BacktestError> {
        let config = self.config;
        config.validate()?;

        let mut portfolio = self
            .ledger
            .load_state(&config.portfolio)
            .await
            .map_err(|source| BacktestError::State {
                portfolio: config.portfolio.clone(),
                source,
            })?;

        let mut date = match &portfolio.last_checkpoint {
            Some(cp) => {
                tracing::info!(
                    "Resuming portfolio '{}' after checkpoint {} (value {})",
                    config.portfolio,
                    cp.evaluation_date,
                    cp.total_value
                );
                cp.evaluation_date + config.cadence()
            }
            None => {
                if !portfolio.open.is_empty() {
                    return Err(BacktestError::State {
                        portfolio: config.portfolio.clone(),
                        source: LedgerError::Database(
                            "open entries without any committed period".into(),
                        ),
                    });
                }
                portfolio.cash = config.initial_capital;
                config.start_date
            }
        };

        // Dates past the last computed rankings are left for a later run
        // rather than committed as empty periods.
        let ranked_through = self
            .market
            .latest_ranking_date()
            .await
            .map_err(|source| BacktestError::Source { date, source })?;
        let last_date = match ranked_through {
            Some(ranked) if ranked < config.end_date => {
                tracing::warn!(
                    "Rankings computed through {}; '{}' stops there instead of {}",
                    ranked,
                    config.portfolio,
                    config.end_date
                );
                ranked
            }
            Some(_) => config.end_date,
            None => {
                tracing::warn!("No rankings computed yet; nothing to replay");
                date - config.cadence()
            }
        };

        let starting_value = portfolio.total_value();
        let mut periods = Vec::new();
        let mut realized = Decimal::ZERO;

        while date <= last_date {
            let is_final = date + config.cadence() > config.end_date;
            let write = match self.step(date, &portfolio, is_final).await {
                Ok(write) => write,
                Err(e) => {
                    tracing::error!("Backtest '{}' halted at {}: {}", config.portfolio, date, e);
                    return Err(e);
                }
            };

            realized += write
                .closed
                .iter()
                .filter_map(|e| e.evolution)
                .sum::<Decimal>();
            portfolio.apply(&write);

            let cp = write.checkpoint;
            self.state = match cp.action {
                PeriodAction::Rebalance => DriverState::Rebalanced { date },
                PeriodAction::Hold => DriverState::Held { date },
                PeriodAction::Liquidate => DriverState::Liquidated { date },
            };
            tracing::info!(
                "{} {}: {} (value {}, opened {}, closed {})",
                config.portfolio,
                date,
                cp.action,
                cp.total_value.round_dp(4),
                cp.opened,
                cp.closed
            );
            periods.push(cp);

            date += config.cadence();
        }

        self.state = DriverState::Terminated;
        Ok(metrics::summarize(
            &config.portfolio,
            starting_value,
            periods,
            realized,
        ))
    }

    /// Price, select, decide and commit one evaluation date.
    async fn step(
        &mut self,
        date: NaiveDate,
        portfolio: &PortfolioState,
        is_final: bool,
    ) -> Result<PeriodWrite, BacktestError> {
        let prices = self
            .market
            .prices_as_of(date)
            .await
            .map_err(|source| BacktestError::Source { date, source })?;
        let rankings = self
            .market
            .rankings_on(date)
            .await
            .map_err(|source| BacktestError::Source { date, source })?;

        let priced = price_holdings(date, &portfolio.open, portfolio.cash, &prices);
        self.state = DriverState::Priced {
            date,
            total_value: priced.total_value,
        };

        let selection = select_assets(&rankings, self.config);
        let candidates = resolve_entries(date, &selection, &prices);
        tracing::debug!(
            "{}: {} ranked, {} selected, {} tradable",
            date,
            rankings.len(),
            selection.len(),
            candidates.len()
        );

        let write = plan_period(&priced, &candidates, self.config, is_final)?;
        self.persist(&write).await?;
        Ok(write)
    }

    async fn persist(&self, write: &PeriodWrite) -> Result<(), BacktestError> {
        let date = write.evaluation_date();
        let label = format!("apply_period {} {}", self.config.portfolio, date);
        let ledger = self.ledger;
        self.config
            .retry
            .run(&label, || ledger.apply_period(write))
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => BacktestError::RetriesExhausted {
                    date,
                    attempts,
                    source: last,
                },
                RetryError::Fatal(source) => BacktestError::Persistence { date, source },
            })
    }
}

/// Run (or resume) a backtest against `market`, committing to `ledger`.
pub async fn run_backtest<M, L>(
    market: &M,
    ledger: &L,
    config: &BacktestConfig,
) -> Result<BacktestReport, BacktestError>
where
    M: RankingSource + PriceSource,
    L: LedgerStore,
{
    BacktestDriver::new(market, ledger, config).run().await
}
