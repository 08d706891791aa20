use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, LedgerError};
use crate::retry::RetryPolicy;

/// Configuration for a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Namespace for ledger rows; independent strategies can share one store.
    pub portfolio: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub cadence_days: i64,
    pub top_k: usize,
    pub min_analysts: i64,
    /// Upper bound on the combined cohort's price-target dispersion.
    pub max_dispersion: f64,
    /// Only select assets whose combined expected return reaches this (percent).
    pub min_expected_return: Option<f64>,
    pub initial_capital: Decimal,
    /// Close every open entry into cash on the final evaluation date.
    pub liquidate_at_end: bool,
    pub retry: RetryPolicy,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            portfolio: "standard".to_string(),
            start_date: NaiveDate::from_ymd_opt(2021, 1, 17).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2021, 12, 26).unwrap_or_default(),
            cadence_days: 7,
            top_k: 10,
            min_analysts: 5,
            max_dispersion: 100.0,
            min_expected_return: None,
            initial_capital: Decimal::ONE_HUNDRED,
            liquidate_at_end: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.portfolio.trim().is_empty() {
            return Err(BacktestError::InvalidConfig("portfolio name is empty".into()));
        }
        if self.end_date < self.start_date {
            return Err(BacktestError::InvalidConfig(format!(
                "end date {} precedes start date {}",
                self.end_date, self.start_date
            )));
        }
        if self.cadence_days <= 0 {
            return Err(BacktestError::InvalidConfig(
                "cadence must be at least one day".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(BacktestError::InvalidConfig("top_k must be positive".into()));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::InvalidConfig(
                "initial capital must be positive".into(),
            ));
        }
        if !self.max_dispersion.is_finite() || self.max_dispersion < 0.0 {
            return Err(BacktestError::InvalidConfig(
                "max dispersion must be a non-negative number".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BacktestError::InvalidConfig(
                "retry policy needs at least one attempt".into(),
            ));
        }
        Ok(())
    }

    pub fn cadence(&self) -> Duration {
        Duration::days(self.cadence_days)
    }
}

/// One position in the ledger: opened on `evaluation_date`, closed once a
/// later rebalance supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub portfolio: String,
    pub evaluation_date: NaiveDate,
    pub rank: i64,
    pub asset_id: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_value: Decimal,
    pub current_price: Decimal,
    pub current_value: Decimal,
    pub valued_on: NaiveDate,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<Decimal>,
    pub exit_value: Option<Decimal>,
    pub evolution: Option<Decimal>,
}

impl LedgerEntry {
    pub fn open(
        portfolio: &str,
        date: NaiveDate,
        rank: i64,
        asset_id: &str,
        entry_price: Decimal,
        entry_value: Decimal,
    ) -> Self {
        Self {
            portfolio: portfolio.to_string(),
            evaluation_date: date,
            rank,
            asset_id: asset_id.to_string(),
            entry_price,
            quantity: entry_value / entry_price,
            entry_value,
            current_price: entry_price,
            current_value: entry_value,
            valued_on: date,
            exit_date: None,
            exit_price: None,
            exit_value: None,
            evolution: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_date.is_none()
    }

    /// Mark to market without touching the entry basis.
    pub fn marked(&self, date: NaiveDate, price: Decimal) -> Self {
        Self {
            current_price: price,
            current_value: self.quantity * price,
            valued_on: date,
            ..self.clone()
        }
    }

    pub fn closed(&self, date: NaiveDate, price: Decimal) -> Self {
        let exit_value = self.quantity * price;
        Self {
            current_price: price,
            current_value: exit_value,
            valued_on: date,
            exit_date: Some(date),
            exit_price: Some(price),
            exit_value: Some(exit_value),
            evolution: Some(exit_value - self.entry_value),
            ..self.clone()
        }
    }
}

/// What a step did to the portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodAction {
    /// Open set replaced by a new equal-weighted selection.
    Rebalance,
    /// Open set carried forward and marked to market.
    Hold,
    /// Everything closed into cash.
    Liquidate,
}

impl fmt::Display for PeriodAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodAction::Rebalance => write!(f, "rebalance"),
            PeriodAction::Hold => write!(f, "hold"),
            PeriodAction::Liquidate => write!(f, "liquidate"),
        }
    }
}

impl FromStr for PeriodAction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rebalance" => Ok(PeriodAction::Rebalance),
            "hold" => Ok(PeriodAction::Hold),
            "liquidate" => Ok(PeriodAction::Liquidate),
            other => Err(LedgerError::Corrupt {
                column: "action".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Marker row written with every committed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodCheckpoint {
    pub portfolio: String,
    pub evaluation_date: NaiveDate,
    pub action: PeriodAction,
    pub total_value: Decimal,
    /// Value not invested in any open entry after the step.
    pub cash: Decimal,
    pub opened: i64,
    pub closed: i64,
}

/// Everything one step writes, applied in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodWrite {
    pub checkpoint: PeriodCheckpoint,
    pub closed: Vec<LedgerEntry>,
    pub marked: Vec<LedgerEntry>,
    pub opened: Vec<LedgerEntry>,
}

impl PeriodWrite {
    pub fn evaluation_date(&self) -> NaiveDate {
        self.checkpoint.evaluation_date
    }

    pub fn rows(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.closed.iter().chain(&self.marked).chain(&self.opened)
    }
}

/// Open entries plus uninvested cash, rebuilt from the ledger at the start
/// of every run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioState {
    pub open: Vec<LedgerEntry>,
    pub cash: Decimal,
    pub last_checkpoint: Option<PeriodCheckpoint>,
}

impl PortfolioState {
    pub fn total_value(&self) -> Decimal {
        self.open.iter().map(|e| e.current_value).sum::<Decimal>() + self.cash
    }

    /// Fold a committed step into the in-memory state.
    pub fn apply(&mut self, write: &PeriodWrite) {
        self.open.retain(|e| {
            !write
                .closed
                .iter()
                .any(|c| c.asset_id == e.asset_id && c.evaluation_date == e.evaluation_date)
        });
        for marked in &write.marked {
            if let Some(entry) = self
                .open
                .iter_mut()
                .find(|e| e.asset_id == marked.asset_id && e.evaluation_date == marked.evaluation_date)
            {
                *entry = marked.clone();
            }
        }
        self.open.extend(write.opened.iter().cloned());
        self.cash = write.checkpoint.cash;
        self.last_checkpoint = Some(write.checkpoint.clone());
    }
}

/// Summary of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub portfolio: String,
    /// Value carried into the first period processed by this run.
    pub starting_value: Decimal,
    pub final_value: Decimal,
    pub total_return_percent: f64,
    pub max_drawdown_percent: f64,
    /// Sample standard deviation of period-over-period returns, in percent.
    pub period_return_std_dev: Option<f64>,
    /// Sum of `evolution` over entries closed during this run.
    pub realized_evolution: Decimal,
    pub periods: Vec<PeriodCheckpoint>,
}
