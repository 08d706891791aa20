mod config;
mod pipeline;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use backtest_engine::{
    run_backtest, BacktestConfig, BacktestReport, LedgerDb, LedgerEntry, LedgerStore,
    MemoryLedger,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use config::PipelineConfig;
use consensus_core::{Cohort, RankingSnapshot};
use market_store::{parse_price_csv, parse_rating_csv, ImportResult, MarketDb};

#[derive(Parser)]
#[command(name = "consensus")]
#[command(about = "Analyst price-target consensus rankings and weekly backtest", long_about = None)]
#[command(version)]
struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Portfolio namespace for ledger rows (overrides PORTFOLIO)
    #[arg(short, long, global = true)]
    portfolio: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Import daily closes from a CSV file
    ImportPrices {
        path: PathBuf,

        /// Asset id for files without a ticker column (defaults to the file name)
        #[arg(short, long)]
        ticker: Option<String>,
    },

    /// Import analyst rating events from a CSV file
    ImportRatings { path: PathBuf },

    /// Compute weekly ranking snapshots
    Rankings {
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Recompute dates that already have snapshots
        #[arg(long)]
        recompute: bool,
    },

    /// Replay the weekly top-k rebalance into the ledger
    Backtest {
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Only hold assets whose expected return exceeds this percentage
        #[arg(long)]
        min_expected_return: Option<f64>,

        /// Close every position on the last evaluation date
        #[arg(long)]
        liquidate: bool,

        /// Run against an in-memory ledger and leave the database untouched
        #[arg(long)]
        dry_run: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show currently open positions
    Holdings,

    /// Show ledger rows for one evaluation date or one asset
    Ledger {
        #[arg(long, conflicts_with = "asset")]
        date: Option<NaiveDate>,

        #[arg(long)]
        asset: Option<String>,
    },

    /// Show the best ranked assets for a date
    Top {
        /// Evaluation date (defaults to the latest stored snapshot)
        #[arg(long)]
        date: Option<NaiveDate>,

        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Analyst cohort to show statistics for (all, recent, high_success, combined)
        #[arg(short, long, default_value = "all")]
        cohort: Cohort,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "consensus=info,backtest_engine=info,market_store=info,signal_aggregator=info",
            )
        })
    };
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = cli.db {
        config.database_url = db;
    }
    if let Some(portfolio) = cli.portfolio {
        config.portfolio = portfolio;
    }

    let market = MarketDb::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    match cli.command {
        Commands::ImportPrices { path, ticker } => {
            let data = read_file(&path)?;
            let ticker = ticker.or_else(|| file_stem(&path));
            let (closes, result) = parse_price_csv(&data, ticker.as_deref())?;
            let stored = market.upsert_closes(&closes).await?;
            print_import("closes", stored, &result);
        }

        Commands::ImportRatings { path } => {
            let data = read_file(&path)?;
            let (ratings, result) = parse_rating_csv(&data)?;
            let stored = market.upsert_ratings(&ratings).await?;
            print_import("rating events", stored, &result);
        }

        Commands::Rankings {
            start,
            end,
            recompute,
        } => {
            let start = start.unwrap_or(config.start_date);
            let end = end.unwrap_or(config.end_date);
            if end < start {
                bail!("end date {end} precedes start date {start}");
            }
            let summary = pipeline::refresh_rankings(
                &market,
                &config.aggregator(),
                start,
                end,
                config.cadence_days,
                recompute,
            )
            .await?;
            match summary.last_date {
                Some(last) => println!(
                    "Stored {} ranking rows over {} dates (through {})",
                    summary.rows, summary.dates, last
                ),
                None => println!("Rankings already up to date"),
            }
        }

        Commands::Backtest {
            start,
            end,
            top_k,
            min_expected_return,
            liquidate,
            dry_run,
            format,
        } => {
            let mut bt = config.backtest();
            if let Some(start) = start {
                bt.start_date = start;
            }
            if let Some(end) = end {
                bt.end_date = end;
            }
            if let Some(k) = top_k {
                bt.top_k = k;
            }
            if min_expected_return.is_some() {
                bt.min_expected_return = min_expected_return;
            }
            bt.liquidate_at_end |= liquidate;

            let report = if dry_run {
                tracing::info!("Dry run: ledger writes stay in memory");
                backtest(&market, &MemoryLedger::new(), &bt).await?
            } else {
                let ledger = LedgerDb::new(market.pool().clone()).await?;
                backtest(&market, &ledger, &bt).await?
            };

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_report(&report),
            }
        }

        Commands::Holdings => {
            let ledger = LedgerDb::new(market.pool().clone()).await?;
            let open = ledger.open_holdings(&config.portfolio).await?;
            if open.is_empty() {
                println!("No open positions in portfolio '{}'", config.portfolio);
            } else {
                print_entries(&open);
            }
        }

        Commands::Ledger { date, asset } => {
            let ledger = LedgerDb::new(market.pool().clone()).await?;
            let entries = match (date, asset) {
                (Some(date), _) => ledger.entries_on(&config.portfolio, date).await?,
                (None, Some(asset)) => {
                    ledger
                        .entries_for_asset(&config.portfolio, &asset)
                        .await?
                }
                (None, None) => bail!("pass --date or --asset"),
            };
            print_entries(&entries);
        }

        Commands::Top {
            date,
            limit,
            cohort,
        } => {
            let date = match date {
                Some(date) => date,
                None => match market.latest_ranking_date().await? {
                    Some(date) => date,
                    None => bail!("no ranking snapshots stored; run `consensus rankings` first"),
                },
            };
            let rankings = market.rankings_on(date).await?;
            println!(
                "Top {} of {} ranked assets on {} ({} analysts)",
                limit.min(rankings.len()),
                rankings.len(),
                date,
                cohort
            );
            println!("{}", ranking_header());
            for (i, row) in rankings.iter().take(limit).enumerate() {
                println!("{}", ranking_line(i + 1, row, cohort));
            }
        }
    }

    Ok(())
}

async fn backtest<L: LedgerStore>(
    market: &MarketDb,
    ledger: &L,
    config: &BacktestConfig,
) -> Result<BacktestReport> {
    match run_backtest(market, ledger, config).await {
        Ok(report) => Ok(report),
        Err(e) => {
            tracing::error!("Backtest halted: {}", e);
            if let Some(date) = e.evaluation_date() {
                eprintln!(
                    "Halted at {date}; periods before it are committed and a rerun resumes there"
                );
            }
            Err(e.into())
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_uppercase())
}

fn fmt_num(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
}

fn ranking_header() -> String {
    format!(
        "{:<4} {:<8} {:>10} {:>9} {:>9} {:>8}",
        "#", "Asset", "Close", "Analysts", "ExpRet%", "Disp"
    )
}

/// Dispersion is the std-dev of price targets, in price units.
fn ranking_line(position: usize, row: &RankingSnapshot, cohort: Cohort) -> String {
    let stats = row.cohort(cohort);
    format!(
        "{:<4} {:<8} {:>10} {:>9} {:>9} {:>8}",
        position,
        row.asset_id,
        row.last_close_price.round_dp(2),
        stats.analyst_count,
        fmt_num(stats.expected_return),
        fmt_num(stats.dispersion),
    )
}

fn print_import(what: &str, stored: usize, result: &ImportResult) {
    println!(
        "Imported {} {} ({} skipped, {} errors)",
        stored,
        what,
        result.skipped,
        result.errors.len()
    );
    for err in result.errors.iter().take(10) {
        println!("  {err}");
    }
}

fn print_report(report: &BacktestReport) {
    println!("Portfolio:        {}", report.portfolio);
    println!("Periods:          {}", report.periods.len());
    println!("Starting value:   {}", report.starting_value.round_dp(4));
    println!("Final value:      {}", report.final_value.round_dp(4));
    println!("Total return:     {:.2}%", report.total_return_percent);
    println!("Max drawdown:     {:.2}%", report.max_drawdown_percent);
    if let Some(sd) = report.period_return_std_dev {
        println!("Period std dev:   {sd:.2}%");
    }
    println!("Realized P/L:     {}", report.realized_evolution.round_dp(4));
}

fn print_entries(entries: &[LedgerEntry]) {
    println!(
        "{:<11} {:<4} {:<8} {:>10} {:>10} {:>10} {:<11} {:>10}",
        "Opened", "Rank", "Asset", "Entry", "Current", "Value", "Exit", "Evolution"
    );
    for e in entries {
        println!(
            "{:<11} {:<4} {:<8} {:>10} {:>10} {:>10} {:<11} {:>10}",
            e.evaluation_date,
            e.rank,
            e.asset_id,
            e.entry_price.round_dp(2),
            e.current_price.round_dp(2),
            e.current_value.round_dp(4),
            e.exit_date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            e.evolution
                .map(|v| v.round_dp(4).to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}
