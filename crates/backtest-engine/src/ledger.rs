use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::LedgerError;
use crate::models::{LedgerEntry, PeriodCheckpoint, PeriodWrite, PortfolioState};

/// Persistent record of every position the backtest opens and closes.
///
/// `apply_period` is the only write. It must land all rows of a step and its
/// checkpoint atomically and must be an idempotent upsert keyed by
/// `(portfolio, evaluation_date, asset_id)`, so replaying a committed step
/// leaves the ledger unchanged.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open entries, cash and the last committed checkpoint of `portfolio`.
    async fn load_state(&self, portfolio: &str) -> Result<PortfolioState, LedgerError>;

    async fn apply_period(&self, write: &PeriodWrite) -> Result<(), LedgerError>;

    async fn open_holdings(&self, portfolio: &str) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Entries opened on `date`.
    async fn entries_on(
        &self,
        portfolio: &str,
        date: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn entries_for_asset(
        &self,
        portfolio: &str,
        asset_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn checkpoints(&self, portfolio: &str) -> Result<Vec<PeriodCheckpoint>, LedgerError>;
}
