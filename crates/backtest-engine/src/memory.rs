use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::error::LedgerError;
use crate::ledger::LedgerStore;
use crate::models::{LedgerEntry, PeriodCheckpoint, PeriodWrite, PortfolioState};

type EntryKey = (String, NaiveDate, String);

#[derive(Default)]
struct Tables {
    entries: BTreeMap<EntryKey, LedgerEntry>,
    checkpoints: BTreeMap<(String, NaiveDate), PeriodCheckpoint>,
}

/// Ledger kept in process memory. Used for dry runs.
#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, ordered by portfolio, evaluation date and asset.
    pub async fn all_entries(&self) -> Vec<LedgerEntry> {
        self.tables.read().await.entries.values().cloned().collect()
    }
}

fn by_rank(mut rows: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    rows.sort_by(|a, b| {
        a.evaluation_date
            .cmp(&b.evaluation_date)
            .then(a.rank.cmp(&b.rank))
            .then_with(|| a.asset_id.cmp(&b.asset_id))
    });
    rows
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn load_state(&self, portfolio: &str) -> Result<PortfolioState, LedgerError> {
        let tables = self.tables.read().await;
        let open = tables
            .entries
            .values()
            .filter(|e| e.portfolio == portfolio && e.is_open())
            .cloned()
            .collect();
        let last_checkpoint = tables
            .checkpoints
            .values()
            .filter(|c| c.portfolio == portfolio)
            .max_by_key(|c| c.evaluation_date)
            .cloned();
        Ok(PortfolioState {
            open: by_rank(open),
            cash: last_checkpoint.as_ref().map(|c| c.cash).unwrap_or_default(),
            last_checkpoint,
        })
    }

    async fn apply_period(&self, write: &PeriodWrite) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        for row in write.rows() {
            let key = (
                row.portfolio.clone(),
                row.evaluation_date,
                row.asset_id.clone(),
            );
            tables.entries.insert(key, row.clone());
        }
        let cp = &write.checkpoint;
        tables
            .checkpoints
            .insert((cp.portfolio.clone(), cp.evaluation_date), cp.clone());
        Ok(())
    }

    async fn open_holdings(&self, portfolio: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.load_state(portfolio).await?.open)
    }

    async fn entries_on(
        &self,
        portfolio: &str,
        date: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let tables = self.tables.read().await;
        let rows = tables
            .entries
            .values()
            .filter(|e| e.portfolio == portfolio && e.evaluation_date == date)
            .cloned()
            .collect();
        Ok(by_rank(rows))
    }

    async fn entries_for_asset(
        &self,
        portfolio: &str,
        asset_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let tables = self.tables.read().await;
        let rows = tables
            .entries
            .values()
            .filter(|e| e.portfolio == portfolio && e.asset_id == asset_id)
            .cloned()
            .collect();
        Ok(by_rank(rows))
    }

    async fn checkpoints(&self, portfolio: &str) -> Result<Vec<PeriodCheckpoint>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .checkpoints
            .values()
            .filter(|c| c.portfolio == portfolio)
            .cloned()
            .collect())
    }
}
