use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnection, SqlitePool};

use crate::error::LedgerError;
use crate::ledger::LedgerStore;
use crate::models::{LedgerEntry, PeriodAction, PeriodCheckpoint, PeriodWrite, PortfolioState};

const ENTRY_COLUMNS: &str = "portfolio, evaluation_date, rank, asset_id,
    entry_price, quantity, entry_value, current_price, current_value, valued_on,
    exit_date, exit_price, exit_value, evolution";

/// Persists ledger entries and period checkpoints in SQLite.
#[derive(Clone)]
pub struct LedgerDb {
    pool: SqlitePool,
}

impl LedgerDb {
    /// Wrap `pool` and create the ledger tables if they don't exist.
    pub async fn new(pool: SqlitePool) -> Result<Self, LedgerError> {
        let db = Self { pool };
        db.init_tables().await?;
        Ok(db)
    }

    async fn init_tables(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                portfolio TEXT NOT NULL,
                evaluation_date TEXT NOT NULL,
                rank INTEGER NOT NULL,
                asset_id TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_value TEXT NOT NULL,
                current_price TEXT NOT NULL,
                current_value TEXT NOT NULL,
                valued_on TEXT NOT NULL,
                exit_date TEXT,
                exit_price TEXT,
                exit_value TEXT,
                evolution TEXT,
                PRIMARY KEY (portfolio, evaluation_date, asset_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_open ON ledger_entries(portfolio, exit_date)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_asset ON ledger_entries(portfolio, asset_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backtest_periods (
                portfolio TEXT NOT NULL,
                evaluation_date TEXT NOT NULL,
                action TEXT NOT NULL,
                total_value TEXT NOT NULL,
                cash TEXT NOT NULL,
                opened INTEGER NOT NULL,
                closed INTEGER NOT NULL,
                PRIMARY KEY (portfolio, evaluation_date)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_entries(
        &self,
        filter: &str,
        portfolio: &str,
        arg: Option<String>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_entries(&mut conn, filter, portfolio, arg).await
    }
}

async fn fetch_entries(
    conn: &mut SqliteConnection,
    filter: &str,
    portfolio: &str,
    arg: Option<String>,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM ledger_entries WHERE portfolio = ? AND {}
         ORDER BY evaluation_date, rank, asset_id",
        ENTRY_COLUMNS, filter
    );
    let mut query = sqlx::query_as::<_, EntryRow>(&sql).bind(portfolio);
    if let Some(arg) = arg {
        query = query.bind(arg);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(EntryRow::into_entry).collect()
}

async fn last_checkpoint(
    conn: &mut SqliteConnection,
    portfolio: &str,
) -> Result<Option<PeriodCheckpoint>, LedgerError> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT portfolio, evaluation_date, action, total_value, cash, opened, closed
         FROM backtest_periods WHERE portfolio = ?
         ORDER BY evaluation_date DESC LIMIT 1",
    )
    .bind(portfolio)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(CheckpointRow::into_checkpoint).transpose()
}

#[async_trait]
impl LedgerStore for LedgerDb {
    async fn load_state(&self, portfolio: &str) -> Result<PortfolioState, LedgerError> {
        // Holdings and cash must come from the same committed period.
        let mut tx = self.pool.begin().await?;
        let open = fetch_entries(&mut tx, "exit_date IS NULL", portfolio, None).await?;
        let checkpoint = last_checkpoint(&mut tx, portfolio).await?;
        tx.commit().await?;
        Ok(PortfolioState {
            open,
            cash: checkpoint.as_ref().map(|c| c.cash).unwrap_or_default(),
            last_checkpoint: checkpoint,
        })
    }

    async fn apply_period(&self, write: &PeriodWrite) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        for e in write.rows() {
            sqlx::query(
                "INSERT INTO ledger_entries (
                    portfolio, evaluation_date, rank, asset_id,
                    entry_price, quantity, entry_value, current_price, current_value, valued_on,
                    exit_date, exit_price, exit_value, evolution
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(portfolio, evaluation_date, asset_id) DO UPDATE SET
                    rank = excluded.rank,
                    entry_price = excluded.entry_price,
                    quantity = excluded.quantity,
                    entry_value = excluded.entry_value,
                    current_price = excluded.current_price,
                    current_value = excluded.current_value,
                    valued_on = excluded.valued_on,
                    exit_date = excluded.exit_date,
                    exit_price = excluded.exit_price,
                    exit_value = excluded.exit_value,
                    evolution = excluded.evolution",
            )
            .bind(&e.portfolio)
            .bind(e.evaluation_date)
            .bind(e.rank)
            .bind(&e.asset_id)
            .bind(e.entry_price.to_string())
            .bind(e.quantity.to_string())
            .bind(e.entry_value.to_string())
            .bind(e.current_price.to_string())
            .bind(e.current_value.to_string())
            .bind(e.valued_on)
            .bind(e.exit_date)
            .bind(e.exit_price.map(|v| v.to_string()))
            .bind(e.exit_value.map(|v| v.to_string()))
            .bind(e.evolution.map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;
        }

        let cp = &write.checkpoint;
        sqlx::query(
            "INSERT INTO backtest_periods (portfolio, evaluation_date, action, total_value, cash, opened, closed)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(portfolio, evaluation_date) DO UPDATE SET
                action = excluded.action,
                total_value = excluded.total_value,
                cash = excluded.cash,
                opened = excluded.opened,
                closed = excluded.closed",
        )
        .bind(&cp.portfolio)
        .bind(cp.evaluation_date)
        .bind(cp.action.to_string())
        .bind(cp.total_value.to_string())
        .bind(cp.cash.to_string())
        .bind(cp.opened)
        .bind(cp.closed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn open_holdings(&self, portfolio: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.fetch_entries("exit_date IS NULL", portfolio, None).await
    }

    async fn entries_on(
        &self,
        portfolio: &str,
        date: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.fetch_entries("evaluation_date = ?", portfolio, Some(date.to_string()))
            .await
    }

    async fn entries_for_asset(
        &self,
        portfolio: &str,
        asset_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.fetch_entries("asset_id = ?", portfolio, Some(asset_id.to_string()))
            .await
    }

    async fn checkpoints(&self, portfolio: &str) -> Result<Vec<PeriodCheckpoint>, LedgerError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT portfolio, evaluation_date, action, total_value, cash, opened, closed
             FROM backtest_periods WHERE portfolio = ? ORDER BY evaluation_date",
        )
        .bind(portfolio)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }
}

fn decimal(column: &str, value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value).map_err(|_| LedgerError::Corrupt {
        column: column.to_string(),
        value: value.to_string(),
    })
}

fn optional_decimal(column: &str, value: Option<&str>) -> Result<Option<Decimal>, LedgerError> {
    value.map(|v| decimal(column, v)).transpose()
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    portfolio: String,
    evaluation_date: NaiveDate,
    rank: i64,
    asset_id: String,
    entry_price: String,
    quantity: String,
    entry_value: String,
    current_price: String,
    current_value: String,
    valued_on: NaiveDate,
    exit_date: Option<NaiveDate>,
    exit_price: Option<String>,
    exit_value: Option<String>,
    evolution: Option<String>,
}

impl EntryRow {
    fn into_entry(self) -> Result<LedgerEntry, LedgerError> {
        Ok(LedgerEntry {
            entry_price: decimal("entry_price", &self.entry_price)?,
            quantity: decimal("quantity", &self.quantity)?,
            entry_value: decimal("entry_value", &self.entry_value)?,
            current_price: decimal("current_price", &self.current_price)?,
            current_value: decimal("current_value", &self.current_value)?,
            exit_price: optional_decimal("exit_price", self.exit_price.as_deref())?,
            exit_value: optional_decimal("exit_value", self.exit_value.as_deref())?,
            evolution: optional_decimal("evolution", self.evolution.as_deref())?,
            portfolio: self.portfolio,
            evaluation_date: self.evaluation_date,
            rank: self.rank,
            asset_id: self.asset_id,
            valued_on: self.valued_on,
            exit_date: self.exit_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    portfolio: String,
    evaluation_date: NaiveDate,
    action: String,
    total_value: String,
    cash: String,
    opened: i64,
    closed: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<PeriodCheckpoint, LedgerError> {
        Ok(PeriodCheckpoint {
            action: PeriodAction::from_str(&self.action)?,
            total_value: decimal("total_value", &self.total_value)?,
            cash: decimal("cash", &self.cash)?,
            portfolio: self.portfolio,
            evaluation_date: self.evaluation_date,
            opened: self.opened,
            closed: self.closed,
        })
    }
}

#[cfg(test)]
pub(crate) async fn memory_ledger_db() -> LedgerDb {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory SQLite");
    LedgerDb::new(pool).await.unwrap()
}
