use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ratings (
        rating_id TEXT PRIMARY KEY,
        asset_id TEXT NOT NULL,
        analyst_id TEXT NOT NULL,
        date TEXT NOT NULL,
        adjusted_price_target REAL NOT NULL,
        analyst_overall_success_rate REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ratings_date ON ratings(date)",
    "CREATE INDEX IF NOT EXISTS idx_ratings_asset_analyst ON ratings(asset_id, analyst_id, date)",
    "CREATE TABLE IF NOT EXISTS prices (
        asset_id TEXT NOT NULL,
        date TEXT NOT NULL,
        close TEXT NOT NULL,
        PRIMARY KEY (asset_id, date)
    )",
    "CREATE INDEX IF NOT EXISTS idx_prices_date ON prices(date)",
    "CREATE TABLE IF NOT EXISTS ranking_snapshots (
        asset_id TEXT NOT NULL,
        evaluation_date TEXT NOT NULL,
        last_close_price TEXT NOT NULL,
        last_update_date TEXT NOT NULL,
        days_since_last_update INTEGER NOT NULL,
        avg_days_since_last_update REAL NOT NULL,
        analyst_count INTEGER NOT NULL,
        average_price_target REAL,
        dispersion REAL,
        expected_return REAL,
        analyst_count_recent INTEGER NOT NULL,
        average_price_target_recent REAL,
        dispersion_recent REAL,
        expected_return_recent REAL,
        analyst_count_high_success INTEGER NOT NULL,
        average_price_target_high_success REAL,
        dispersion_high_success REAL,
        expected_return_high_success REAL,
        analyst_count_combined INTEGER NOT NULL,
        average_price_target_combined REAL,
        dispersion_combined REAL,
        expected_return_combined REAL,
        PRIMARY KEY (asset_id, evaluation_date)
    )",
    "CREATE INDEX IF NOT EXISTS idx_rankings_date ON ranking_snapshots(evaluation_date)",
    "CREATE TABLE IF NOT EXISTS ranking_dates (
        evaluation_date TEXT PRIMARY KEY,
        asset_count INTEGER NOT NULL
    )",
];

/// SQLite-backed store for ratings, closes and ranking snapshots.
#[derive(Clone)]
pub struct MarketDb {
    pool: SqlitePool,
}

impl MarketDb {
    /// Open (creating if missing) the database at `database_url` and make sure
    /// the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!("Market database connected: {}", database_url);
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool (in-memory pools in tests).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Decimals are stored as TEXT so they round-trip exactly.
pub(crate) fn parse_decimal(column: &str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|_| StoreError::CorruptValue {
        column: column.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) async fn memory_db() -> MarketDb {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory SQLite");
    MarketDb::from_pool(pool).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_db_creation() {
        let db = memory_db().await;
        assert!(db.pool().acquire().await.is_ok());
        // schema creation is repeatable
        db.init_schema().await.unwrap();
    }

    #[test]
    fn corrupt_decimal_is_reported_with_column() {
        let err = parse_decimal("close", "abc").unwrap_err();
        assert!(err.to_string().contains("close"));
    }
}
