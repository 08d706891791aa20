use async_trait::async_trait;
use chrono::NaiveDate;
use consensus_core::{CohortStats, ConsensusError, RankingSnapshot, RankingSource};

use crate::db::{parse_decimal, MarketDb};
use crate::error::StoreError;

const RANKING_COLUMNS: &str = "asset_id, evaluation_date, last_close_price, last_update_date,
    days_since_last_update, avg_days_since_last_update,
    analyst_count, average_price_target, dispersion, expected_return,
    analyst_count_recent, average_price_target_recent, dispersion_recent, expected_return_recent,
    analyst_count_high_success, average_price_target_high_success, dispersion_high_success, expected_return_high_success,
    analyst_count_combined, average_price_target_combined, dispersion_combined, expected_return_combined";

#[derive(sqlx::FromRow)]
struct RankingRow {
    asset_id: String,
    evaluation_date: NaiveDate,
    last_close_price: String,
    last_update_date: NaiveDate,
    days_since_last_update: i64,
    avg_days_since_last_update: f64,
    analyst_count: i64,
    average_price_target: Option<f64>,
    dispersion: Option<f64>,
    expected_return: Option<f64>,
    analyst_count_recent: i64,
    average_price_target_recent: Option<f64>,
    dispersion_recent: Option<f64>,
    expected_return_recent: Option<f64>,
    analyst_count_high_success: i64,
    average_price_target_high_success: Option<f64>,
    dispersion_high_success: Option<f64>,
    expected_return_high_success: Option<f64>,
    analyst_count_combined: i64,
    average_price_target_combined: Option<f64>,
    dispersion_combined: Option<f64>,
    expected_return_combined: Option<f64>,
}

impl RankingRow {
    fn into_snapshot(self) -> Result<RankingSnapshot, StoreError> {
        Ok(RankingSnapshot {
            last_close_price: parse_decimal("last_close_price", &self.last_close_price)?,
            asset_id: self.asset_id,
            evaluation_date: self.evaluation_date,
            last_update_date: self.last_update_date,
            days_since_last_update: self.days_since_last_update,
            avg_days_since_last_update: self.avg_days_since_last_update,
            all: CohortStats {
                analyst_count: self.analyst_count,
                average_price_target: self.average_price_target,
                dispersion: self.dispersion,
                expected_return: self.expected_return,
            },
            recent: CohortStats {
                analyst_count: self.analyst_count_recent,
                average_price_target: self.average_price_target_recent,
                dispersion: self.dispersion_recent,
                expected_return: self.expected_return_recent,
            },
            high_success: CohortStats {
                analyst_count: self.analyst_count_high_success,
                average_price_target: self.average_price_target_high_success,
                dispersion: self.dispersion_high_success,
                expected_return: self.expected_return_high_success,
            },
            combined: CohortStats {
                analyst_count: self.analyst_count_combined,
                average_price_target: self.average_price_target_combined,
                dispersion: self.dispersion_combined,
                expected_return: self.expected_return_combined,
            },
        })
    }
}

impl MarketDb {
    /// Replace the snapshot rows for `evaluation_date`.
    ///
    /// Rows from a previous run on the same date that no longer qualify are
    /// removed. The date is recorded as computed even when `rows` is empty.
    pub async fn save_rankings(
        &self,
        evaluation_date: NaiveDate,
        rows: &[RankingSnapshot],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM ranking_snapshots WHERE evaluation_date = ?")
            .bind(evaluation_date)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            let sql = format!(
                "INSERT INTO ranking_snapshots ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RANKING_COLUMNS
            );
            let mut query = sqlx::query(&sql)
                .bind(&row.asset_id)
                .bind(evaluation_date)
                .bind(row.last_close_price.to_string())
                .bind(row.last_update_date)
                .bind(row.days_since_last_update)
                .bind(row.avg_days_since_last_update);
            for stats in [&row.all, &row.recent, &row.high_success, &row.combined] {
                query = query
                    .bind(stats.analyst_count)
                    .bind(stats.average_price_target)
                    .bind(stats.dispersion)
                    .bind(stats.expected_return);
            }
            query.execute(&mut *tx).await?;
        }

        sqlx::query(
            "INSERT INTO ranking_dates (evaluation_date, asset_count) VALUES (?, ?)
             ON CONFLICT(evaluation_date) DO UPDATE SET asset_count = excluded.asset_count",
        )
        .bind(evaluation_date)
        .bind(rows.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.len())
    }

    /// Snapshot rows for one evaluation date, ordered by descending expected
    /// return. Rows with a null return sort last.
    pub async fn rankings_on(&self, date: NaiveDate) -> Result<Vec<RankingSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {} FROM ranking_snapshots WHERE evaluation_date = ?
             ORDER BY expected_return IS NULL, expected_return DESC, asset_id",
            RANKING_COLUMNS
        );
        let rows = sqlx::query_as::<_, RankingRow>(&sql)
            .bind(date)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(RankingRow::into_snapshot).collect()
    }

    /// Snapshot row for a single asset on a date.
    pub async fn ranking_for(
        &self,
        asset_id: &str,
        date: NaiveDate,
    ) -> Result<Option<RankingSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {} FROM ranking_snapshots WHERE asset_id = ? AND evaluation_date = ?",
            RANKING_COLUMNS
        );
        let row = sqlx::query_as::<_, RankingRow>(&sql)
            .bind(asset_id)
            .bind(date)
            .fetch_optional(self.pool())
            .await?;
        row.map(RankingRow::into_snapshot).transpose()
    }

    /// Most recent evaluation date the rankings have been computed for,
    /// whether or not any asset qualified on it.
    pub async fn latest_ranking_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let (date,): (Option<NaiveDate>,) =
            sqlx::query_as("SELECT MAX(evaluation_date) FROM ranking_dates")
                .fetch_one(self.pool())
                .await?;
        Ok(date)
    }
}

#[async_trait]
impl RankingSource for MarketDb {
    async fn rankings_on(&self, date: NaiveDate) -> Result<Vec<RankingSnapshot>, ConsensusError> {
        Ok(MarketDb::rankings_on(self, date).await?)
    }

    async fn latest_ranking_date(&self) -> Result<Option<NaiveDate>, ConsensusError> {
        Ok(MarketDb::latest_ranking_date(self).await?)
    }
}
