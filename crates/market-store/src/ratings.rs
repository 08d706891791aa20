use async_trait::async_trait;
use chrono::NaiveDate;
use consensus_core::{ConsensusError, RatingEvent, RatingSource};

use crate::db::MarketDb;
use crate::error::StoreError;

#[derive(sqlx::FromRow)]
struct RatingRow {
    rating_id: String,
    asset_id: String,
    analyst_id: String,
    date: NaiveDate,
    adjusted_price_target: f64,
    analyst_overall_success_rate: f64,
}

impl From<RatingRow> for RatingEvent {
    fn from(r: RatingRow) -> Self {
        RatingEvent {
            rating_id: r.rating_id,
            asset_id: r.asset_id,
            analyst_id: r.analyst_id,
            as_of_date: r.date,
            adjusted_price_target: r.adjusted_price_target,
            analyst_overall_success_rate: r.analyst_overall_success_rate,
        }
    }
}

impl MarketDb {
    /// Upsert rating events keyed by `rating_id`. Returns the number written.
    pub async fn upsert_ratings(&self, ratings: &[RatingEvent]) -> Result<usize, StoreError> {
        let mut tx = self.pool().begin().await?;
        for r in ratings {
            sqlx::query(
                "INSERT INTO ratings (rating_id, asset_id, analyst_id, date, adjusted_price_target, analyst_overall_success_rate)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(rating_id) DO UPDATE SET
                    asset_id = excluded.asset_id,
                    analyst_id = excluded.analyst_id,
                    date = excluded.date,
                    adjusted_price_target = excluded.adjusted_price_target,
                    analyst_overall_success_rate = excluded.analyst_overall_success_rate",
            )
            .bind(&r.rating_id)
            .bind(&r.asset_id)
            .bind(&r.analyst_id)
            .bind(r.as_of_date)
            .bind(r.adjusted_price_target)
            .bind(r.analyst_overall_success_rate)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::debug!("Upserted {} rating events", ratings.len());
        Ok(ratings.len())
    }

    /// Every rating dated on or before `as_of`.
    pub async fn ratings_as_of(&self, as_of: NaiveDate) -> Result<Vec<RatingEvent>, StoreError> {
        let rows = sqlx::query_as::<_, RatingRow>(
            "SELECT rating_id, asset_id, analyst_id, date, adjusted_price_target, analyst_overall_success_rate
             FROM ratings WHERE date <= ? ORDER BY asset_id, analyst_id, date",
        )
        .bind(as_of)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(RatingEvent::from).collect())
    }
}

#[async_trait]
impl RatingSource for MarketDb {
    async fn ratings_as_of(&self, as_of: NaiveDate) -> Result<Vec<RatingEvent>, ConsensusError> {
        Ok(MarketDb::ratings_as_of(self, as_of).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;

    fn rating(id: &str, date: NaiveDate, target: f64) -> RatingEvent {
        RatingEvent {
            rating_id: id.to_string(),
            asset_id: "AAA".to_string(),
            analyst_id: "alice".to_string(),
            as_of_date: date,
            adjusted_price_target: target,
            analyst_overall_success_rate: 65.0,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_rating_id() {
        let db = memory_db().await;
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        db.upsert_ratings(&[rating("r1", day, 100.0)]).await.unwrap();
        db.upsert_ratings(&[rating("r1", day, 120.0)]).await.unwrap();

        let rows = db.ratings_as_of(day).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].adjusted_price_target, 120.0);
    }

    #[tokio::test]
    async fn as_of_filter_excludes_future_ratings() {
        let db = memory_db().await;
        let early = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let late = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        db.upsert_ratings(&[rating("r1", early, 100.0), rating("r2", late, 110.0)])
            .await
            .unwrap();

        let rows = db.ratings_as_of(early).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rating_id, "r1");
    }
}
