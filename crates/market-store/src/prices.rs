use async_trait::async_trait;
use chrono::NaiveDate;
use consensus_core::{ClosePrice, ConsensusError, PriceSnapshot, PriceSource};

use crate::db::{parse_decimal, MarketDb};
use crate::error::StoreError;

#[derive(sqlx::FromRow)]
struct CloseRow {
    asset_id: String,
    date: NaiveDate,
    close: String,
}

impl CloseRow {
    fn into_close(self) -> Result<ClosePrice, StoreError> {
        let close = parse_decimal("close", &self.close)?;
        Ok(ClosePrice::new(self.asset_id, self.date, close))
    }
}

impl MarketDb {
    /// Upsert closes keyed by `(asset_id, date)`.
    pub async fn upsert_closes(&self, closes: &[ClosePrice]) -> Result<usize, StoreError> {
        let mut tx = self.pool().begin().await?;
        for c in closes {
            sqlx::query(
                "INSERT INTO prices (asset_id, date, close) VALUES (?, ?, ?)
                 ON CONFLICT(asset_id, date) DO UPDATE SET close = excluded.close",
            )
            .bind(&c.asset_id)
            .bind(c.date)
            .bind(c.close.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::debug!("Upserted {} closes", closes.len());
        Ok(closes.len())
    }

    /// Latest close per asset on or before `as_of`, together with the latest
    /// positive close for assets whose most recent print is zero.
    pub async fn prices_as_of(&self, as_of: NaiveDate) -> Result<PriceSnapshot, StoreError> {
        let latest = sqlx::query_as::<_, CloseRow>(
            "SELECT p.asset_id, p.date, p.close
             FROM prices p
             JOIN (
                SELECT asset_id, MAX(date) AS max_date
                FROM prices WHERE date <= ?
                GROUP BY asset_id
             ) m ON p.asset_id = m.asset_id AND p.date = m.max_date",
        )
        .bind(as_of)
        .fetch_all(self.pool())
        .await?;

        let latest_positive = sqlx::query_as::<_, CloseRow>(
            "SELECT p.asset_id, p.date, p.close
             FROM prices p
             JOIN (
                SELECT asset_id, MAX(date) AS max_date
                FROM prices WHERE date <= ? AND CAST(close AS REAL) > 0
                GROUP BY asset_id
             ) m ON p.asset_id = m.asset_id AND p.date = m.max_date",
        )
        .bind(as_of)
        .fetch_all(self.pool())
        .await?;

        let mut snapshot = PriceSnapshot::new(as_of);
        for row in latest.into_iter().chain(latest_positive) {
            snapshot.observe(row.into_close()?);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl PriceSource for MarketDb {
    async fn prices_as_of(&self, as_of: NaiveDate) -> Result<PriceSnapshot, ConsensusError> {
        Ok(MarketDb::prices_as_of(self, as_of).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;
    use rust_decimal_macros::dec;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    #[tokio::test]
    async fn snapshot_matches_in_memory_resolution() {
        let db = memory_db().await;
        let closes = vec![
            ClosePrice::new("AAA", d(1, 5), dec!(50)),
            ClosePrice::new("AAA", d(1, 12), dec!(0)),
            ClosePrice::new("AAA", d(1, 19), dec!(55.25)),
            ClosePrice::new("BBB", d(1, 12), dec!(7.125)),
        ];
        db.upsert_closes(&closes).await.unwrap();

        let snap = db.prices_as_of(d(1, 15)).await.unwrap();
        assert_eq!(snap.latest("AAA").unwrap().close, dec!(0));
        assert_eq!(snap.valuation_price("AAA"), Some(dec!(50)));
        assert_eq!(snap.valuation_price("BBB"), Some(dec!(7.125)));

        let expected = PriceSnapshot::from_history(d(1, 15), &closes);
        for asset in ["AAA", "BBB"] {
            assert_eq!(snap.latest(asset), expected.latest(asset));
            assert_eq!(snap.latest_positive(asset), expected.latest_positive(asset));
        }
    }

    #[tokio::test]
    async fn close_upsert_overwrites() {
        let db = memory_db().await;
        db.upsert_closes(&[ClosePrice::new("AAA", d(2, 1), dec!(10))])
            .await
            .unwrap();
        db.upsert_closes(&[ClosePrice::new("AAA", d(2, 1), dec!(10.5))])
            .await
            .unwrap();
        let snap = db.prices_as_of(d(2, 1)).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.latest("AAA").unwrap().close, dec!(10.5));
    }
}
