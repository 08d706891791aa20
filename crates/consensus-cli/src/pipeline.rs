use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use market_store::MarketDb;
use signal_aggregator::{rank_with_snapshot, AggregatorConfig};

/// Summary of one `rankings` pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshSummary {
    pub dates: usize,
    pub rows: usize,
    pub last_date: Option<NaiveDate>,
}

/// Compute and store ranking snapshots for every cadence step in
/// `[start, end]`.
///
/// Unless `recompute` is set, dates up to the latest computed date are
/// skipped and the pass resumes one cadence step after it.
pub async fn refresh_rankings(
    db: &MarketDb,
    config: &AggregatorConfig,
    start: NaiveDate,
    end: NaiveDate,
    cadence_days: i64,
    recompute: bool,
) -> Result<RefreshSummary> {
    config.validate()?;
    let cadence = Duration::days(cadence_days);

    let mut date = start;
    if !recompute {
        if let Some(latest) = db.latest_ranking_date().await? {
            if latest >= start {
                date = latest + cadence;
                tracing::info!("Rankings stored through {}, resuming at {}", latest, date);
            }
        }
    }

    let mut summary = RefreshSummary::default();
    while date <= end {
        let ratings = db
            .ratings_as_of(date)
            .await
            .with_context(|| format!("loading ratings as of {date}"))?;
        let prices = db
            .prices_as_of(date)
            .await
            .with_context(|| format!("loading closes as of {date}"))?;

        let rows = rank_with_snapshot(date, &ratings, &prices, config)?;
        db.save_rankings(date, &rows)
            .await
            .with_context(|| format!("saving rankings for {date}"))?;

        tracing::info!(
            "{}: ranked {} assets from {} rating events",
            date,
            rows.len(),
            ratings.len()
        );
        summary.dates += 1;
        summary.rows += rows.len();
        summary.last_date = Some(date);
        date += cadence;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_core::{ClosePrice, RatingEvent};
    use rust_decimal_macros::dec;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_db() -> MarketDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MarketDb::from_pool(pool).await.unwrap()
    }

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn rating(id: &str, analyst: &str, date: NaiveDate, target: f64) -> RatingEvent {
        RatingEvent {
            rating_id: id.to_string(),
            asset_id: "AAA".to_string(),
            analyst_id: analyst.to_string(),
            as_of_date: date,
            adjusted_price_target: target,
            analyst_overall_success_rate: 60.0,
        }
    }

    #[tokio::test]
    async fn test_weekly_refresh_resumes_after_latest_date() {
        let db = memory_db().await;
        db.upsert_ratings(&[
            rating("1", "a1", d(1, 3), 120.0),
            rating("2", "a2", d(1, 10), 130.0),
        ])
        .await
        .unwrap();
        db.upsert_closes(&[
            ClosePrice::new("AAA", d(1, 5), dec!(100)),
            ClosePrice::new("AAA", d(1, 12), dec!(110)),
        ])
        .await
        .unwrap();

        let config = AggregatorConfig::default();
        let first = refresh_rankings(&db, &config, d(1, 7), d(1, 14), 7, false)
            .await
            .unwrap();
        assert_eq!(first.dates, 2);
        assert_eq!(first.last_date, Some(d(1, 14)));

        // week one sees a single analyst and the 100 close
        let week1 = db.ranking_for("AAA", d(1, 7)).await.unwrap().unwrap();
        assert_eq!(week1.all.analyst_count, 1);
        assert_eq!(week1.last_close_price, dec!(100));

        let second = refresh_rankings(&db, &config, d(1, 7), d(1, 21), 7, false)
            .await
            .unwrap();
        assert_eq!(second.dates, 1);
        assert_eq!(second.last_date, Some(d(1, 21)));

        let again = refresh_rankings(&db, &config, d(1, 7), d(1, 21), 7, true)
            .await
            .unwrap();
        assert_eq!(again.dates, 3);
    }

    #[tokio::test]
    async fn test_dates_before_any_data_are_marked_computed() {
        let db = memory_db().await;
        let summary = refresh_rankings(
            &db,
            &AggregatorConfig::default(),
            d(1, 7),
            d(1, 14),
            7,
            false,
        )
        .await
        .unwrap();
        assert_eq!(summary.dates, 2);
        assert_eq!(summary.rows, 0);
        assert!(db.rankings_on(d(1, 14)).await.unwrap().is_empty());
        assert_eq!(db.latest_ranking_date().await.unwrap(), Some(d(1, 14)));

        // a second pass has nothing left to do
        let again = refresh_rankings(
            &db,
            &AggregatorConfig::default(),
            d(1, 7),
            d(1, 14),
            7,
            false,
        )
        .await
        .unwrap();
        assert_eq!(again.dates, 0);
    }
}
