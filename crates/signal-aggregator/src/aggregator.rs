use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use consensus_core::{
    ClosePrice, ConsensusError, PriceSnapshot, RankingSnapshot, RatingEvent, SuccessThreshold,
};
use rust_decimal::prelude::*;
use statrs::statistics::{Data, Median};

use crate::cohort::cohort_stats;
use crate::config::AggregatorConfig;

/// Compute one ranking row per asset as of `as_of`.
///
/// Ratings and closes dated after `as_of` are ignored, so callers may pass the
/// full history. Assets without a positive reference close on or before
/// `as_of` are dropped. Rows are ordered by descending overall expected
/// return, then by asset id.
pub fn compute_rankings(
    as_of: NaiveDate,
    ratings: &[RatingEvent],
    closes: &[ClosePrice],
    config: &AggregatorConfig,
) -> Vec<RankingSnapshot> {
    let prices = PriceSnapshot::from_history(as_of, closes);
    rank_against(as_of, ratings, &prices, config)
}

/// Same as [`compute_rankings`] but against an already resolved price view.
///
/// The snapshot must not be dated after `as_of`; otherwise it could carry
/// closes the evaluation date had not seen yet.
pub fn rank_with_snapshot(
    as_of: NaiveDate,
    ratings: &[RatingEvent],
    prices: &PriceSnapshot,
    config: &AggregatorConfig,
) -> Result<Vec<RankingSnapshot>, ConsensusError> {
    if prices.as_of() > as_of {
        return Err(ConsensusError::InvalidData(format!(
            "price snapshot dated {} is after evaluation date {}",
            prices.as_of(),
            as_of
        )));
    }
    Ok(rank_against(as_of, ratings, prices, config))
}

fn rank_against(
    as_of: NaiveDate,
    ratings: &[RatingEvent],
    prices: &PriceSnapshot,
    config: &AggregatorConfig,
) -> Vec<RankingSnapshot> {
    let latest = latest_per_analyst(as_of, ratings);
    if latest.is_empty() {
        return Vec::new();
    }

    let threshold = resolve_success_threshold(config.success_threshold, latest.values().copied());

    let mut by_asset: BTreeMap<&str, Vec<&RatingEvent>> = BTreeMap::new();
    for event in latest.values() {
        by_asset.entry(event.asset_id.as_str()).or_default().push(event);
    }

    let mut rows = Vec::with_capacity(by_asset.len());
    for (asset_id, mut events) in by_asset {
        // deterministic summation order
        events.sort_by(|a, b| a.analyst_id.cmp(&b.analyst_id));
        let reference = match prices.latest(asset_id) {
            Some(c) if c.close > Decimal::ZERO => c.close,
            Some(c) => {
                tracing::debug!(
                    "{}: reference close {} on {} is not positive, skipping",
                    asset_id,
                    c.close,
                    c.date
                );
                continue;
            }
            None => {
                tracing::debug!("{}: no close on or before {}, skipping", asset_id, as_of);
                continue;
            }
        };
        let reference_f64 = reference.to_f64().unwrap_or(0.0);

        let mut all = Vec::with_capacity(events.len());
        let mut recent = Vec::new();
        let mut high_success = Vec::new();
        let mut combined = Vec::new();
        let mut age_sum = 0i64;
        let mut last_update = events[0].as_of_date;

        for event in &events {
            let age = (as_of - event.as_of_date).num_days();
            let is_recent = age <= config.recent_window_days;
            let is_high = event.analyst_overall_success_rate > threshold;
            let target = event.adjusted_price_target;

            all.push(target);
            if is_recent {
                recent.push(target);
            }
            if is_high {
                high_success.push(target);
            }
            if is_recent && is_high {
                combined.push(target);
            }
            age_sum += age;
            last_update = last_update.max(event.as_of_date);
        }

        rows.push(RankingSnapshot {
            asset_id: asset_id.to_string(),
            evaluation_date: as_of,
            last_close_price: reference,
            last_update_date: last_update,
            days_since_last_update: (as_of - last_update).num_days(),
            avg_days_since_last_update: age_sum as f64 / events.len() as f64,
            all: cohort_stats(&all, reference_f64),
            recent: cohort_stats(&recent, reference_f64),
            high_success: cohort_stats(&high_success, reference_f64),
            combined: cohort_stats(&combined, reference_f64),
        });
    }

    rows.sort_by(|a, b| {
        let ea = a.all.expected_return.unwrap_or(f64::NEG_INFINITY);
        let eb = b.all.expected_return.unwrap_or(f64::NEG_INFINITY);
        eb.total_cmp(&ea).then_with(|| a.asset_id.cmp(&b.asset_id))
    });
    rows
}

/// Latest visible event per (asset, analyst). Same-day ties go to the larger
/// rating id.
fn latest_per_analyst<'a>(
    as_of: NaiveDate,
    ratings: &'a [RatingEvent],
) -> HashMap<(&'a str, &'a str), &'a RatingEvent> {
    let mut latest: HashMap<(&str, &str), &RatingEvent> = HashMap::new();
    for event in ratings.iter().filter(|r| r.as_of_date <= as_of) {
        let key = (event.asset_id.as_str(), event.analyst_id.as_str());
        let newer = match latest.get(&key) {
            Some(current) => {
                (event.as_of_date, event.rating_id.as_str())
                    > (current.as_of_date, current.rating_id.as_str())
            }
            None => true,
        };
        if newer {
            latest.insert(key, event);
        }
    }
    latest
}

/// Resolve the numeric success-rate cutoff for the high-success cohort.
///
/// For [`SuccessThreshold::Median`] each distinct analyst contributes the
/// success rate carried by their most recent event.
pub fn resolve_success_threshold<'a, I>(threshold: SuccessThreshold, events: I) -> f64
where
    I: IntoIterator<Item = &'a RatingEvent>,
{
    match threshold {
        SuccessThreshold::Fixed(v) => v,
        SuccessThreshold::Median => {
            let mut per_analyst: HashMap<&str, (&NaiveDate, &str, f64)> = HashMap::new();
            for event in events {
                let candidate = (
                    &event.as_of_date,
                    event.rating_id.as_str(),
                    event.analyst_overall_success_rate,
                );
                per_analyst
                    .entry(event.analyst_id.as_str())
                    .and_modify(|cur| {
                        if (candidate.0, candidate.1) > (cur.0, cur.1) {
                            *cur = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
            let rates: Vec<f64> = per_analyst.values().map(|(_, _, rate)| *rate).collect();
            if rates.is_empty() {
                return f64::INFINITY;
            }
            Data::new(rates).median()
        }
    }
}
