use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ConsensusError;

/// An analyst's price-target assertion for an asset on a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEvent {
    /// Provider identifier; the upsert key of the ratings feed.
    pub rating_id: String,
    pub asset_id: String,
    pub analyst_id: String,
    pub as_of_date: NaiveDate,
    pub adjusted_price_target: f64,
    /// Overall success rate of the analyst, in percent (0-100).
    pub analyst_overall_success_rate: f64,
}

/// Daily closing price for an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePrice {
    pub asset_id: String,
    pub date: NaiveDate,
    pub close: Decimal,
}

impl ClosePrice {
    pub fn new(asset_id: impl Into<String>, date: NaiveDate, close: Decimal) -> Self {
        Self {
            asset_id: asset_id.into(),
            date,
            close,
        }
    }
}

/// Named analyst subsets used to compute alternate consensus signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    All,
    Recent,
    HighSuccess,
    Combined,
}

impl Cohort {
    pub const ALL: [Cohort; 4] = [
        Cohort::All,
        Cohort::Recent,
        Cohort::HighSuccess,
        Cohort::Combined,
    ];
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cohort::All => write!(f, "all"),
            Cohort::Recent => write!(f, "recent"),
            Cohort::HighSuccess => write!(f, "high_success"),
            Cohort::Combined => write!(f, "combined"),
        }
    }
}

impl FromStr for Cohort {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all" => Ok(Cohort::All),
            "recent" => Ok(Cohort::Recent),
            "high_success" => Ok(Cohort::HighSuccess),
            "combined" => Ok(Cohort::Combined),
            other => Err(ConsensusError::InvalidConfig(format!(
                "unknown cohort '{other}'"
            ))),
        }
    }
}

/// Consensus statistics for one cohort. Empty cohorts carry `None` statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CohortStats {
    pub analyst_count: i64,
    pub average_price_target: Option<f64>,
    /// Population standard deviation of the price targets.
    pub dispersion: Option<f64>,
    /// Implied upside versus the reference close, in percent.
    pub expected_return: Option<f64>,
}

/// Per-asset ranking row for one evaluation date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub asset_id: String,
    pub evaluation_date: NaiveDate,
    pub last_close_price: Decimal,
    /// Date of the most recent surviving rating for the asset.
    pub last_update_date: NaiveDate,
    pub days_since_last_update: i64,
    pub avg_days_since_last_update: f64,
    pub all: CohortStats,
    pub recent: CohortStats,
    pub high_success: CohortStats,
    pub combined: CohortStats,
}

impl RankingSnapshot {
    pub fn cohort(&self, cohort: Cohort) -> &CohortStats {
        match cohort {
            Cohort::All => &self.all,
            Cohort::Recent => &self.recent,
            Cohort::HighSuccess => &self.high_success,
            Cohort::Combined => &self.combined,
        }
    }

    pub fn expected_return(&self) -> Option<f64> {
        self.all.expected_return
    }

    pub fn expected_return_combined(&self) -> Option<f64> {
        self.combined.expected_return
    }
}

/// How the "high success" cohort threshold is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessThreshold {
    /// Analysts strictly above this success rate (percent) qualify.
    Fixed(f64),
    /// Median success rate across all analysts known as of the evaluation date.
    Median,
}

impl Default for SuccessThreshold {
    fn default() -> Self {
        SuccessThreshold::Fixed(50.0)
    }
}

impl fmt::Display for SuccessThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessThreshold::Fixed(v) => write!(f, "{}", v),
            SuccessThreshold::Median => write!(f, "median"),
        }
    }
}

impl FromStr for SuccessThreshold {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("median") {
            return Ok(SuccessThreshold::Median);
        }
        let value: f64 = trimmed.parse().map_err(|_| {
            ConsensusError::InvalidConfig(format!(
                "success rate threshold must be a number or \"median\", got '{}'",
                s
            ))
        })?;
        if !value.is_finite() {
            return Err(ConsensusError::InvalidConfig(format!(
                "success rate threshold must be finite, got '{}'",
                s
            )));
        }
        Ok(SuccessThreshold::Fixed(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_threshold_parses_number_and_median() {
        assert_eq!(
            "55.5".parse::<SuccessThreshold>().unwrap(),
            SuccessThreshold::Fixed(55.5)
        );
        assert_eq!(
            " Median ".parse::<SuccessThreshold>().unwrap(),
            SuccessThreshold::Median
        );
        assert!("often".parse::<SuccessThreshold>().is_err());
        assert!("NaN".parse::<SuccessThreshold>().is_err());
    }

    #[test]
    fn cohort_display_matches_column_suffixes() {
        let names: Vec<String> = Cohort::ALL.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["all", "recent", "high_success", "combined"]);
        for cohort in Cohort::ALL {
            assert_eq!(cohort.to_string().parse::<Cohort>().unwrap(), cohort);
        }
        assert_eq!("High-Success".parse::<Cohort>().unwrap(), Cohort::HighSuccess);
        assert!("bullish".parse::<Cohort>().is_err());
    }

    #[test]
    fn cohort_selects_matching_stats() {
        let stats = |n: i64| CohortStats {
            analyst_count: n,
            ..CohortStats::default()
        };
        let row = RankingSnapshot {
            asset_id: "AAA".into(),
            evaluation_date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            last_close_price: Decimal::new(100, 0),
            last_update_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            days_since_last_update: 2,
            avg_days_since_last_update: 2.0,
            all: stats(9),
            recent: stats(4),
            high_success: stats(6),
            combined: stats(3),
        };
        let counts: Vec<i64> = Cohort::ALL
            .iter()
            .map(|c| row.cohort(*c).analyst_count)
            .collect();
        assert_eq!(counts, vec![9, 4, 6, 3]);
    }
}
