use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backtest_engine::{BacktestConfig, RetryPolicy};
use chrono::{NaiveDate, Utc};
use consensus_core::SuccessThreshold;
use rust_decimal::Decimal;
use signal_aggregator::AggregatorConfig;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Storage
    pub database_url: String,                // sqlite:consensus.db
    pub portfolio: String,                   // standard

    // Consensus signal
    pub recent_window_days: i64,             // 21
    pub success_threshold: SuccessThreshold, // 50, or "median"

    // Selection
    pub min_analysts: i64,                   // 5
    pub top_k: usize,                        // 10
    pub max_dispersion: f64,                 // 100
    pub min_expected_return: Option<f64>,    // unset

    // Replay
    pub initial_capital: Decimal,            // 100
    pub cadence_days: i64,                   // 7
    pub start_date: NaiveDate,               // 2021-01-17
    pub end_date: NaiveDate,                 // today
    pub liquidate_at_end: bool,              // false

    // Ledger write retries
    pub retry_max_attempts: u32,             // 4
    pub retry_base_delay_ms: u64,            // 1000
    pub retry_max_delay_ms: u64,             // 30000
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let today = Utc::now().date_naive().to_string();
        let config = Self {
            database_url: get("DATABASE_URL", "sqlite:consensus.db"),
            portfolio: get("PORTFOLIO", "standard"),

            recent_window_days: parse(&get("RECENT_WINDOW_DAYS", "21"), "RECENT_WINDOW_DAYS")?,
            success_threshold: parse(
                &get("SUCCESS_RATE_THRESHOLD", "50"),
                "SUCCESS_RATE_THRESHOLD",
            )?,

            min_analysts: parse(&get("MIN_ANALYSTS", "5"), "MIN_ANALYSTS")?,
            top_k: parse(&get("TOP_K", "10"), "TOP_K")?,
            max_dispersion: parse(&get("MAX_DISPERSION", "100"), "MAX_DISPERSION")?,
            min_expected_return: lookup("MIN_EXPECTED_RETURN")
                .map(|v| parse(&v, "MIN_EXPECTED_RETURN"))
                .transpose()?,

            initial_capital: parse(&get("INITIAL_CAPITAL", "100"), "INITIAL_CAPITAL")?,
            cadence_days: parse(&get("CADENCE_DAYS", "7"), "CADENCE_DAYS")?,
            start_date: parse(&get("START_DATE", "2021-01-17"), "START_DATE")?,
            end_date: parse(&get("END_DATE", &today), "END_DATE")?,
            liquidate_at_end: parse(&get("LIQUIDATE_AT_END", "false"), "LIQUIDATE_AT_END")?,

            retry_max_attempts: parse(&get("LEDGER_RETRY_ATTEMPTS", "4"), "LEDGER_RETRY_ATTEMPTS")?,
            retry_base_delay_ms: parse(
                &get("LEDGER_RETRY_BASE_MS", "1000"),
                "LEDGER_RETRY_BASE_MS",
            )?,
            retry_max_delay_ms: parse(&get("LEDGER_RETRY_MAX_MS", "30000"), "LEDGER_RETRY_MAX_MS")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recent_window_days < 0 {
            bail!("RECENT_WINDOW_DAYS must be >= 0");
        }
        if self.min_analysts < 1 {
            bail!("MIN_ANALYSTS must be at least 1");
        }
        if self.top_k == 0 {
            bail!("TOP_K must be positive");
        }
        if !self.max_dispersion.is_finite() || self.max_dispersion < 0.0 {
            bail!("MAX_DISPERSION must be a non-negative number");
        }
        if self.initial_capital <= Decimal::ZERO {
            bail!("INITIAL_CAPITAL must be positive");
        }
        if self.cadence_days <= 0 {
            bail!("CADENCE_DAYS must be positive");
        }
        if self.end_date < self.start_date {
            bail!(
                "END_DATE {} precedes START_DATE {}",
                self.end_date,
                self.start_date
            );
        }
        if self.retry_max_attempts == 0 {
            bail!("LEDGER_RETRY_ATTEMPTS must be at least 1");
        }
        Ok(())
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            recent_window_days: self.recent_window_days,
            success_threshold: self.success_threshold,
        }
    }

    pub fn backtest(&self) -> BacktestConfig {
        BacktestConfig {
            portfolio: self.portfolio.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            cadence_days: self.cadence_days,
            top_k: self.top_k,
            min_analysts: self.min_analysts,
            max_dispersion: self.max_dispersion,
            min_expected_return: self.min_expected_return,
            initial_capital: self.initial_capital,
            liquidate_at_end: self.liquidate_at_end,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<PipelineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("END_DATE", "2021-06-27")]).unwrap();
        assert_eq!(config.recent_window_days, 21);
        assert_eq!(config.success_threshold, SuccessThreshold::Fixed(50.0));
        assert_eq!(config.min_analysts, 5);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.max_dispersion, 100.0);
        assert_eq!(config.initial_capital, dec!(100));
        assert_eq!(config.cadence_days, 7);
        assert_eq!(
            config.start_date,
            NaiveDate::from_ymd_opt(2021, 1, 17).unwrap()
        );
        assert!(config.min_expected_return.is_none());
        assert!(!config.liquidate_at_end);
    }

    #[test]
    fn test_overrides_flow_into_stage_configs() {
        let config = config_from(&[
            ("SUCCESS_RATE_THRESHOLD", "median"),
            ("RECENT_WINDOW_DAYS", "31"),
            ("TOP_K", "5"),
            ("MIN_EXPECTED_RETURN", "25"),
            ("PORTFOLIO", "bullish"),
            ("START_DATE", "2022-01-02"),
            ("END_DATE", "2022-03-27"),
            ("LEDGER_RETRY_BASE_MS", "10"),
        ])
        .unwrap();

        let agg = config.aggregator();
        assert_eq!(agg.recent_window_days, 31);
        assert_eq!(agg.success_threshold, SuccessThreshold::Median);

        let bt = config.backtest();
        assert_eq!(bt.portfolio, "bullish");
        assert_eq!(bt.top_k, 5);
        assert_eq!(bt.min_expected_return, Some(25.0));
        assert_eq!(bt.retry.base_delay, Duration::from_millis(10));
        assert!(bt.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("TOP_K", "many")]).is_err());
        assert!(config_from(&[("TOP_K", "0")]).is_err());
        assert!(config_from(&[("SUCCESS_RATE_THRESHOLD", "often")]).is_err());
        assert!(config_from(&[("START_DATE", "2022-05-01"), ("END_DATE", "2022-01-01")]).is_err());
        assert!(config_from(&[("INITIAL_CAPITAL", "-5")]).is_err());
    }
}
