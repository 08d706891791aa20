//! Signal Aggregator
//!
//! Turns the history of analyst price targets into one ranking row per asset
//! for a given as-of date. Everything here is a pure function of the history
//! visible on that date, which is what lets the backtest replay any week.

pub mod aggregator;
pub mod cohort;
pub mod config;

pub use aggregator::{compute_rankings, rank_with_snapshot, resolve_success_threshold};
pub use cohort::cohort_stats;
pub use config::AggregatorConfig;
