//! Embedded store for the pipeline's market inputs and derived rankings.
//!
//! Rating events and closing prices arrive from external feeds (or CSV
//! exports of them); ranking snapshots are written back by the aggregator.
//! Every read is point-in-time: queries take an as-of date and never return
//! rows dated after it.

pub mod db;
pub mod error;
pub mod import;
pub mod prices;
pub mod rankings;
pub mod ratings;

pub use db::MarketDb;
pub use error::StoreError;
pub use import::{parse_price_csv, parse_rating_csv, ImportResult};
