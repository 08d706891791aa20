use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{ConsensusError, PriceSnapshot, RankingSnapshot, RatingEvent};

/// Source of analyst rating events.
#[async_trait]
pub trait RatingSource: Send + Sync {
    /// Every rating event dated on or before `as_of`.
    async fn ratings_as_of(&self, as_of: NaiveDate) -> Result<Vec<RatingEvent>, ConsensusError>;
}

/// Source of point-in-time closing prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn prices_as_of(&self, as_of: NaiveDate) -> Result<PriceSnapshot, ConsensusError>;
}

/// Source of precomputed ranking snapshots.
#[async_trait]
pub trait RankingSource: Send + Sync {
    /// Snapshots computed for exactly `date`.
    async fn rankings_on(&self, date: NaiveDate) -> Result<Vec<RankingSnapshot>, ConsensusError>;

    /// Last evaluation date the rankings have been computed through. Dates
    /// after it have no snapshots yet, which is not the same as an empty one.
    async fn latest_ranking_date(&self) -> Result<Option<NaiveDate>, ConsensusError>;
}
