use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    ClosePrice, ConsensusError, PriceSnapshot, PriceSource, RankingSnapshot, RankingSource,
    RatingEvent, RatingSource,
};

/// Market history held in memory. Backs dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarket {
    ratings: Vec<RatingEvent>,
    closes: Vec<ClosePrice>,
    rankings: BTreeMap<NaiveDate, Vec<RankingSnapshot>>,
}

impl InMemoryMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rating(&mut self, rating: RatingEvent) {
        self.ratings.retain(|r| r.rating_id != rating.rating_id);
        self.ratings.push(rating);
    }

    pub fn add_close(&mut self, close: ClosePrice) {
        self.closes
            .retain(|c| !(c.asset_id == close.asset_id && c.date == close.date));
        self.closes.push(close);
    }

    /// Replace the snapshots stored for `date`.
    pub fn set_rankings(&mut self, date: NaiveDate, rows: Vec<RankingSnapshot>) {
        self.rankings.insert(date, rows);
    }
}

#[async_trait]
impl RatingSource for InMemoryMarket {
    async fn ratings_as_of(&self, as_of: NaiveDate) -> Result<Vec<RatingEvent>, ConsensusError> {
        Ok(self
            .ratings
            .iter()
            .filter(|r| r.as_of_date <= as_of)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PriceSource for InMemoryMarket {
    async fn prices_as_of(&self, as_of: NaiveDate) -> Result<PriceSnapshot, ConsensusError> {
        Ok(PriceSnapshot::from_history(as_of, &self.closes))
    }
}

#[async_trait]
impl RankingSource for InMemoryMarket {
    async fn rankings_on(&self, date: NaiveDate) -> Result<Vec<RankingSnapshot>, ConsensusError> {
        Ok(self.rankings.get(&date).cloned().unwrap_or_default())
    }

    async fn latest_ranking_date(&self) -> Result<Option<NaiveDate>, ConsensusError> {
        Ok(self.rankings.keys().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[tokio::test]
    async fn close_upsert_replaces_same_day_row() {
        let mut market = InMemoryMarket::new();
        market.add_close(ClosePrice::new("AAA", d(1), dec!(10)));
        market.add_close(ClosePrice::new("AAA", d(1), dec!(11)));
        assert_eq!(market.closes.len(), 1);

        let snap = market.prices_as_of(d(1)).await.unwrap();
        assert_eq!(snap.valuation_price("AAA"), Some(dec!(11)));
    }

    #[tokio::test]
    async fn ratings_are_filtered_by_date() {
        let mut market = InMemoryMarket::new();
        for (id, day) in [("r1", 1), ("r2", 9)] {
            market.add_rating(RatingEvent {
                rating_id: id.to_string(),
                asset_id: "AAA".to_string(),
                analyst_id: "jane".to_string(),
                as_of_date: d(day),
                adjusted_price_target: 12.0,
                analyst_overall_success_rate: 60.0,
            });
        }
        let visible = market.ratings_as_of(d(5)).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].rating_id, "r1");
    }

    #[tokio::test]
    async fn latest_ranking_date_counts_empty_dates() {
        let mut market = InMemoryMarket::new();
        assert_eq!(market.latest_ranking_date().await.unwrap(), None);
        market.set_rankings(d(3), Vec::new());
        market.set_rankings(d(10), Vec::new());
        assert_eq!(market.latest_ranking_date().await.unwrap(), Some(d(10)));
    }
}
