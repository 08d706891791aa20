use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::ClosePrice;

/// Point-in-time view of closing prices: for each asset, the latest close
/// dated on or before `as_of`, and the latest strictly positive one.
#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    as_of: NaiveDate,
    latest: HashMap<String, ClosePrice>,
    latest_positive: HashMap<String, ClosePrice>,
}

impl PriceSnapshot {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            latest: HashMap::new(),
            latest_positive: HashMap::new(),
        }
    }

    /// Build a snapshot from raw history. Rows dated after `as_of` are ignored.
    pub fn from_history(as_of: NaiveDate, closes: &[ClosePrice]) -> Self {
        let mut snapshot = Self::new(as_of);
        for close in closes {
            snapshot.observe(close.clone());
        }
        snapshot
    }

    /// Fold one close into the snapshot, keeping the most recent per asset.
    pub fn observe(&mut self, close: ClosePrice) {
        if close.date > self.as_of {
            return;
        }
        if close.close > Decimal::ZERO {
            let replace = self
                .latest_positive
                .get(&close.asset_id)
                .map(|c| close.date >= c.date)
                .unwrap_or(true);
            if replace {
                self.latest_positive
                    .insert(close.asset_id.clone(), close.clone());
            }
        }
        let replace = self
            .latest
            .get(&close.asset_id)
            .map(|c| close.date >= c.date)
            .unwrap_or(true);
        if replace {
            self.latest.insert(close.asset_id.clone(), close);
        }
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Latest close on or before `as_of`, whatever its value.
    pub fn latest(&self, asset_id: &str) -> Option<&ClosePrice> {
        self.latest.get(asset_id)
    }

    /// Latest strictly positive close on or before `as_of`.
    pub fn latest_positive(&self, asset_id: &str) -> Option<&ClosePrice> {
        self.latest_positive.get(asset_id)
    }

    /// Price used to value a holding: the latest close when positive,
    /// otherwise the most recent earlier positive close.
    pub fn valuation_price(&self, asset_id: &str) -> Option<Decimal> {
        match self.latest(asset_id) {
            Some(c) if c.close > Decimal::ZERO => Some(c.close),
            _ => self.latest_positive(asset_id).map(|c| c.close),
        }
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn ignores_closes_after_as_of() {
        let closes = vec![
            ClosePrice::new("AAA", d(2024, 1, 5), dec!(10)),
            ClosePrice::new("AAA", d(2024, 1, 12), dec!(12)),
        ];
        let snap = PriceSnapshot::from_history(d(2024, 1, 8), &closes);
        assert_eq!(snap.latest("AAA").unwrap().close, dec!(10));
        assert_eq!(snap.valuation_price("AAA"), Some(dec!(10)));
    }

    #[test]
    fn zero_close_falls_back_to_prior_positive() {
        let closes = vec![
            ClosePrice::new("AAA", d(2024, 1, 1), dec!(50)),
            ClosePrice::new("AAA", d(2024, 1, 8), dec!(0)),
        ];
        let snap = PriceSnapshot::from_history(d(2024, 1, 8), &closes);
        assert_eq!(snap.latest("AAA").unwrap().close, dec!(0));
        assert_eq!(snap.valuation_price("AAA"), Some(dec!(50)));
    }

    #[test]
    fn unknown_asset_has_no_price() {
        let snap = PriceSnapshot::new(d(2024, 1, 8));
        assert!(snap.is_empty());
        assert_eq!(snap.valuation_price("ZZZ"), None);
    }

    #[test]
    fn order_of_observation_does_not_matter() {
        let closes = vec![
            ClosePrice::new("AAA", d(2024, 1, 8), dec!(11)),
            ClosePrice::new("AAA", d(2024, 1, 1), dec!(9)),
        ];
        let snap = PriceSnapshot::from_history(d(2024, 1, 31), &closes);
        assert_eq!(snap.latest("AAA").unwrap().date, d(2024, 1, 8));
    }
}
