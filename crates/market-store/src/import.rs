use std::str::FromStr;

use chrono::NaiveDate;
use consensus_core::{ClosePrice, RatingEvent};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::StoreError;

/// Outcome of a CSV import.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

/// Strip currency decoration ("$1,234.50") before parsing.
fn parse_price(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    Decimal::from_str(&cleaned).ok()
}

/// Position of the first header matching any alias (case-insensitive).
fn column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        aliases.iter().any(|a| h == *a)
    })
}

fn require(headers: &csv::StringRecord, aliases: &[&str]) -> Result<usize, StoreError> {
    column(headers, aliases).ok_or_else(|| StoreError::MissingColumn(aliases[0].to_string()))
}

/// Parse daily closes. Accepts `date,close` exports (with `default_asset`
/// naming the ticker, as in per-symbol history downloads) or files carrying
/// their own ticker column.
pub fn parse_price_csv(
    data: &str,
    default_asset: Option<&str>,
) -> Result<(Vec<ClosePrice>, ImportResult), StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers = reader.headers()?.clone();
    let asset_col = column(&headers, &["ticker", "symbol", "asset_id"]);
    if asset_col.is_none() && default_asset.is_none() {
        return Err(StoreError::MissingColumn("ticker".to_string()));
    }
    let date_col = require(&headers, &["date"])?;
    let close_col = require(&headers, &["close", "close/last", "adj close"])?;

    let mut closes = Vec::new();
    let mut result = ImportResult::default();

    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let asset = asset_col
            .and_then(|i| record.get(i))
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .or_else(|| default_asset.map(|s| s.to_uppercase()));
        let date = record.get(date_col).and_then(parse_date);
        let close = record.get(close_col).and_then(parse_price);

        match (asset, date, close) {
            (Some(asset), Some(date), Some(close)) => {
                closes.push(ClosePrice::new(asset, date, close));
                result.imported += 1;
            }
            _ => {
                result.skipped += 1;
                result
                    .errors
                    .push(format!("row {}: unparseable price record", line + 2));
            }
        }
    }

    Ok((closes, result))
}

/// Parse analyst rating events.
pub fn parse_rating_csv(data: &str) -> Result<(Vec<RatingEvent>, ImportResult), StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers = reader.headers()?.clone();
    let id_col = require(&headers, &["rating_id", "id"])?;
    let asset_col = require(&headers, &["ticker", "asset_id", "symbol"])?;
    let analyst_col = require(&headers, &["analyst_id", "analyst_name", "analyst"])?;
    let date_col = require(&headers, &["date", "as_of_date"])?;
    let target_col = require(
        &headers,
        &["adjusted_price_target", "adjusted_pt_current", "price_target"],
    )?;
    let success_col = require(
        &headers,
        &["analyst_overall_success_rate", "overall_success_rate", "success_rate"],
    )?;

    let mut ratings = Vec::new();
    let mut result = ImportResult::default();

    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let text = |i: usize| {
            record
                .get(i)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let number = |i: usize| {
            record
                .get(i)
                .and_then(|s| s.trim().trim_end_matches('%').parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };

        let parsed = (|| {
            Some(RatingEvent {
                rating_id: text(id_col)?,
                asset_id: text(asset_col)?.to_uppercase(),
                analyst_id: text(analyst_col)?,
                as_of_date: record.get(date_col).and_then(parse_date)?,
                adjusted_price_target: number(target_col)?,
                analyst_overall_success_rate: number(success_col)?,
            })
        })();

        match parsed {
            Some(event) => {
                ratings.push(event);
                result.imported += 1;
            }
            None => {
                result.skipped += 1;
                result
                    .errors
                    .push(format!("row {}: unparseable rating record", line + 2));
            }
        }
    }

    Ok((ratings, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_nasdaq_history() {
        let csv = "Date,Close/Last,Volume,Open,High,Low\n\
                   03/01/2024,$179.66,73563080,$179.55,$180.53,$177.38\n\
                   02/29/2024,$180.75,136682600,$181.27,$182.57,$179.53\n\
                   bad,$1,0,0,0,0\n";

        let (closes, result) = parse_price_csv(csv, Some("aapl")).unwrap();
        assert_eq!(result.imported, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(closes[0].asset_id, "AAPL");
        assert_eq!(closes[0].date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(closes[0].close, dec!(179.66));
    }

    #[test]
    fn test_parse_prices_with_ticker_column() {
        let csv = "ticker,date,close\nmsft,2024-03-01,415.50\n";
        let (closes, _) = parse_price_csv(csv, None).unwrap();
        assert_eq!(closes[0].asset_id, "MSFT");
        assert_eq!(closes[0].close, dec!(415.50));
    }

    #[test]
    fn test_price_csv_without_asset_is_rejected() {
        let csv = "date,close\n2024-03-01,1\n";
        assert!(matches!(
            parse_price_csv(csv, None),
            Err(StoreError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_parse_ratings() {
        let csv = "id,ticker,analyst_name,date,adjusted_pt_current,overall_success_rate\n\
                   r1,aapl,Jane Doe,2024-02-01,210.5,61.2\n\
                   r2,aapl,,2024-02-01,200,55\n";

        let (ratings, result) = parse_rating_csv(csv).unwrap();
        assert_eq!(result.imported, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(ratings[0].asset_id, "AAPL");
        assert_eq!(ratings[0].analyst_id, "Jane Doe");
        assert_eq!(ratings[0].adjusted_price_target, 210.5);
        assert_eq!(ratings[0].analyst_overall_success_rate, 61.2);
    }

    #[test]
    fn test_rating_csv_missing_column() {
        let csv = "id,ticker,date\n";
        assert!(matches!(
            parse_rating_csv(csv),
            Err(StoreError::MissingColumn(_))
        ));
    }
}
