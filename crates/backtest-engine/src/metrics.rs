use rust_decimal::prelude::*;
use statrs::statistics::Statistics;

use crate::models::{BacktestReport, PeriodCheckpoint};

/// Build the run summary from the committed checkpoints.
///
/// Drawdown is measured against the running peak of period-end values,
/// starting from `starting_value`.
pub fn summarize(
    portfolio: &str,
    starting_value: Decimal,
    periods: Vec<PeriodCheckpoint>,
    realized_evolution: Decimal,
) -> BacktestReport {
    let final_value = periods
        .last()
        .map(|p| p.total_value)
        .unwrap_or(starting_value);

    let start_f64 = starting_value.to_f64().unwrap_or(0.0);
    let final_f64 = final_value.to_f64().unwrap_or(0.0);
    let total_return_percent = if start_f64 > 0.0 {
        (final_f64 - start_f64) / start_f64 * 100.0
    } else {
        0.0
    };

    let mut peak = start_f64;
    let mut max_drawdown = 0.0;
    let mut previous = start_f64;
    let mut returns = Vec::with_capacity(periods.len());
    for period in &periods {
        let value = period.total_value.to_f64().unwrap_or(0.0);
        if value > peak {
            peak = value;
        }
        let drawdown_pct = if peak > 0.0 {
            (peak - value) / peak * 100.0
        } else {
            0.0
        };
        if drawdown_pct > max_drawdown {
            max_drawdown = drawdown_pct;
        }
        if previous > 0.0 {
            returns.push((value - previous) / previous * 100.0);
        }
        previous = value;
    }

    let period_return_std_dev = if returns.len() >= 2 {
        Some(returns.iter().std_dev())
    } else {
        None
    };

    BacktestReport {
        portfolio: portfolio.to_string(),
        starting_value,
        final_value,
        total_return_percent,
        max_drawdown_percent: max_drawdown,
        period_return_std_dev,
        realized_evolution,
        periods,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeriodAction;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn period(day: u32, value: Decimal) -> PeriodCheckpoint {
        PeriodCheckpoint {
            portfolio: "standard".into(),
            evaluation_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            action: PeriodAction::Hold,
            total_value: value,
            cash: Decimal::ZERO,
            opened: 0,
            closed: 0,
        }
    }

    #[test]
    fn test_drawdown_and_return() {
        let periods = vec![
            period(1, dec!(100)),
            period(8, dec!(120)),
            period(15, dec!(90)),
            period(22, dec!(110)),
        ];
        let report = summarize("standard", dec!(100), periods, dec!(10));
        assert_eq!(report.final_value, dec!(110));
        assert!((report.total_return_percent - 10.0).abs() < 1e-9);
        // peak 120 -> trough 90
        assert!((report.max_drawdown_percent - 25.0).abs() < 1e-9);
        assert!(report.period_return_std_dev.is_some());
        assert_eq!(report.realized_evolution, dec!(10));
    }

    #[test]
    fn test_empty_run() {
        let report = summarize("standard", dec!(100), vec![], Decimal::ZERO);
        assert_eq!(report.final_value, dec!(100));
        assert_eq!(report.total_return_percent, 0.0);
        assert_eq!(report.max_drawdown_percent, 0.0);
        assert!(report.period_return_std_dev.is_none());
    }
}
