use consensus_core::CohortStats;
use statrs::statistics::Statistics;

/// Count, mean and population standard deviation of one cohort's targets,
/// plus the implied return against `reference_close`.
///
/// `targets` holds one price target per distinct analyst. An empty cohort
/// yields `None` for every statistic and a count of zero.
pub fn cohort_stats(targets: &[f64], reference_close: f64) -> CohortStats {
    if targets.is_empty() {
        return CohortStats::default();
    }

    let mean = targets.iter().mean();
    let dispersion = targets.iter().population_std_dev();
    let expected_return = if reference_close > 0.0 {
        Some((mean - reference_close) / reference_close * 100.0)
    } else {
        None
    };

    CohortStats {
        analyst_count: targets.len() as i64,
        average_price_target: Some(mean),
        dispersion: Some(dispersion),
        expected_return,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cohort_is_null_not_zero() {
        let stats = cohort_stats(&[], 100.0);
        assert_eq!(stats.analyst_count, 0);
        assert!(stats.average_price_target.is_none());
        assert!(stats.dispersion.is_none());
        assert!(stats.expected_return.is_none());
    }

    #[test]
    fn population_dispersion() {
        // mean 12, population variance ((2^2)+(0)+(2^2))/3 = 8/3
        let stats = cohort_stats(&[10.0, 12.0, 14.0], 10.0);
        assert_eq!(stats.analyst_count, 3);
        assert!((stats.average_price_target.unwrap() - 12.0).abs() < 1e-12);
        assert!((stats.dispersion.unwrap() - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((stats.expected_return.unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn single_analyst_has_zero_dispersion() {
        let stats = cohort_stats(&[42.0], 40.0);
        assert_eq!(stats.dispersion, Some(0.0));
        assert!((stats.expected_return.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn negative_upside() {
        let stats = cohort_stats(&[80.0], 100.0);
        assert!((stats.expected_return.unwrap() + 20.0).abs() < 1e-9);
    }
}
