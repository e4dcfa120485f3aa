use crate::testing::TestResult;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Upper tail probability of a chi-square distribution.
pub fn chi_square_upper_tail(statistic: f64, df: f64) -> f64 {
    if statistic.is_nan() || df <= 0.0 {
        return 1.0;
    }
    if statistic <= 0.0 {
        return 1.0;
    }
    if statistic.is_infinite() {
        return 0.0;
    }
    match ChiSquared::new(df) {
        Ok(chi_dist) => chi_dist.sf(statistic).clamp(0.0, 1.0),
        Err(_) => 1.0, // Fallback for invalid parameters
    }
}

/// Likelihood-ratio test from the log-likelihoods of nested models.
pub fn likelihood_ratio_test(loglik_full: f64, loglik_null: f64, df: f64) -> TestResult {
    let statistic = (2.0 * (loglik_full - loglik_null)).max(0.0);
    TestResult::new(statistic, chi_square_upper_tail(statistic, df)).with_degrees_of_freedom(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chi_square_tail_known_values() {
        assert_relative_eq!(chi_square_upper_tail(3.841458820694124, 1.0), 0.05, epsilon = 1e-9);
        assert_relative_eq!(chi_square_upper_tail(7.814727903251178, 3.0), 0.05, epsilon = 1e-9);
        assert_eq!(chi_square_upper_tail(0.0, 3.0), 1.0);
        assert_eq!(chi_square_upper_tail(f64::INFINITY, 3.0), 0.0);
        assert_eq!(chi_square_upper_tail(2.0, 0.0), 1.0);
    }

    #[test]
    fn test_likelihood_ratio_never_negative() {
        let r = likelihood_ratio_test(-10.0, -9.0, 1.0);
        assert_eq!(r.statistic, 0.0);
        assert_eq!(r.p_value, 1.0);
        let r = likelihood_ratio_test(-5.0, -10.0, 1.0);
        assert_relative_eq!(r.statistic, 10.0);
        assert!(r.p_value < 0.01);
    }
}
