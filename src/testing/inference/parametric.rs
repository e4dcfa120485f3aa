//! Parametric statistical tests for single-cell data analysis.
//!
//! Two-sample t-tests computed from per-group sums (so sparse rows never need to
//! be densified) and the bimodal likelihood-ratio test, which models each group
//! as a point mass at zero plus a Gaussian over the positive values.

use crate::testing::inference::discrete::likelihood_ratio_test;
use crate::testing::utils::{mean, sample_variance, two_sided_normal_p};
use crate::testing::{TTestType, TestResult};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Sum, sum of squares and count of one group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupSums {
    pub sum: f64,
    pub sum_sq: f64,
    pub n: f64,
}

/// Accumulate per-group sums from sparse `(position, value)` entries; positions
/// `< n1` belong to group 1, implicit zeros add nothing.
pub fn accumulate_group_sums(
    entries: &[(usize, f64)],
    n1: usize,
    n2: usize,
) -> (GroupSums, GroupSums) {
    let mut g1 = GroupSums { n: n1 as f64, ..Default::default() };
    let mut g2 = GroupSums { n: n2 as f64, ..Default::default() };
    for &(pos, value) in entries {
        let target = if pos < n1 { &mut g1 } else { &mut g2 };
        target.sum += value;
        target.sum_sq += value * value;
    }
    (g1, g2)
}

/// Perform a t-test comparing two samples.
///
/// This function performs either Student's t-test (assuming equal variances) or
/// Welch's t-test (allowing unequal variances) on two samples.
pub fn t_test(x: &[f64], y: &[f64], test_type: TTestType) -> TestResult {
    let sums = |values: &[f64]| GroupSums {
        sum: values.iter().sum(),
        sum_sq: values.iter().map(|v| v * v).sum(),
        n: values.len() as f64,
    };
    fast_t_test_from_sums(sums(x), sums(y), test_type)
}

/// Perform a t-test using precomputed summary statistics.
///
/// Computes the test directly from sum and sum-of-squares, avoiding the need to
/// store or iterate through the original data.
pub fn fast_t_test_from_sums(g1: GroupSums, g2: GroupSums, test_type: TTestType) -> TestResult {
    let (n1, n2) = (g1.n, g2.n);
    // Early exit for insufficient sample sizes
    if n1 < 2.0 || n2 < 2.0 {
        return TestResult::null();
    }

    let mean1 = g1.sum / n1;
    let mean2 = g2.sum / n2;

    // Computational formula; tiny negative values are rounding noise
    let var1 = ((g1.sum_sq - g1.sum * g1.sum / n1) / (n1 - 1.0)).max(0.0);
    let var2 = ((g2.sum_sq - g2.sum * g2.sum / n2) / (n2 - 1.0)).max(0.0);

    let mean_diff = mean1 - mean2;

    let (t_stat, df) = match test_type {
        TTestType::Student => {
            // Student's t-test (pooled variance)
            let pooled_var = ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0);
            let std_err = (pooled_var * (1.0 / n1 + 1.0 / n2)).sqrt();
            (mean_diff / std_err, n1 + n2 - 2.0)
        }
        TTestType::Welch => {
            let term1 = var1 / n1;
            let term2 = var2 / n2;
            let combined_var = term1 + term2;
            let t = mean_diff / combined_var.sqrt();

            // Welch-Satterthwaite equation for degrees of freedom
            let df = combined_var * combined_var
                / (term1 * term1 / (n1 - 1.0) + term2 * term2 / (n2 - 1.0));
            (t, df)
        }
    };

    TestResult::new(t_stat, t_test_p_value(t_stat, df))
        .with_degrees_of_freedom(df)
        .with_effect_size(mean_diff)
}

fn t_test_p_value(t_stat: f64, df: f64) -> f64 {
    // Constant groups: infinite t separates perfectly, NaN means identical
    if !t_stat.is_finite() {
        return if t_stat.is_infinite() { 0.0 } else { 1.0 };
    }

    if df <= 0.0 || !df.is_finite() {
        return 1.0;
    }

    // The t distribution is indistinguishable from the normal at this point
    if df > 1e5 {
        return two_sided_normal_p(t_stat);
    }

    match StudentsT::new(0.0, 1.0, df) {
        Ok(t_dist) => (2.0 * t_dist.sf(t_stat.abs())).min(1.0),
        Err(_) => 1.0,
    }
}

const BIMOD_MIN_FRACTION: f64 = 1e-5;

/// Log-likelihood of a zero point mass plus a Gaussian over values above zero.
///
/// The Gaussian falls back to unit standard deviation when fewer than two
/// positive values exist or they are all identical.
pub fn bimodal_log_likelihood(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let positive: Vec<f64> = values.iter().copied().filter(|&v| v > 0.0).collect();
    let n_zero = (values.len() - positive.len()) as f64;
    let n_pos = positive.len() as f64;

    let fraction =
        (n_pos / values.len() as f64).clamp(BIMOD_MIN_FRACTION, 1.0 - BIMOD_MIN_FRACTION);
    let lik_zero = n_zero * (1.0 - fraction).ln();

    let mut sd = if positive.len() < 2 { 1.0 } else { sample_variance(&positive).sqrt() };
    if !(sd > 0.0 && sd.is_finite()) {
        sd = 1.0;
    }
    let mu = mean(&positive);
    let norm_const = -0.5 * (2.0 * std::f64::consts::PI).ln() - sd.ln();
    let gaussian: f64 = positive
        .iter()
        .map(|&v| norm_const - (v - mu) * (v - mu) / (2.0 * sd * sd))
        .sum();

    lik_zero + n_pos * fraction.ln() + gaussian
}

/// Bimodal likelihood-ratio test: separate models per group against one pooled
/// model, chi-square with 3 degrees of freedom.
pub fn bimodal_lrt(x: &[f64], y: &[f64]) -> TestResult {
    let pooled: Vec<f64> = x.iter().chain(y.iter()).copied().collect();
    let separate = bimodal_log_likelihood(x) + bimodal_log_likelihood(y);
    likelihood_ratio_test(separate, bimodal_log_likelihood(&pooled), 3.0)
}
