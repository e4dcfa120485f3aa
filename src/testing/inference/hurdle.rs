//! Two-part hurdle test.
//!
//! The discrete part is a logistic regression of detection (`value > 0`) on
//! group membership and covariates. The continuous part is a Gaussian linear
//! model of the positive values on the same design. Each part contributes a
//! likelihood-ratio statistic for the group term; their sum is referred to a
//! chi-square distribution with the summed degrees of freedom. A part that
//! cannot be estimated (no variation in detection, too few positive values,
//! positives from one group only) contributes neither statistic nor df.

use anyhow::Result;
use ndarray::{Array2, Axis};

use crate::testing::TestResult;
use crate::testing::inference::discrete::chi_square_upper_tail;
use crate::testing::inference::glm::{Family, GlmOptions, design_matrix, fit_glm};
use crate::testing::inference::regression::group1_membership;
use crate::testing::utils::sample_variance;

const DETECTION_RIDGE: f64 = 1e-4;

/// One component's likelihood-ratio contribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HurdleComponent {
    pub statistic: f64,
    pub df: f64,
    /// Group 1 coefficient of the full model.
    pub coefficient: f64,
}

impl HurdleComponent {
    fn absent() -> Self {
        HurdleComponent {
            statistic: 0.0,
            df: 0.0,
            coefficient: 0.0,
        }
    }
}

fn component_lrt(
    y: &[f64],
    membership: &[f64],
    covariates: Option<&Array2<f64>>,
    family: Family,
    opts: &GlmOptions,
) -> Result<HurdleComponent> {
    let n = y.len();
    let full = fit_glm(&design_matrix(n, &[membership], covariates)?, y, None, family, opts)?;
    let null = fit_glm(&design_matrix(n, &[], covariates)?, y, None, family, opts)?;
    Ok(HurdleComponent {
        statistic: (2.0 * (full.log_likelihood - null.log_likelihood)).max(0.0),
        df: 1.0,
        coefficient: full.coefficients[1],
    })
}

/// Detection component over every tested cell.
pub fn discrete_component(
    values: &[f64],
    n1: usize,
    covariates: Option<&Array2<f64>>,
) -> Result<HurdleComponent> {
    let detected: Vec<f64> = values.iter().map(|&v| if v > 0.0 { 1.0 } else { 0.0 }).collect();
    let n_detected = detected.iter().filter(|&&d| d > 0.0).count();
    if n_detected == 0 || n_detected == values.len() {
        return Ok(HurdleComponent::absent());
    }

    let membership = group1_membership(n1, values.len() - n1);
    let opts = GlmOptions {
        ridge: DETECTION_RIDGE,
        ..GlmOptions::default()
    };
    component_lrt(&detected, &membership, covariates, Family::Binomial, &opts)
}

/// Magnitude component over the positive values only.
pub fn continuous_component(
    values: &[f64],
    n1: usize,
    covariates: Option<&Array2<f64>>,
) -> Result<HurdleComponent> {
    let positive: Vec<usize> = (0..values.len()).filter(|&i| values[i] > 0.0).collect();
    let n_cov = covariates.map_or(0, |c| c.ncols());
    let pos_1 = positive.iter().filter(|&&i| i < n1).count();
    let pos_2 = positive.len() - pos_1;

    // Full model needs more observations than coefficients to leave a residual variance.
    if pos_1 == 0 || pos_2 == 0 || positive.len() <= n_cov + 3 {
        return Ok(HurdleComponent::absent());
    }

    let y: Vec<f64> = positive.iter().map(|&i| values[i]).collect();
    if sample_variance(&y) == 0.0 {
        return Ok(HurdleComponent::absent());
    }
    let membership: Vec<f64> = positive.iter().map(|&i| if i < n1 { 1.0 } else { 0.0 }).collect();
    let cov = covariates.map(|c| c.select(Axis(0), &positive));

    component_lrt(&y, &membership, cov.as_ref(), Family::Gaussian, &GlmOptions::default())
}

/// Combined hurdle test for one feature. Fitting failures propagate.
pub fn hurdle_test(
    values: &[f64],
    n1: usize,
    covariates: Option<&Array2<f64>>,
) -> Result<TestResult> {
    let discrete = discrete_component(values, n1, covariates)?;
    let continuous = continuous_component(values, n1, covariates)?;

    let df = discrete.df + continuous.df;
    if df == 0.0 {
        return Ok(TestResult::null());
    }
    let statistic = discrete.statistic + continuous.statistic;
    Ok(TestResult::new(statistic, chi_square_upper_tail(statistic, df))
        .with_degrees_of_freedom(df)
        .with_effect_size(continuous.coefficient))
}
