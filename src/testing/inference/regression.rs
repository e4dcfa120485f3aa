//! Per-feature regression tests: count GLMs with a Wald test on the group term
//! and logistic regression of group membership with a likelihood-ratio test.
//!
//! Values are laid out in `CellGroups::ordered_cells` order, so the first `n1`
//! entries belong to group 1 and covariate rows follow the same order.

use anyhow::Result;
use ndarray::Array2;

use crate::testing::inference::discrete::likelihood_ratio_test;
use crate::testing::inference::glm::{
    Family, GlmOptions, design_matrix, fit_glm, fit_negative_binomial,
};
use crate::testing::utils::{sample_variance, two_sided_normal_p};
use crate::testing::{FeatureOutcome, TestResult};

/// Ridge keeping separated logistic fits finite.
const LOGISTIC_RIDGE: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountModel {
    Poisson,
    NegativeBinomial,
}

/// 1 for group 1 cells, 0 for group 2 cells.
pub fn group1_membership(n1: usize, n2: usize) -> Vec<f64> {
    let mut membership = vec![1.0; n1];
    membership.extend(std::iter::repeat_n(0.0, n2));
    membership
}

fn expressing(values: &[f64]) -> usize {
    values.iter().filter(|&&v| v > 0.0).count()
}

/// Count GLM of the feature on group membership (plus covariates).
///
/// Features expressed in fewer than `min_cells` cells of both groups, features
/// with zero variance and features whose fit fails are returned as `Skipped`.
/// The statistic is the Wald z of the group 1 coefficient.
pub fn glm_test(
    values: &[f64],
    n1: usize,
    model: CountModel,
    covariates: Option<&Array2<f64>>,
    min_cells: usize,
) -> FeatureOutcome {
    let (group1, group2) = values.split_at(n1);
    if expressing(group1) < min_cells && expressing(group2) < min_cells {
        return FeatureOutcome::Skipped(format!(
            "fewer than {} cells express the feature in either group",
            min_cells
        ));
    }
    if sample_variance(values) == 0.0 {
        return FeatureOutcome::Skipped("zero variance across the tested cells".to_string());
    }

    let membership = group1_membership(n1, values.len() - n1);
    let fitted = design_matrix(values.len(), &[membership.as_slice()], covariates).and_then(|x| {
        let opts = GlmOptions::default();
        match model {
            CountModel::Poisson => fit_glm(&x, values, None, Family::Poisson, &opts),
            CountModel::NegativeBinomial => {
                fit_negative_binomial(&x, values, None, &opts).map(|(fit, _)| fit)
            }
        }
    });

    let fit = match fitted {
        Ok(fit) => fit,
        Err(e) => return FeatureOutcome::Skipped(format!("model fit failed: {}", e)),
    };

    let z = fit.wald_z(1);
    if !z.is_finite() {
        return FeatureOutcome::Skipped("non-finite Wald statistic".to_string());
    }
    FeatureOutcome::Tested(
        TestResult::new(z, two_sided_normal_p(z))
            .with_effect_size(fit.coefficients[1])
            .with_standard_error(fit.std_errors[1]),
    )
}

/// `group ~ feature + covariates` against `group ~ covariates`, LRT with 1 df.
pub fn logistic_lr_test(
    values: &[f64],
    n1: usize,
    covariates: Option<&Array2<f64>>,
) -> Result<TestResult> {
    if sample_variance(values) == 0.0 {
        return Ok(TestResult::null().with_degrees_of_freedom(1.0));
    }

    let n = values.len();
    let membership = group1_membership(n1, n - n1);
    let opts = GlmOptions {
        ridge: LOGISTIC_RIDGE,
        ..GlmOptions::default()
    };

    let full = fit_glm(
        &design_matrix(n, &[values], covariates)?,
        &membership,
        None,
        Family::Binomial,
        &opts,
    )?;
    let null = fit_glm(
        &design_matrix(n, &[], covariates)?,
        &membership,
        None,
        Family::Binomial,
        &opts,
    )?;

    Ok(likelihood_ratio_test(full.log_likelihood, null.log_likelihood, 1.0)
        .with_effect_size(full.coefficients[1]))
}
