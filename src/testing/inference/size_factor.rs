//! Size-factor normalized negative binomial test over raw counts.
//!
//! Unlike the per-feature strategies this model is fitted once over every
//! feature: size factors and the dispersion-mean trend are shared, and only the
//! final Wald tests run per feature.
//!
//! 1. Size factors by median of ratios to the per-feature geometric mean. When
//!    every feature has a zero somewhere, geometric means over the positive
//!    counts are used instead and the factors are rescaled to geometric mean 1.
//! 2. Gene-wise dispersion by maximum likelihood under `~ group` with
//!    `ln(size factor)` offsets.
//! 3. Parametric trend `alpha = a0 + a1 / mean`, fitted as a Gamma GLM with
//!    identity link, iterating away outlying features. If the fit fails the
//!    trend is the mean gene-wise dispersion.
//! 4. Final dispersion `max(gene-wise, trend)`, then a negative binomial Wald
//!    test on the group coefficient, reported as a log2 fold change.
//!
//! Any failure aborts the whole run.

use anyhow::{Result, anyhow};
use log::debug;
use single_utilities::traits::FloatOpsTS;

use crate::diagnostics::Diagnostics;
use crate::error::MarkerError;
use crate::matrix::{CellGroups, FeatureMatrix};
use crate::testing::inference::glm::{
    Family, GlmOptions, design_matrix, fit_glm, fit_negative_binomial,
};
use crate::testing::inference::regression::group1_membership;
use crate::testing::utils::{map_features, mean, median, two_sided_normal_p};
use crate::testing::{FeatureOutcome, TestResult};

const TREND_BOUNDS: (f64, f64) = (1e-4, 15.0);
const MIN_DISPERSION: f64 = 1e-8;

/// Dense integer-valued count rows in `groups.ordered_cells()` order.
pub fn count_rows<T: FloatOpsTS>(
    matrix: &FeatureMatrix<T>,
    groups: &CellGroups,
    features: &[usize],
    parallel: bool,
) -> Result<Vec<Vec<f64>>> {
    let lookup = groups.lookup(matrix.n_cells());
    let rows = map_features(features.len(), parallel, |i| matrix.row_values(features[i], &lookup));
    for (row, &feature) in rows.iter().zip(features) {
        if row.iter().any(|&v| !v.is_finite() || v < 0.0 || v.fract() != 0.0) {
            let name = matrix.feature_names()[feature].clone();
            return Err(MarkerError::NonIntegerCounts(name).into());
        }
    }
    Ok(rows)
}

fn factors_from_log_means(rows: &[Vec<f64>], log_means: &[f64], n_cells: usize) -> Vec<f64> {
    (0..n_cells)
        .map(|j| {
            let ratios: Vec<f64> = rows
                .iter()
                .zip(log_means)
                .filter(|(row, lg)| lg.is_finite() && row[j] > 0.0)
                .map(|(row, lg)| row[j].ln() - lg)
                .collect();
            median(&ratios).exp()
        })
        .collect()
}

/// Per-cell size factors; `cell_names` are in row order and only used for errors.
pub fn estimate_size_factors(
    rows: &[Vec<f64>],
    cell_names: &[String],
    diagnostics: &mut Diagnostics,
) -> Result<Vec<f64>> {
    let n_cells = cell_names.len();
    let log_means: Vec<f64> = rows
        .iter()
        .map(|row| row.iter().map(|&k| k.ln()).sum::<f64>() / n_cells as f64)
        .collect();

    let factors = if log_means.iter().any(|lg| lg.is_finite()) {
        factors_from_log_means(rows, &log_means, n_cells)
    } else {
        diagnostics
            .info("every feature contains a zero count; using positive-count geometric means");
        let positive_log_means: Vec<f64> = rows
            .iter()
            .map(|row| {
                if row.iter().all(|&k| k == 0.0) {
                    f64::NEG_INFINITY
                } else {
                    row.iter().filter(|&&k| k > 0.0).map(|k| k.ln()).sum::<f64>() / n_cells as f64
                }
            })
            .collect();
        let mut factors = factors_from_log_means(rows, &positive_log_means, n_cells);
        let log_center = mean(&factors.iter().map(|f| f.ln()).collect::<Vec<_>>());
        if log_center.is_finite() {
            factors.iter_mut().for_each(|f| *f /= log_center.exp());
        }
        factors
    };

    if let Some(j) = factors.iter().position(|f| !(f.is_finite() && *f > 0.0)) {
        return Err(MarkerError::InvalidMatrix(format!(
            "cell '{}' has no counts usable for size-factor estimation",
            cell_names[j]
        ))
        .into());
    }
    Ok(factors)
}

/// Fit `alpha = a0 + a1 / mean` over features with a positive mean.
pub fn fit_dispersion_trend(means: &[f64], dispersions: &[f64]) -> Option<(f64, f64)> {
    let mut coefs = (0.1, 1.0);
    for _ in 0..10 {
        let good: Vec<usize> = (0..means.len())
            .filter(|&i| {
                let residual = dispersions[i] / (coefs.0 + coefs.1 / means[i]);
                residual > TREND_BOUNDS.0 && residual < TREND_BOUNDS.1
            })
            .collect();
        if good.len() < 3 {
            return None;
        }
        let inverse_means: Vec<f64> = good.iter().map(|&i| 1.0 / means[i]).collect();
        let y: Vec<f64> = good.iter().map(|&i| dispersions[i]).collect();
        let x = design_matrix(good.len(), &[inverse_means.as_slice()], None).ok()?;
        let fit = fit_glm(&x, &y, None, Family::Gamma, &GlmOptions::default()).ok()?;

        let next = (fit.coefficients[0], fit.coefficients[1]);
        if !(next.0 > 0.0 && next.1 > 0.0) {
            return None;
        }
        let change = (next.0 / coefs.0).ln().powi(2) + (next.1 / coefs.1).ln().powi(2);
        coefs = next;
        if change < 1e-6 {
            return Some(coefs);
        }
    }
    None
}

/// Size-factor Wald test for every listed feature.
///
/// All-zero features are returned as `Skipped`; every other feature is tested.
pub fn size_factor_test<T: FloatOpsTS>(
    matrix: &FeatureMatrix<T>,
    groups: &CellGroups,
    features: &[usize],
    parallel: bool,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FeatureOutcome>> {
    let rows = count_rows(matrix, groups, features, parallel)?;
    let ordered = groups.ordered_cells();
    let cell_names: Vec<String> = ordered.iter().map(|&c| matrix.cell_names()[c].clone()).collect();

    let size_factors = estimate_size_factors(&rows, &cell_names, diagnostics)?;
    let offset: Vec<f64> = size_factors.iter().map(|f| f.ln()).collect();
    let membership = group1_membership(groups.n1(), groups.n2());
    let x = design_matrix(ordered.len(), &[membership.as_slice()], None)?;
    let opts = GlmOptions::default();

    let observed: Vec<bool> = rows.iter().map(|row| row.iter().any(|&k| k > 0.0)).collect();
    let gene_wise: Vec<Option<f64>> =
        map_features(rows.len(), parallel, |i| -> Result<Option<f64>> {
            if !observed[i] {
                return Ok(None);
            }
            let (_, theta) = fit_negative_binomial(&x, &rows[i], Some(offset.as_slice()), &opts)?;
            Ok(Some((1.0 / theta).max(MIN_DISPERSION)))
        })
        .into_iter()
        .collect::<Result<_>>()?;

    let tested: Vec<usize> = (0..rows.len()).filter(|&i| observed[i]).collect();
    let means: Vec<f64> = tested
        .iter()
        .map(|&i| mean(&rows[i].iter().zip(&size_factors).map(|(k, f)| k / f).collect::<Vec<_>>()))
        .collect();
    let dispersions: Vec<f64> = tested.iter().filter_map(|&i| gene_wise[i]).collect();

    let coefs = fit_dispersion_trend(&means, &dispersions);
    match coefs {
        Some((a0, a1)) => debug!("Dispersion trend: {:.4} + {:.4} / mean", a0, a1),
        None => diagnostics.info("parametric dispersion trend failed; using the mean dispersion"),
    }
    let flat = mean(&dispersions);
    let trend = |m: f64| coefs.map_or(flat, |(a0, a1)| a0 + a1 / m);

    let mut final_dispersion = vec![None; rows.len()];
    for (k, &i) in tested.iter().enumerate() {
        final_dispersion[i] = gene_wise[i].map(|g| g.max(trend(means[k])));
    }

    map_features(rows.len(), parallel, |i| -> Result<FeatureOutcome> {
        let Some(alpha) = final_dispersion[i] else {
            return Ok(FeatureOutcome::Skipped("all counts are zero".to_string()));
        };
        let fit = fit_glm(
            &x,
            &rows[i],
            Some(offset.as_slice()),
            Family::NegativeBinomial { theta: 1.0 / alpha },
            &opts,
        )?;
        let z = fit.wald_z(1);
        if !z.is_finite() {
            return Err(anyhow!(
                "non-finite Wald statistic for feature '{}'",
                matrix.feature_names()[features[i]]
            ));
        }
        Ok(FeatureOutcome::Tested(
            TestResult::new(z, two_sided_normal_p(z))
                .with_effect_size(fit.coefficients[1] / std::f64::consts::LN_2)
                .with_standard_error(fit.std_errors[1] / std::f64::consts::LN_2),
        ))
    })
    .into_iter()
    .collect()
}
