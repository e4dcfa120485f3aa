//! Multiple testing correction for marker tables.

use anyhow::{Result, anyhow};

/// Apply Bonferroni correction against an explicit number of comparisons.
///
/// Marker tables are corrected against every feature of the input matrix, not
/// only the ones that survived pre-filtering, so `n_comparisons` is passed in
/// rather than taken from `p_values.len()`.
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
/// * `n_comparisons` - Number of hypotheses the family is corrected for
///
/// # Returns
/// * `Result<Vec<f64>>` - Vector of adjusted p-values, `min(1, p * n_comparisons)`
pub fn bonferroni_correction(p_values: &[f64], n_comparisons: usize) -> Result<Vec<f64>> {
    if n_comparisons < p_values.len() {
        return Err(anyhow!(
            "Number of comparisons ({}) is smaller than the number of p-values ({})",
            n_comparisons,
            p_values.len()
        ));
    }

    // Validate p-values
    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }

    let n = n_comparisons as f64;
    Ok(p_values.iter().map(|&p| (p * n).min(1.0)).collect())
}
