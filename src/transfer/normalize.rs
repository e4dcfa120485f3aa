//! Log-normalization and per-feature scaling of cell matrices.

use anyhow::Result;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{Array2, Axis};

use crate::matrix::FeatureMatrix;
use crate::testing::utils::median;

/// Per-cell column totals.
pub fn cell_totals(matrix: &FeatureMatrix<f64>) -> Vec<f64> {
    let mut totals = vec![0.0; matrix.n_cells()];
    for row in matrix.matrix().row_iter() {
        for (&c, &v) in row.col_indices().iter().zip(row.values()) {
            totals[c] += v;
        }
    }
    totals
}

/// `ln(1 + x / total * scale_factor)` per cell; empty cells stay zero.
pub fn log_normalize(matrix: &FeatureMatrix<f64>, scale_factor: f64) -> Result<FeatureMatrix<f64>> {
    let totals = cell_totals(matrix);
    let mut coo = CooMatrix::new(matrix.n_features(), matrix.n_cells());
    for (r, row) in matrix.matrix().row_iter().enumerate() {
        for (&c, &v) in row.col_indices().iter().zip(row.values()) {
            if totals[c] > 0.0 && v != 0.0 {
                coo.push(r, c, (v / totals[c] * scale_factor).ln_1p());
            }
        }
    }
    FeatureMatrix::new(
        CsrMatrix::from(&coo),
        matrix.feature_names().to_vec(),
        matrix.cell_names().to_vec(),
    )
}

/// Log-normalize with the median cell total as scale factor.
pub fn log_normalize_median(matrix: &FeatureMatrix<f64>) -> Result<FeatureMatrix<f64>> {
    let scale = median(&cell_totals(matrix));
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    log_normalize(matrix, scale)
}

/// Center each row and divide by its sample standard deviation, capping
/// values at `clip`. Constant rows become zero.
pub fn scale_rows(values: &Array2<f64>, clip: f64) -> Array2<f64> {
    let mut scaled = values.clone();
    let n = values.ncols();
    for mut row in scaled.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / n.max(1) as f64;
        let var = if n > 1 {
            row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        let sd = var.sqrt();
        if sd > 0.0 {
            row.mapv_inplace(|v| ((v - mean) / sd).min(clip));
        } else {
            row.fill(0.0);
        }
    }
    scaled
}
