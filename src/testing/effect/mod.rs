//! Fold change and detection statistics used by the pre-filter and the marker table.

use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::matrix::{CellGroups, DataLayer, FeatureMatrix};
use crate::testing::utils::map_features;

/// Logarithm base the reported fold change is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FoldChangeBase {
    #[default]
    Natural,
    Two,
}

/// Per-feature statistics over the two groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSummary {
    /// Fraction of group 1 cells with a positive value, rounded to 3 decimals.
    pub pct_1: f64,
    /// Fraction of group 2 cells with a positive value, rounded to 3 decimals.
    pub pct_2: f64,
    /// Group 1 versus group 2 log fold change.
    pub avg_log_fc: f64,
}

impl FeatureSummary {
    pub fn max_pct(&self) -> f64 {
        self.pct_1.max(self.pct_2)
    }

    pub fn pct_difference(&self) -> f64 {
        (self.pct_1 - self.pct_2).abs()
    }
}

pub fn round_digits(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}

/// Log of the average expression of one group, from the group's sum over the
/// layer-specific linear scale (`expm1` for `Data`, identity otherwise).
fn log_mean_from_linear_sum(sum: f64, n: usize, layer: DataLayer, pseudocount: f64) -> f64 {
    let mean = if n == 0 { 0.0 } else { sum / n as f64 };
    match layer {
        DataLayer::ScaleData => mean,
        DataLayer::Data | DataLayer::Counts => (mean + pseudocount).ln(),
    }
}

fn to_linear(value: f64, layer: DataLayer) -> f64 {
    match layer {
        DataLayer::Data => value.exp_m1(),
        DataLayer::Counts | DataLayer::ScaleData => value,
    }
}

fn rebase(natural: f64, layer: DataLayer, base: FoldChangeBase) -> f64 {
    match (layer, base) {
        (DataLayer::ScaleData, _) | (_, FoldChangeBase::Natural) => natural,
        (_, FoldChangeBase::Two) => natural / std::f64::consts::LN_2,
    }
}

/// Detection fractions and fold changes for the listed feature rows.
///
/// Only the explicitly stored entries of each row are visited; implicit zeros
/// contribute nothing to either the detection counts or the linear sums.
pub fn summarize_features<T>(
    matrix: &FeatureMatrix<T>,
    groups: &CellGroups,
    features: &[usize],
    layer: DataLayer,
    pseudocount: f64,
    base: FoldChangeBase,
    parallel: bool,
) -> Vec<FeatureSummary>
where
    T: FloatOpsTS,
{
    let lookup = groups.lookup(matrix.n_cells());
    let n1 = groups.n1();
    let n2 = groups.n2();

    map_features(features.len(), parallel, |i| {
        let mut expressed = [0usize; 2];
        let mut sums = [0.0f64; 2];
        for (pos, value) in matrix.row_entries(features[i], &lookup) {
            let g = usize::from(pos >= n1);
            if value > 0.0 {
                expressed[g] += 1;
            }
            sums[g] += to_linear(value, layer);
        }
        let diff = log_mean_from_linear_sum(sums[0], n1, layer, pseudocount)
            - log_mean_from_linear_sum(sums[1], n2, layer, pseudocount);
        FeatureSummary {
            pct_1: round_digits(expressed[0] as f64 / n1 as f64, 3),
            pct_2: round_digits(expressed[1] as f64 / n2 as f64, 3),
            avg_log_fc: rebase(diff, layer, base),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Fraction of strictly positive values, rounded to 3 decimals.
    fn detection_fraction(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let expressed = values.iter().filter(|&&v| v > 0.0).count();
        round_digits(expressed as f64 / values.len() as f64, 3)
    }

    /// Fold change between two dense groups of values.
    ///
    /// `Data` layers are averaged after undoing log1p, then log-transformed again;
    /// `Counts` are averaged directly and log-transformed; `ScaleData` reports the
    /// difference of raw means.
    fn log_fold_change(
        group1: &[f64],
        group2: &[f64],
        layer: DataLayer,
        pseudocount: f64,
        base: FoldChangeBase,
    ) -> f64 {
        let sum1: f64 = group1.iter().map(|&v| to_linear(v, layer)).sum();
        let sum2: f64 = group2.iter().map(|&v| to_linear(v, layer)).sum();
        let diff = log_mean_from_linear_sum(sum1, group1.len(), layer, pseudocount)
            - log_mean_from_linear_sum(sum2, group2.len(), layer, pseudocount);
        rebase(diff, layer, base)
    }

    fn create_test_matrix() -> FeatureMatrix<f64> {
        // Two groups (columns 0,1,2 vs 3,4,5)
        // Row 0: clear difference
        // Row 1: no difference
        // Row 2: only expressed in group 2
        FeatureMatrix::from_dense_rows(
            &[
                vec![2.0, 2.2, 1.8, 0.5, 0.0, 0.4],
                vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                vec![0.0, 0.0, 0.0, 3.0, 2.0, 1.0],
            ],
            (0..3).map(|i| format!("g{}", i)).collect(),
            (0..6).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap()
    }

    fn groups() -> CellGroups {
        CellGroups::from_indices(vec![0, 1, 2], vec![3, 4, 5], 6).unwrap()
    }

    #[test]
    fn test_detection_fraction_rounding() {
        assert_eq!(detection_fraction(&[1.0, 0.0, 0.0]), 0.333);
        assert_eq!(detection_fraction(&[1.0, 2.0, 0.0]), 0.667);
        assert_eq!(detection_fraction(&[-1.0, 0.0]), 0.0);
        assert_eq!(detection_fraction(&[]), 0.0);
    }

    #[test]
    fn test_data_layer_fold_change_undoes_log1p() {
        let g1 = [2.0, 2.2, 1.8];
        let g2 = [0.5, 0.0, 0.4];
        let fc = log_fold_change(&g1, &g2, DataLayer::Data, 1.0, FoldChangeBase::Natural);
        let m1 = g1.iter().map(|v: &f64| v.exp_m1()).sum::<f64>() / 3.0;
        let m2 = g2.iter().map(|v: &f64| v.exp_m1()).sum::<f64>() / 3.0;
        assert_abs_diff_eq!(fc, (m1 + 1.0).ln() - (m2 + 1.0).ln(), epsilon = 1e-12);

        let fc2 = log_fold_change(&g1, &g2, DataLayer::Data, 1.0, FoldChangeBase::Two);
        assert_abs_diff_eq!(fc2, fc / std::f64::consts::LN_2, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_data_fold_change_is_mean_difference() {
        let fc = log_fold_change(
            &[1.0, -1.0, 3.0],
            &[0.0, 0.0, 0.0],
            DataLayer::ScaleData,
            1.0,
            FoldChangeBase::Two,
        );
        assert_abs_diff_eq!(fc, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_counts_fold_change() {
        let fc = log_fold_change(
            &[3.0, 5.0],
            &[1.0, 1.0],
            DataLayer::Counts,
            1.0,
            FoldChangeBase::Natural,
        );
        assert_abs_diff_eq!(fc, 5.0f64.ln() - 2.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_sparse_summary_matches_dense() {
        let m = create_test_matrix();
        let g = groups();
        let summaries = summarize_features(
            &m,
            &g,
            &[0, 1, 2],
            DataLayer::Data,
            1.0,
            FoldChangeBase::Natural,
            false,
        );

        let lookup = g.lookup(6);
        for (row, s) in summaries.iter().enumerate() {
            let dense = m.row_values(row, &lookup);
            let (a, b) = dense.split_at(3);
            assert_eq!(s.pct_1, detection_fraction(a));
            assert_eq!(s.pct_2, detection_fraction(b));
            assert_abs_diff_eq!(
                s.avg_log_fc,
                log_fold_change(a, b, DataLayer::Data, 1.0, FoldChangeBase::Natural),
                epsilon = 1e-12
            );
        }
        assert_eq!(summaries[0].pct_2, 0.667);
        assert_abs_diff_eq!(summaries[1].avg_log_fc, 0.0, epsilon = 1e-12);
        assert!(summaries[2].avg_log_fc < 0.0);
        assert_eq!(summaries[2].max_pct(), 1.0);
    }
}
