//! Expression-based feature filters applied before any test runs.

use log::debug;
use single_utilities::traits::FloatOpsTS;

use crate::error::MarkerError;
use crate::matrix::{CellGroups, DataLayer, FeatureMatrix};
use crate::testing::effect::{FeatureSummary, FoldChangeBase, summarize_features};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prefilter {
    pub min_pct: f64,
    pub min_diff_pct: Option<f64>,
    pub logfc_threshold: f64,
    pub only_pos: bool,
    /// Keep every feature regardless of the thresholds.
    pub bypass: bool,
}

/// Surviving feature rows with the statistics of every matrix feature.
#[derive(Debug, Clone)]
pub struct FilteredFeatures {
    pub features: Vec<usize>,
    /// Indexed by matrix row, not by position in `features`.
    pub summaries: Vec<FeatureSummary>,
}

impl Prefilter {
    /// Keep features detected in more than `min_pct` of either group.
    pub fn passes_detection(&self, summary: &FeatureSummary) -> bool {
        summary.max_pct() > self.min_pct
    }

    pub fn passes_detection_difference(&self, summary: &FeatureSummary) -> bool {
        self.min_diff_pct.is_none_or(|d| summary.pct_difference() > d)
    }

    pub fn passes_fold_change(&self, summary: &FeatureSummary) -> bool {
        if self.only_pos {
            summary.avg_log_fc > self.logfc_threshold
        } else {
            summary.avg_log_fc.abs() > self.logfc_threshold
        }
    }

    /// Summarize every feature and apply the filters in order: detection,
    /// detection difference, fold change. A filter that leaves nothing fails
    /// with `EmptyFeatureSet` naming it.
    pub fn apply<T: FloatOpsTS>(
        &self,
        matrix: &FeatureMatrix<T>,
        groups: &CellGroups,
        layer: DataLayer,
        pseudocount: f64,
        base: FoldChangeBase,
        parallel: bool,
    ) -> anyhow::Result<FilteredFeatures> {
        let all: Vec<usize> = (0..matrix.n_features()).collect();
        let summaries =
            summarize_features(matrix, groups, &all, layer, pseudocount, base, parallel);

        if self.bypass {
            debug!("Pre-filter bypassed, keeping all {} features", all.len());
            return Ok(FilteredFeatures {
                features: all,
                summaries,
            });
        }

        let features: Vec<usize> = all
            .into_iter()
            .filter(|&f| self.passes_detection(&summaries[f]))
            .collect();
        if features.is_empty() {
            return Err(MarkerError::EmptyFeatureSet("min_pct".into()).into());
        }

        let features: Vec<usize> = features
            .into_iter()
            .filter(|&f| self.passes_detection_difference(&summaries[f]))
            .collect();
        if features.is_empty() {
            return Err(MarkerError::EmptyFeatureSet("min_diff_pct".into()).into());
        }

        let features: Vec<usize> = features
            .into_iter()
            .filter(|&f| self.passes_fold_change(&summaries[f]))
            .collect();
        if features.is_empty() {
            return Err(MarkerError::EmptyFeatureSet("logfc_threshold".into()).into());
        }

        debug!("{} of {} features pass the pre-filter", features.len(), matrix.n_features());
        Ok(FilteredFeatures { features, summaries })
    }
}
