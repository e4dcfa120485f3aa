//! Marker discovery between two cell groups, or for every cluster against the rest.
//!
//! [`find_markers`] runs the whole pipeline for one comparison: capability
//! check, pre-filter, optional downsampling, the per-feature test and the
//! assembly of the ranked table. [`find_all_markers`] repeats it for each
//! cluster label.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::diagnostics::Diagnostics;
use crate::error::MarkerError;
use crate::matrix::{CellGroups, Covariates, DataLayer, FeatureMatrix};
use crate::testing::TestMethod;
use crate::testing::effect::FoldChangeBase;
use crate::testing::inference::{Capabilities, MatrixStatTests, TestContext};
use crate::testing::utils::extract_unique_labels;

pub mod prefilter;
pub mod table;

pub use prefilter::{FilteredFeatures, Prefilter};
pub use table::{MarkerRow, MarkerStats, MarkerTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub method: TestMethod,
    pub layer: DataLayer,
    pub logfc_threshold: f64,
    pub min_pct: f64,
    pub min_diff_pct: Option<f64>,
    pub only_pos: bool,
    /// Count GLMs skip features expressed in fewer cells than this in both groups.
    pub min_cells_feature: usize,
    /// Groups smaller than this produce a warning.
    pub min_cells_group: usize,
    pub max_cells_per_group: Option<usize>,
    pub random_seed: u64,
    pub pseudocount: f64,
    pub fc_base: FoldChangeBase,
    pub parallel: bool,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        MarkerConfig {
            method: TestMethod::Wilcoxon,
            layer: DataLayer::Data,
            logfc_threshold: 0.25,
            min_pct: 0.1,
            min_diff_pct: None,
            only_pos: false,
            min_cells_feature: 3,
            min_cells_group: 3,
            max_cells_per_group: None,
            random_seed: 1,
            pseudocount: 1.0,
            fc_base: FoldChangeBase::Natural,
            parallel: true,
        }
    }
}

impl MarkerConfig {
    /// Parse a JSON object; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid marker configuration")
    }

    pub fn prefilter(&self) -> Prefilter {
        Prefilter {
            min_pct: self.min_pct,
            min_diff_pct: self.min_diff_pct,
            logfc_threshold: self.logfc_threshold,
            only_pos: self.only_pos,
            bypass: self.method.bypasses_prefilter(),
        }
    }
}

fn check_groups(groups: &CellGroups, config: &MarkerConfig, diagnostics: &mut Diagnostics) {
    for (label, n) in [("Group 1", groups.n1()), ("Group 2", groups.n2())] {
        if n < config.min_cells_group {
            diagnostics.warn(format!(
                "{} has {} cells, fewer than min_cells_group ({})",
                label, n, config.min_cells_group
            ));
        }
    }
}

/// Differential features between the two groups of `groups`.
///
/// Covariates are only used by the regression-based tests; passing them to any
/// other test adds a warning. Errors for unknown capabilities, empty filter
/// results, missing covariate cells or failed model fits abort the call before
/// any table is produced.
pub fn find_markers<T>(
    matrix: &FeatureMatrix<T>,
    groups: &CellGroups,
    covariates: Option<&Covariates>,
    config: &MarkerConfig,
    capabilities: Capabilities,
) -> Result<MarkerTable>
where
    T: FloatOpsTS,
{
    capabilities.require(config.method)?;

    let mut diagnostics = Diagnostics::new();
    check_groups(groups, config, &mut diagnostics);
    if covariates.is_some() && !config.method.uses_covariates() {
        diagnostics.warn(format!(
            "covariates only apply to negbinom, poisson, LR and MAST; ignoring them for {}",
            config.method
        ));
    }

    let filtered = config.prefilter().apply(
        matrix,
        groups,
        config.layer,
        config.pseudocount,
        config.fc_base,
        config.parallel,
    )?;

    let tested_groups = match config.max_cells_per_group {
        Some(max) => groups.downsample(max, config.random_seed),
        None => groups.clone(),
    };
    debug!(
        "Testing {} features over {} vs {} cells",
        filtered.features.len(),
        tested_groups.n1(),
        tested_groups.n2()
    );

    let covariate_rows = match covariates {
        Some(cov) if config.method.uses_covariates() => {
            debug!("Adjusting for {} covariates", cov.n_covariates());
            let cells: Vec<&str> = tested_groups
                .ordered_cells()
                .into_iter()
                .map(|c| matrix.cell_names()[c].as_str())
                .collect();
            Some(cov.reindex(&cells)?)
        }
        _ => None,
    };

    let ctx = TestContext {
        groups: &tested_groups,
        covariates: covariate_rows.as_ref(),
        layer: config.layer,
        min_cells: config.min_cells_feature,
        parallel: config.parallel,
    };
    let (outcomes, test_diagnostics) =
        matrix.marker_test(config.method, &filtered.features, &ctx, capabilities)?;
    diagnostics.extend(test_diagnostics);

    MarkerTable::assemble(
        matrix,
        config.method,
        config.fc_base,
        &filtered.features,
        &filtered.summaries,
        outcomes,
        diagnostics,
    )
}

/// Every cluster of `labels` against all remaining cells, in sorted label order.
///
/// Rows of p-value tables with `p_val >= return_thresh` are dropped. A cluster
/// whose features all fail the pre-filter is reported as a warning and skipped;
/// every other error aborts.
pub fn find_all_markers<T, S>(
    matrix: &FeatureMatrix<T>,
    labels: &[S],
    covariates: Option<&Covariates>,
    config: &MarkerConfig,
    capabilities: Capabilities,
    return_thresh: f64,
) -> Result<MarkerTable>
where
    T: FloatOpsTS,
    S: AsRef<str>,
{
    if labels.len() != matrix.n_cells() {
        return Err(MarkerError::InvalidGroups(format!(
            "{} labels for {} cells",
            labels.len(),
            matrix.n_cells()
        ))
        .into());
    }
    capabilities.require(config.method)?;

    let clusters = extract_unique_labels(labels);
    let mut diagnostics = Diagnostics::new();
    let mut parts = Vec::with_capacity(clusters.len());

    for cluster in &clusters {
        info!("Calculating markers for cluster {}", cluster);
        let groups = CellGroups::from_labels(labels, cluster, None)?;
        let mut table = match find_markers(matrix, &groups, covariates, config, capabilities) {
            Ok(table) => table,
            Err(e) => {
                if matches!(
                    e.downcast_ref::<MarkerError>(),
                    Some(MarkerError::EmptyFeatureSet(_))
                ) {
                    diagnostics.warn(format!("cluster {}: {}", cluster, e));
                    continue;
                }
                return Err(e.context(format!("Marker test failed for cluster {}", cluster)));
            }
        };
        if config.method.reports_p_values() {
            table.retain(|row| row.p_val().is_some_and(|p| p < return_thresh));
        }
        table.tag_cluster(cluster);
        parts.push(table);
    }

    Ok(MarkerTable::concat(
        config.method,
        config.fc_base,
        matrix.n_features(),
        parts,
        diagnostics,
    ))
}
