//! Label transfer from a transcriptome reference onto chromatin-accessibility
//! query cells.
//!
//! [`run_label_transfer`] derives gene activity for the query, anchors it to
//! the reference in a canonical-correlation space, transfers cluster labels
//! and reference expression through the anchors, embeds both datasets jointly
//! and writes the plots and the metadata table. All computation finishes
//! before the first file is written, so a failed run leaves nothing behind.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;
use ndarray::{Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::MarkerError;
use crate::matrix::FeatureMatrix;

pub mod activity;
pub mod anchors;
pub mod embedding;
mod neighbors;
pub mod normalize;
pub mod projection;
pub mod report;
mod svd;

pub use activity::{GeneAnnotation, GenomicRegion, Strand};
pub use anchors::{Anchor, AnchorSet};
pub use projection::Prediction;
pub use report::CellRecord;

use crate::transfer::anchors::{dense_rows, find_transfer_anchors};
use crate::transfer::embedding::{UmapConfig, pca, umap};
use crate::transfer::normalize::{log_normalize_median, scale_rows};
use crate::transfer::projection::{anchor_weights, impute, transfer_labels};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Prefix of every output file.
    pub project: String,
    pub output_dir: PathBuf,
    pub rna_label: String,
    pub atac_label: String,
    /// Canonical and principal dimensions.
    pub dims: usize,
    pub k_anchor: usize,
    pub k_score: usize,
    pub k_weight: usize,
    pub sd_weight: f64,
    /// Bases added before each gene's transcription start.
    pub upstream: u64,
    pub umap_neighbors: usize,
    pub umap_min_dist: f64,
    pub umap_epochs: usize,
    pub seed: u64,
    /// Upper cap on scaled values.
    pub scale_clip: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            project: "project".to_string(),
            output_dir: PathBuf::from("."),
            rna_label: "RNA".to_string(),
            atac_label: "ATAC".to_string(),
            dims: 20,
            k_anchor: 5,
            k_score: 30,
            k_weight: 50,
            sd_weight: 1.0,
            upstream: 2000,
            umap_neighbors: 30,
            umap_min_dist: 0.3,
            umap_epochs: 200,
            seed: 42,
            scale_clip: 10.0,
        }
    }
}

impl TransferConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid label transfer configuration")
    }

    fn umap_config(&self) -> UmapConfig {
        UmapConfig {
            n_neighbors: self.umap_neighbors,
            min_dist: self.umap_min_dist,
            n_epochs: self.umap_epochs,
            seed: self.seed,
            ..UmapConfig::default()
        }
    }
}

/// Log-normalized transcriptome reference with its cluster labels.
#[derive(Debug, Clone)]
pub struct Reference {
    pub data: FeatureMatrix<f64>,
    /// One label per cell, in column order.
    pub clusters: Vec<String>,
    pub variable_features: Vec<String>,
}

/// Region-by-cell accessibility counts with the query's own cluster labels.
#[derive(Debug, Clone)]
pub struct Query {
    pub regions: FeatureMatrix<f64>,
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ActivitySource {
    /// Gene-by-cell activity scores computed elsewhere.
    Precomputed(FeatureMatrix<f64>),
    /// Derive activity from the query regions and this annotation.
    Annotation(Vec<GeneAnnotation>),
}

#[derive(Debug, Clone)]
pub struct TransferInputs {
    pub reference: Reference,
    pub query: Query,
    pub activity: ActivitySource,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Reference cells first, then the query cells that received a prediction.
    pub cells: Vec<CellRecord>,
    pub anchors: Vec<Anchor>,
    /// Sorted reference labels, the columns of `prediction_scores`.
    pub labels: Vec<String>,
    /// Query cells x labels.
    pub prediction_scores: Array2<f64>,
    /// Imputed reference variable features over the query cells.
    pub imputed: FeatureMatrix<f64>,
    pub output_files: Vec<PathBuf>,
    pub diagnostics: Diagnostics,
}

impl TransferOutcome {
    pub fn predictions(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.cells.iter().filter_map(|c| {
            let id = c.predicted_id.as_deref()?;
            Some((c.cell.as_str(), id, c.prediction_score.unwrap_or(0.0)))
        })
    }
}

fn check_labels(what: &str, labels: &[String], n_cells: usize) -> Result<()> {
    if labels.len() != n_cells {
        return Err(MarkerError::InvalidMatrix(format!(
            "{} has {} cluster labels for {} cells",
            what,
            labels.len(),
            n_cells
        ))
        .into());
    }
    Ok(())
}

/// Cell names for the merged dataset; names present in both datasets get the
/// technology label appended.
fn merged_names(
    reference: &[String],
    query: &[String],
    rna_label: &str,
    atac_label: &str,
) -> (Vec<String>, Vec<String>) {
    let ref_set: HashSet<&str> = reference.iter().map(String::as_str).collect();
    let clashing: HashSet<&str> = query
        .iter()
        .map(String::as_str)
        .filter(|c| ref_set.contains(c))
        .collect();
    let rename = |cells: &[String], label: &str| -> Vec<String> {
        cells
            .iter()
            .map(|c| {
                if clashing.contains(c.as_str()) {
                    format!("{}_{}", c, label)
                } else {
                    c.clone()
                }
            })
            .collect()
    };
    (rename(reference, rna_label), rename(query, atac_label))
}

/// Run the full label transfer and write its outputs under
/// `config.output_dir`.
pub fn run_label_transfer(
    inputs: &TransferInputs,
    config: &TransferConfig,
) -> Result<TransferOutcome> {
    let reference = &inputs.reference;
    let query = &inputs.query;
    check_labels("reference", &reference.clusters, reference.data.n_cells())?;
    check_labels("query", &query.clusters, query.regions.n_cells())?;
    let mut diagnostics = Diagnostics::new();

    info!(
        "Tagging {} {} cells and {} {} cells",
        reference.data.n_cells(),
        config.rna_label,
        query.regions.n_cells(),
        config.atac_label
    );

    info!("Deriving gene activity for the query");
    let raw_activity = match &inputs.activity {
        ActivitySource::Precomputed(scores) => {
            activity::restrict_to_cells(scores, query.regions.cell_names())?
        }
        ActivitySource::Annotation(genes) => {
            activity::gene_activity(&query.regions, genes, config.upstream)?
        }
    };
    if raw_activity.n_cells() < query.regions.n_cells() {
        diagnostics.warn(format!(
            "activity scores cover {} of {} query cells; the rest are left out",
            raw_activity.n_cells(),
            query.regions.n_cells()
        ));
    }
    let activity = log_normalize_median(&raw_activity)?;
    let query_cells: Vec<usize> = activity
        .cell_names()
        .iter()
        .filter_map(|c| query.regions.cell_position(c))
        .collect();

    info!("Finding transfer anchors");
    let anchor_set = find_transfer_anchors(
        &reference.data,
        &reference.variable_features,
        &activity,
        config.dims,
        config.k_anchor,
        config.k_score,
        config.scale_clip,
    )?;

    info!("Transferring labels");
    let weights = anchor_weights(
        &anchor_set.query_embedding,
        &anchor_set.anchors,
        config.k_weight,
        config.sd_weight,
    );
    let (labels, prediction_scores, predictions) =
        transfer_labels(&weights, &anchor_set.anchors, &reference.clusters);

    info!("Imputing reference expression for query cells");
    let variable: Vec<String> = reference
        .variable_features
        .iter()
        .filter(|f| reference.data.feature_position(f).is_some())
        .cloned()
        .collect();
    let reference_values = dense_rows(&reference.data, &variable)?;
    let imputed_values = impute(&weights, &anchor_set.anchors, &reference_values);

    info!("Embedding reference and query cells");
    let merged = concatenate(Axis(1), &[reference_values.view(), imputed_values.view()])
        .context("Failed to merge reference and imputed query values")?;
    let components = pca(&scale_rows(&merged, config.scale_clip), config.dims)?;
    let coordinates = umap(&components, &config.umap_config())?;

    let query_names: Vec<String> = activity.cell_names().to_vec();
    let (ref_names, query_tagged) = merged_names(
        reference.data.cell_names(),
        &query_names,
        &config.rna_label,
        &config.atac_label,
    );
    let n_ref = reference.data.n_cells();
    let mut cells = Vec::with_capacity(n_ref + query_names.len());
    for (i, name) in ref_names.into_iter().enumerate() {
        cells.push(CellRecord {
            cell: name,
            technology: config.rna_label.clone(),
            rna_cluster: Some(reference.clusters[i].clone()),
            atac_cluster: None,
            predicted_id: None,
            prediction_score: None,
            umap: [coordinates[[i, 0]], coordinates[[i, 1]]],
        });
    }
    for (q, (name, prediction)) in query_tagged.into_iter().zip(predictions).enumerate() {
        let row = n_ref + q;
        cells.push(CellRecord {
            cell: name,
            technology: config.atac_label.clone(),
            rna_cluster: None,
            atac_cluster: Some(query.clusters[query_cells[q]].clone()),
            predicted_id: Some(prediction.predicted_id),
            prediction_score: Some(prediction.score),
            umap: [coordinates[[row, 0]], coordinates[[row, 1]]],
        });
    }

    let imputed = FeatureMatrix::from_dense_rows(
        &imputed_values.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>(),
        variable,
        query_names,
    )?;

    info!("Writing outputs to {}", config.output_dir.display());
    let output_files = report::write_report(&config.output_dir, &config.project, &cells)?;

    Ok(TransferOutcome {
        cells,
        anchors: anchor_set.anchors,
        labels,
        prediction_scores,
        imputed,
        output_files,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_json() {
        let c = TransferConfig::from_json_str(r#"{"project": "pbmc", "k_weight": 20}"#).unwrap();
        assert_eq!(c.project, "pbmc");
        assert_eq!(c.k_weight, 20);
        assert_eq!(c.dims, 20);
        assert_eq!(c.upstream, 2000);
        assert!(TransferConfig::from_json_str(r#"{"dims": "many"}"#).is_err());
    }

    #[test]
    fn test_clashing_names_are_tagged() {
        let (r, q) = merged_names(
            &["a".to_string(), "b".to_string()],
            &["b".to_string(), "c".to_string()],
            "RNA",
            "ATAC",
        );
        assert_eq!(r, vec!["a".to_string(), "b_RNA".to_string()]);
        assert_eq!(q, vec!["b_ATAC".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_label_count_checked() {
        let cells = vec!["r0".into(), "r1".into()];
        let data =
            FeatureMatrix::from_dense_rows(&[vec![1.0, 2.0]], vec!["g".into()], cells).unwrap();
        let inputs = TransferInputs {
            reference: Reference {
                data: data.clone(),
                clusters: vec!["T".into()],
                variable_features: vec!["g".into()],
            },
            query: Query {
                regions: data.clone(),
                clusters: vec!["0".into(), "1".into()],
            },
            activity: ActivitySource::Precomputed(data),
        };
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig {
            output_dir: dir.path().join("out"),
            ..TransferConfig::default()
        };
        let err = run_label_transfer(&inputs, &config).unwrap_err();
        assert!(matches!(err.downcast_ref::<MarkerError>(), Some(MarkerError::InvalidMatrix(_))));
        assert!(!config.output_dir.exists());
    }
}
