//! # single-markers
//!
//! Differential marker testing and cross-modality label transfer for single-cell data, part of the
//! single-rust ecosystem.
//!
//! Marker testing compares two populations of cells feature by feature. Features are first
//! narrowed by detection rate and fold change, then tested with one of several methods, and the
//! results are returned as a ranked, Bonferroni-corrected table. Label transfer carries cluster
//! labels from a transcriptome reference onto chromatin-accessibility cells through anchors in a
//! shared embedding.
//!
//! ## Core Features
//!
//! - **Marker tests**: Wilcoxon rank-sum, Welch and Student t-tests, bimodal likelihood ratio,
//!   ROC/AUC, Poisson and negative binomial GLMs, logistic regression, hurdle and size-factor
//!   count models
//! - **Pre-filtering**: minimum detection rate, detection-rate difference and fold change
//! - **Diagnostics**: advisories returned with every result and forwarded to the `log` facade
//! - **Label transfer**: gene activity, anchors, label and expression transfer, joint UMAP
//! - **Sparse Matrix Support**: input is a labelled `CsrMatrix` from nalgebra-sparse
//!
//! ## Quick Start
//!
//! Build a [`FeatureMatrix`], choose two [`CellGroups`] and call [`find_markers`] with a
//! [`MarkerConfig`]; [`find_all_markers`] compares every cluster against the rest.
//!
//! ## Module Organization
//!
//! - **[`matrix`]**: labelled feature-by-cell matrices, cell groups and covariates
//! - **[`testing`]**: statistical tests, effect sizes and multiple testing correction
//! - **[`markers`]**: pre-filter, marker drivers and the result table
//! - **[`transfer`]**: the label transfer pipeline

pub mod diagnostics;
pub mod error;
pub mod markers;
pub mod matrix;
pub mod testing;
pub mod transfer;

pub use diagnostics::{Diagnostic, Diagnostics, Level};
pub use error::MarkerError;
pub use markers::{
    MarkerConfig, MarkerRow, MarkerStats, MarkerTable, find_all_markers, find_markers,
};
pub use matrix::{CellGroups, Covariates, DataLayer, FeatureMatrix};
pub use testing::TestMethod;
pub use testing::inference::Capabilities;
pub use transfer::{TransferConfig, TransferInputs, TransferOutcome, run_label_transfer};
