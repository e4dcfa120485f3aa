//! Typed errors for caller mistakes.
//!
//! Public functions return `anyhow::Result`; the variants below are what ends up
//! inside the `anyhow::Error` for input problems, so callers can
//! `downcast_ref::<MarkerError>()` when they need to branch on the cause.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarkerError {
    #[error("No features pass the {0} threshold")]
    EmptyFeatureSet(String),

    #[error("Unknown test: '{0}'")]
    UnknownTest(String),

    #[error("Test '{test}' is not available, please install it with the `{feature}` feature")]
    MissingCapability { test: String, feature: String },

    #[error("Invalid cell groups: {0}")]
    InvalidGroups(String),

    #[error("Covariates do not cover cell '{0}'")]
    CovariateMismatch(String),

    #[error("Test '{0}' requires raw non-negative integer counts")]
    NonIntegerCounts(String),

    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("No cells shared between the query and the activity matrix")]
    NoSharedCells,

    #[error("No features shared between the reference and the query activity matrix")]
    NoSharedFeatures,

    #[error("No anchors found between reference and query")]
    NoAnchors,
}
