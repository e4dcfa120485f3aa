use anyhow::Result;
use log::debug;
use ndarray::Array2;
use single_utilities::traits::FloatOpsTS;

use crate::diagnostics::Diagnostics;
use crate::error::MarkerError;
use crate::matrix::{CellGroups, DataLayer, FeatureMatrix};
use crate::testing::utils::map_features;
use crate::testing::{FeatureOutcome, TTestType, TestMethod, TestResult};

pub mod discrete;

pub mod parametric;

pub mod nonparametric;

pub mod glm;

pub mod regression;

#[cfg(feature = "hurdle")]
pub mod hurdle;

#[cfg(feature = "size-factor")]
pub mod size_factor;

/// Optional test families compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub hurdle: bool,
    pub size_factor: bool,
}

impl Capabilities {
    /// Report the cargo features this crate was built with.
    pub fn detect() -> Self {
        Capabilities {
            hurdle: cfg!(feature = "hurdle"),
            size_factor: cfg!(feature = "size-factor"),
        }
    }

    /// Only the always-available tests.
    pub fn none() -> Self {
        Capabilities {
            hurdle: false,
            size_factor: false,
        }
    }

    /// Fail with `MissingCapability` if `method` needs something this build lacks.
    pub fn require(&self, method: TestMethod) -> Result<(), MarkerError> {
        let missing = match method {
            TestMethod::Hurdle if !self.hurdle => Some("hurdle"),
            TestMethod::SizeFactor if !self.size_factor => Some("size-factor"),
            _ => None,
        };
        match missing {
            Some(feature) => Err(MarkerError::MissingCapability {
                test: method.name().to_string(),
                feature: feature.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::detect()
    }
}

/// Read-only inputs shared by every per-feature test of one comparison.
#[derive(Debug, Clone, Copy)]
pub struct TestContext<'a> {
    pub groups: &'a CellGroups,
    /// Covariate rows in `groups.ordered_cells()` order.
    pub covariates: Option<&'a Array2<f64>>,
    pub layer: DataLayer,
    /// Minimum expressing cells per group for the count GLMs.
    pub min_cells: usize,
    pub parallel: bool,
}

pub trait MatrixStatTests<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        groups: &CellGroups,
        features: &[usize],
        test_type: TTestType,
        parallel: bool,
    ) -> Vec<TestResult>;

    fn mann_whitney_test(
        &self,
        groups: &CellGroups,
        features: &[usize],
        parallel: bool,
    ) -> Vec<TestResult>;

    /// Run `method` on every listed feature row. Outcomes are in `features`
    /// order; skipped features are also reported as warnings.
    fn marker_test(
        &self,
        method: TestMethod,
        features: &[usize],
        ctx: &TestContext<'_>,
        capabilities: Capabilities,
    ) -> Result<(Vec<FeatureOutcome>, Diagnostics)>;
}

impl<T> MatrixStatTests<T> for FeatureMatrix<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        groups: &CellGroups,
        features: &[usize],
        test_type: TTestType,
        parallel: bool,
    ) -> Vec<TestResult> {
        let lookup = groups.lookup(self.n_cells());
        let (n1, n2) = (groups.n1(), groups.n2());
        map_features(features.len(), parallel, |i| {
            let entries = self.row_entries(features[i], &lookup);
            let (g1, g2) = parametric::accumulate_group_sums(&entries, n1, n2);
            parametric::fast_t_test_from_sums(g1, g2, test_type)
        })
    }

    fn mann_whitney_test(
        &self,
        groups: &CellGroups,
        features: &[usize],
        parallel: bool,
    ) -> Vec<TestResult> {
        let lookup = groups.lookup(self.n_cells());
        let (n1, n2) = (groups.n1(), groups.n2());
        map_features(features.len(), parallel, |i| {
            nonparametric::rank_sums_sparse(&self.row_entries(features[i], &lookup), n1, n2).test()
        })
    }

    fn marker_test(
        &self,
        method: TestMethod,
        features: &[usize],
        ctx: &TestContext<'_>,
        capabilities: Capabilities,
    ) -> Result<(Vec<FeatureOutcome>, Diagnostics)> {
        capabilities.require(method)?;
        debug!("Running {} on {} features", method, features.len());

        let mut diagnostics = Diagnostics::new();
        let groups = ctx.groups;
        let lookup = groups.lookup(self.n_cells());
        let (n1, n2) = (groups.n1(), groups.n2());
        let parallel = ctx.parallel;
        let dense = |i: usize| self.row_values(features[i], &lookup);

        let outcomes: Vec<FeatureOutcome> = match method {
            TestMethod::Wilcoxon => self
                .mann_whitney_test(groups, features, parallel)
                .into_iter()
                .map(FeatureOutcome::Tested)
                .collect(),
            TestMethod::WilcoxonNaive => map_features(features.len(), parallel, |i| {
                let values = dense(i);
                let (x, y) = values.split_at(n1);
                FeatureOutcome::Tested(nonparametric::mann_whitney(x, y))
            }),
            TestMethod::Roc => map_features(features.len(), parallel, |i| {
                let entries = self.row_entries(features[i], &lookup);
                let sums = nonparametric::rank_sums_sparse(&entries, n1, n2);
                nonparametric::auc_outcome(&sums)
            }),
            TestMethod::TTest => self
                .t_test(groups, features, TTestType::Welch, parallel)
                .into_iter()
                .map(FeatureOutcome::Tested)
                .collect(),
            TestMethod::Bimod => map_features(features.len(), parallel, |i| {
                let values = dense(i);
                let (x, y) = values.split_at(n1);
                FeatureOutcome::Tested(parametric::bimodal_lrt(x, y))
            }),
            TestMethod::NegativeBinomial | TestMethod::Poisson => {
                let model = if method == TestMethod::Poisson {
                    regression::CountModel::Poisson
                } else {
                    regression::CountModel::NegativeBinomial
                };
                map_features(features.len(), parallel, |i| {
                    regression::glm_test(&dense(i), n1, model, ctx.covariates, ctx.min_cells)
                })
            }
            TestMethod::LogisticRegression => map_features(features.len(), parallel, |i| {
                regression::logistic_lr_test(&dense(i), n1, ctx.covariates)
                    .map(FeatureOutcome::Tested)
            })
            .into_iter()
            .collect::<Result<Vec<_>>>()?,
            TestMethod::Hurdle => run_hurdle(features.len(), parallel, &dense, n1, ctx.covariates)?,
            TestMethod::SizeFactor => {
                if ctx.layer != DataLayer::Counts {
                    return Err(MarkerError::InvalidMatrix(format!(
                        "the {} test needs the Counts layer, got {:?}",
                        method, ctx.layer
                    ))
                    .into());
                }
                run_size_factor(self, groups, features, parallel, &mut diagnostics)?
            }
        };

        for (outcome, &feature) in outcomes.iter().zip(features) {
            if let FeatureOutcome::Skipped(reason) = outcome {
                diagnostics.warn_feature(&self.feature_names()[feature], reason.clone());
            }
        }
        Ok((outcomes, diagnostics))
    }
}

#[cfg(feature = "hurdle")]
fn run_hurdle<F>(
    n_features: usize,
    parallel: bool,
    dense: &F,
    n1: usize,
    covariates: Option<&Array2<f64>>,
) -> Result<Vec<FeatureOutcome>>
where
    F: Fn(usize) -> Vec<f64> + Sync,
{
    map_features(n_features, parallel, |i| {
        hurdle::hurdle_test(&dense(i), n1, covariates).map(FeatureOutcome::Tested)
    })
    .into_iter()
    .collect()
}

#[cfg(not(feature = "hurdle"))]
fn run_hurdle<F>(
    _n_features: usize,
    _parallel: bool,
    _dense: &F,
    _n1: usize,
    _covariates: Option<&Array2<f64>>,
) -> Result<Vec<FeatureOutcome>>
where
    F: Fn(usize) -> Vec<f64> + Sync,
{
    Err(MarkerError::MissingCapability {
        test: TestMethod::Hurdle.name().to_string(),
        feature: "hurdle".to_string(),
    }
    .into())
}

#[cfg(feature = "size-factor")]
fn run_size_factor<T: FloatOpsTS>(
    matrix: &FeatureMatrix<T>,
    groups: &CellGroups,
    features: &[usize],
    parallel: bool,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FeatureOutcome>> {
    size_factor::size_factor_test(matrix, groups, features, parallel, diagnostics)
}

#[cfg(not(feature = "size-factor"))]
fn run_size_factor<T: FloatOpsTS>(
    _matrix: &FeatureMatrix<T>,
    _groups: &CellGroups,
    _features: &[usize],
    _parallel: bool,
    _diagnostics: &mut Diagnostics,
) -> Result<Vec<FeatureOutcome>> {
    Err(MarkerError::MissingCapability {
        test: TestMethod::SizeFactor.name().to_string(),
        feature: "size-factor".to_string(),
    }
    .into())
}
