use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MarkerError;

pub mod correction;
pub mod effect;
pub mod inference;

pub mod utils;

/// Per-feature hypothesis test used to compare two cell groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TestMethod {
    /// Wilcoxon rank-sum test over sparse rows, zeros ranked as one tie block.
    #[default]
    Wilcoxon,
    /// Wilcoxon rank-sum test with a dense sort per feature.
    WilcoxonNaive,
    /// Likelihood-ratio test for a zero point mass plus Gaussian tail.
    Bimod,
    /// Area under the ROC curve of group 1 against group 2.
    Roc,
    /// Welch two-sample t-test.
    TTest,
    /// Negative binomial GLM, Wald test on the group term.
    NegativeBinomial,
    /// Poisson GLM, Wald test on the group term.
    Poisson,
    /// Logistic regression of group membership, likelihood-ratio test.
    LogisticRegression,
    /// Two-part detection / magnitude model.
    Hurdle,
    /// Size-factor normalized negative binomial Wald test over raw counts.
    SizeFactor,
}

impl TestMethod {
    pub const ALL: [TestMethod; 10] = [
        TestMethod::Wilcoxon,
        TestMethod::WilcoxonNaive,
        TestMethod::Bimod,
        TestMethod::Roc,
        TestMethod::TTest,
        TestMethod::NegativeBinomial,
        TestMethod::Poisson,
        TestMethod::LogisticRegression,
        TestMethod::Hurdle,
        TestMethod::SizeFactor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TestMethod::Wilcoxon => "wilcox",
            TestMethod::WilcoxonNaive => "wilcox_naive",
            TestMethod::Bimod => "bimod",
            TestMethod::Roc => "roc",
            TestMethod::TTest => "t",
            TestMethod::NegativeBinomial => "negbinom",
            TestMethod::Poisson => "poisson",
            TestMethod::LogisticRegression => "LR",
            TestMethod::Hurdle => "MAST",
            TestMethod::SizeFactor => "DESeq2",
        }
    }

    /// Whether the test includes latent covariates in its model.
    pub fn uses_covariates(&self) -> bool {
        matches!(
            self,
            TestMethod::NegativeBinomial
                | TestMethod::Poisson
                | TestMethod::LogisticRegression
                | TestMethod::Hurdle
        )
    }

    /// The AUC test reports a classification score instead of a p-value.
    pub fn reports_p_values(&self) -> bool {
        !matches!(self, TestMethod::Roc)
    }

    /// Tests that normalize internally and must not see pre-filtered features.
    pub fn bypasses_prefilter(&self) -> bool {
        matches!(self, TestMethod::SizeFactor)
    }
}

impl fmt::Display for TestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TestMethod {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "wilcox" | "wilcoxon" | "fast-rank-sum" => TestMethod::Wilcoxon,
            "wilcox_naive" | "naive-rank-sum" => TestMethod::WilcoxonNaive,
            "bimod" | "likelihood-ratio-bimodal" => TestMethod::Bimod,
            "roc" | "auc" => TestMethod::Roc,
            "t" | "t-test" => TestMethod::TTest,
            "negbinom" | "negative-binomial" => TestMethod::NegativeBinomial,
            "poisson" => TestMethod::Poisson,
            "LR" | "logistic-regression" => TestMethod::LogisticRegression,
            "MAST" | "hurdle" => TestMethod::Hurdle,
            "DESeq2" | "size-factor" => TestMethod::SizeFactor,
            other => return Err(MarkerError::UnknownTest(other.to_string())),
        };
        Ok(method)
    }
}

impl TryFrom<String> for TestMethod {
    type Error = MarkerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TestMethod> for String {
    fn from(method: TestMethod) -> Self {
        method.name().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TTestType {
    Student, // Equal variance
    Welch,   // Unequal variance
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    /// The test statistic value (e.g., t-statistic, U statistic, LRT chi-square)
    pub statistic: f64,
    /// The p-value of the test
    pub p_value: f64,
    /// Degrees of freedom (for parametric inference)
    pub degrees_of_freedom: Option<f64>,
    /// Effect size measurement
    pub effect_size: Option<f64>,
    /// Standard error of the effect size or test statistic
    pub standard_error: Option<f64>,
}

impl TestResult {
    /// Create a new test result with minimal information
    pub fn new(statistic: f64, p_value: f64) -> Self {
        TestResult {
            statistic,
            p_value,
            degrees_of_freedom: None,
            effect_size: None,
            standard_error: None,
        }
    }

    /// A result that carries no evidence against the null.
    pub fn null() -> Self {
        TestResult::new(0.0, 1.0)
    }

    pub fn with_effect_size(mut self, effect_size: f64) -> Self {
        self.effect_size = Some(effect_size);
        self
    }

    pub fn with_degrees_of_freedom(mut self, df: f64) -> Self {
        self.degrees_of_freedom = Some(df);
        self
    }

    pub fn with_standard_error(mut self, se: f64) -> Self {
        self.standard_error = Some(se);
        self
    }
}

/// What a strategy produced for one feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    Tested(TestResult),
    Auc { auc: f64, power: f64 },
    /// Excluded from the marker table; the reason is reported as a warning.
    Skipped(String),
}

impl FeatureOutcome {
    pub fn p_value(&self) -> Option<f64> {
        match self {
            FeatureOutcome::Tested(r) => Some(r.p_value),
            _ => None,
        }
    }
}
