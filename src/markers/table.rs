//! The ranked, corrected marker table returned to callers.

use std::cmp::Ordering;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use single_utilities::traits::FloatOpsTS;

use crate::diagnostics::Diagnostics;
use crate::matrix::FeatureMatrix;
use crate::testing::correction::bonferroni_correction;
use crate::testing::effect::{FeatureSummary, FoldChangeBase};
use crate::testing::{FeatureOutcome, TestMethod};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkerStats {
    PValue { p_val: f64, p_val_adj: f64 },
    Auc { auc: f64, power: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRow {
    pub feature: String,
    /// Set for one-vs-rest tables.
    pub cluster: Option<String>,
    pub stats: MarkerStats,
    pub avg_log_fc: f64,
    pub pct_1: f64,
    pub pct_2: f64,
}

impl MarkerRow {
    pub fn p_val(&self) -> Option<f64> {
        match self.stats {
            MarkerStats::PValue { p_val, .. } => Some(p_val),
            MarkerStats::Auc { .. } => None,
        }
    }

    pub fn p_val_adj(&self) -> Option<f64> {
        match self.stats {
            MarkerStats::PValue { p_val_adj, .. } => Some(p_val_adj),
            MarkerStats::Auc { .. } => None,
        }
    }

    pub fn auc(&self) -> Option<f64> {
        match self.stats {
            MarkerStats::Auc { auc, .. } => Some(auc),
            MarkerStats::PValue { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkerTable {
    method: TestMethod,
    fc_base: FoldChangeBase,
    total_features: usize,
    rows: Vec<MarkerRow>,
    diagnostics: Diagnostics,
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

impl MarkerTable {
    /// Join test outcomes with the per-feature summaries, drop skipped
    /// features, sort and correct.
    ///
    /// `features[i]` is the matrix row tested by `outcomes[i]`; `summaries` is
    /// indexed by matrix row. Adjusted p-values are corrected against every
    /// row of `matrix`, tested or not.
    pub fn assemble<T: FloatOpsTS>(
        matrix: &FeatureMatrix<T>,
        method: TestMethod,
        fc_base: FoldChangeBase,
        features: &[usize],
        summaries: &[FeatureSummary],
        outcomes: Vec<FeatureOutcome>,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let feature_names = matrix.feature_names();
        let total_features = matrix.n_features();
        let mut rows = Vec::with_capacity(outcomes.len());
        let mut p_values = Vec::with_capacity(outcomes.len());

        for (&feature, outcome) in features.iter().zip(outcomes) {
            let summary = &summaries[feature];
            let stats = match outcome {
                FeatureOutcome::Tested(result) => {
                    // NaN p-values come from undefined statistics, report them as non-significant
                    let p_val = if result.p_value.is_nan() { 1.0 } else { result.p_value };
                    p_values.push(p_val);
                    MarkerStats::PValue { p_val, p_val_adj: 1.0 }
                }
                FeatureOutcome::Auc { auc, power } => MarkerStats::Auc { auc, power },
                FeatureOutcome::Skipped(_) => continue,
            };
            rows.push(MarkerRow {
                feature: feature_names[feature].clone(),
                cluster: None,
                stats,
                avg_log_fc: summary.avg_log_fc,
                pct_1: summary.pct_1,
                pct_2: summary.pct_2,
            });
        }

        let adjusted = bonferroni_correction(&p_values, total_features.max(p_values.len()))?;
        let mut adjusted = adjusted.into_iter();
        for row in rows.iter_mut() {
            if let MarkerStats::PValue { p_val_adj, .. } = &mut row.stats {
                if let Some(adj) = adjusted.next() {
                    *p_val_adj = adj;
                }
            }
        }

        let mut table = MarkerTable {
            method,
            fc_base,
            total_features,
            rows,
            diagnostics,
        };
        table.sort();
        Ok(table)
    }

    /// Concatenate per-cluster tables in the given order.
    pub(crate) fn concat(
        method: TestMethod,
        fc_base: FoldChangeBase,
        total_features: usize,
        parts: Vec<MarkerTable>,
        mut diagnostics: Diagnostics,
    ) -> Self {
        let mut rows = Vec::new();
        for part in parts {
            rows.extend(part.rows);
            diagnostics.extend(part.diagnostics);
        }
        MarkerTable {
            method,
            fc_base,
            total_features,
            rows,
            diagnostics,
        }
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| match (a.stats, b.stats) {
            (MarkerStats::Auc { auc: x, .. }, MarkerStats::Auc { auc: y, .. }) => {
                descending(x, y).then_with(|| descending(a.avg_log_fc, b.avg_log_fc))
            }
            (MarkerStats::PValue { p_val: x, .. }, MarkerStats::PValue { p_val: y, .. }) => {
                x.total_cmp(&y).then_with(|| descending(a.avg_log_fc, b.avg_log_fc))
            }
            _ => Ordering::Equal,
        });
    }

    pub(crate) fn tag_cluster(&mut self, cluster: &str) {
        for row in &mut self.rows {
            row.cluster = Some(cluster.to_string());
        }
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&MarkerRow) -> bool) {
        self.rows.retain(keep);
    }

    pub fn method(&self) -> TestMethod {
        self.method
    }

    pub fn rows(&self) -> &[MarkerRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, feature: &str) -> Option<&MarkerRow> {
        self.rows.iter().find(|r| r.feature == feature)
    }

    /// Feature count the adjusted p-values were corrected against.
    pub fn total_features(&self) -> usize {
        self.total_features
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn header(&self) -> Vec<&'static str> {
        let fc = match self.fc_base {
            FoldChangeBase::Natural => "avg_logFC",
            FoldChangeBase::Two => "avg_log2FC",
        };
        let mut header = vec!["feature"];
        if self.method.reports_p_values() {
            header.extend(["p_val", fc, "pct.1", "pct.2", "p_val_adj"]);
        } else {
            header.extend(["AUC", "power", fc, "pct.1", "pct.2"]);
        }
        if self.rows.iter().any(|r| r.cluster.is_some()) {
            header.push("cluster");
        }
        header
    }

    /// Write the table as tab-separated text.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
        let header = self.header();
        let with_cluster = header.last() == Some(&"cluster");
        out.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.feature.clone()];
            match row.stats {
                MarkerStats::PValue { p_val, p_val_adj } => record.extend([
                    p_val.to_string(),
                    row.avg_log_fc.to_string(),
                    row.pct_1.to_string(),
                    row.pct_2.to_string(),
                    p_val_adj.to_string(),
                ]),
                MarkerStats::Auc { auc, power } => record.extend([
                    auc.to_string(),
                    power.to_string(),
                    row.avg_log_fc.to_string(),
                    row.pct_1.to_string(),
                    row.pct_2.to_string(),
                ]),
            }
            if with_cluster {
                record.push(row.cluster.clone().unwrap_or_default());
            }
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn write_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create marker table {}", path.display()))?;
        self.write_to(file)
    }
}
