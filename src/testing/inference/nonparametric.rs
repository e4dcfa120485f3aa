use crate::testing::effect::round_digits;
use crate::testing::utils::two_sided_normal_p;
use crate::testing::{FeatureOutcome, TestResult};
use std::cmp::Ordering;

/// Rank sum of group 1 within the pooled sample plus the tie term `sum(t^3 - t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankSums {
    pub rank_sum_1: f64,
    pub tie_term: f64,
    pub n1: usize,
    pub n2: usize,
}

impl RankSums {
    /// Mann-Whitney U of group 1.
    pub fn u_statistic(&self) -> f64 {
        let n1 = self.n1 as f64;
        self.rank_sum_1 - n1 * (n1 + 1.0) / 2.0
    }

    /// Probability that a group 1 value exceeds a group 2 value (ties count half).
    pub fn auc(&self) -> f64 {
        let denom = (self.n1 * self.n2) as f64;
        if denom == 0.0 {
            return f64::NAN;
        }
        self.u_statistic() / denom
    }

    /// Two-sided normal approximation with tie and continuity correction.
    pub fn test(&self) -> TestResult {
        let n1 = self.n1 as f64;
        let n2 = self.n2 as f64;
        let n = n1 + n2;
        if self.n1 == 0 || self.n2 == 0 {
            return TestResult::new(f64::NAN, 1.0);
        }

        let u = self.u_statistic();
        let centered = u - n1 * n2 / 2.0;
        let variance = n1 * n2 / 12.0 * ((n + 1.0) - self.tie_term / (n * (n - 1.0)));
        if variance <= 0.0 {
            // Every value tied
            return TestResult::new(u, 1.0).with_effect_size(self.auc());
        }

        let correction = if centered == 0.0 { 0.0 } else { 0.5 * centered.signum() };
        let z = (centered - correction) / variance.sqrt();

        TestResult::new(u, two_sided_normal_p(z))
            .with_effect_size(self.auc())
            .with_standard_error(variance.sqrt())
    }
}

/// Walk sorted `(value, is_group1)` pairs, assigning average ranks to ties.
/// `zero_block` is inserted before the first positive value.
fn accumulate_ranks(sorted: &[(f64, bool)], zero_block: (usize, usize)) -> (f64, f64) {
    let (zeros_1, zeros_2) = zero_block;
    let zeros = zeros_1 + zeros_2;
    let mut placed = 0usize;
    let mut rank_sum_1 = 0.0;
    let mut tie_term = 0.0;
    let mut zeros_placed = zeros == 0;

    let place_zeros = |placed: &mut usize, rank_sum_1: &mut f64, tie_term: &mut f64| {
        let t = zeros as f64;
        let avg = *placed as f64 + (t + 1.0) / 2.0;
        *rank_sum_1 += zeros_1 as f64 * avg;
        *tie_term += t * t * t - t;
        *placed += zeros;
    };

    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i].0;
        if !zeros_placed && value > 0.0 {
            place_zeros(&mut placed, &mut rank_sum_1, &mut tie_term);
            zeros_placed = true;
        }

        let mut j = i + 1;
        while j < sorted.len() && sorted[j].0 == value {
            j += 1;
        }

        let t = (j - i) as f64;
        let avg = placed as f64 + (t + 1.0) / 2.0;
        let in_group1 = sorted[i..j].iter().filter(|(_, g1)| *g1).count();
        rank_sum_1 += in_group1 as f64 * avg;
        tie_term += t * t * t - t;
        placed += j - i;
        i = j;
    }

    if !zeros_placed {
        place_zeros(&mut placed, &mut rank_sum_1, &mut tie_term);
    }

    (rank_sum_1, tie_term)
}

fn sort_values(values: &mut [(f64, bool)]) {
    values.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
}

/// Rank sums from a dense sort of both groups.
pub fn rank_sums_dense(x: &[f64], y: &[f64]) -> RankSums {
    let mut combined: Vec<(f64, bool)> = Vec::with_capacity(x.len() + y.len());
    combined.extend(x.iter().map(|&v| (v, true)));
    combined.extend(y.iter().map(|&v| (v, false)));
    sort_values(&mut combined);

    let (rank_sum_1, tie_term) = accumulate_ranks(&combined, (0, 0));
    RankSums {
        rank_sum_1,
        tie_term,
        n1: x.len(),
        n2: y.len(),
    }
}

/// Rank sums from the stored entries of a sparse row.
///
/// `entries` are `(position, value)` pairs where positions `< n1` belong to
/// group 1. Every position not listed (and every stored zero) is a zero; all
/// zeros share one tie block, so only the non-zero values are sorted.
pub fn rank_sums_sparse(entries: &[(usize, f64)], n1: usize, n2: usize) -> RankSums {
    let mut nonzero: Vec<(f64, bool)> = entries
        .iter()
        .filter(|(_, v)| *v != 0.0)
        .map(|&(pos, v)| (v, pos < n1))
        .collect();
    let nonzero_1 = nonzero.iter().filter(|(_, g1)| *g1).count();
    let nonzero_2 = nonzero.len() - nonzero_1;
    sort_values(&mut nonzero);

    let (rank_sum_1, tie_term) = accumulate_ranks(&nonzero, (n1 - nonzero_1, n2 - nonzero_2));
    RankSums {
        rank_sum_1,
        tie_term,
        n1,
        n2,
    }
}

/// Wilcoxon rank-sum test comparing two dense samples.
///
/// Always uses the normal approximation, also for small samples without
/// ties where R's `wilcox.test` would switch to the exact distribution, so
/// that the dense and the sparse rank-sum tests give identical p-values.
pub fn mann_whitney(x: &[f64], y: &[f64]) -> TestResult {
    rank_sums_dense(x, y).test()
}

/// AUC outcome with undefined values reported as 0.
pub fn auc_outcome(sums: &RankSums) -> FeatureOutcome {
    let auc = sums.auc();
    let auc = if auc.is_finite() { round_digits(auc, 3) } else { 0.0 };
    FeatureOutcome::Auc {
        auc,
        power: (auc - 0.5).abs() * 2.0,
    }
}
