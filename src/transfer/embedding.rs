//! Joint low-dimensional embedding: PCA followed by a seeded 2-D UMAP.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use log::debug;
use nalgebra::DMatrix;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transfer::neighbors::knn_self;
use crate::transfer::svd::randomized_svd;

/// Principal component scores (cells x dims) of a features x cells matrix,
/// from a truncated decomposition of the centered cells x features matrix.
pub fn pca(values: &Array2<f64>, dims: usize) -> Result<Array2<f64>> {
    let (n_features, n_cells) = values.dim();
    let dims = dims.min(n_features).min(n_cells);
    if dims == 0 {
        return Err(anyhow!("PCA needs at least one feature and one cell"));
    }
    let means = values
        .mean_axis(Axis(1))
        .ok_or_else(|| anyhow!("PCA over an empty matrix"))?;
    let centered = DMatrix::from_fn(n_cells, n_features, |c, f| values[[f, c]] - means[f]);

    let svd = randomized_svd(&centered, dims)?;
    Ok(Array2::from_shape_fn((n_cells, dims), |(c, d)| {
        svd.u[(c, d)] * svd.singular_values[d]
    }))
}

#[derive(Debug, Clone)]
pub struct UmapConfig {
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub n_epochs: usize,
    pub learning_rate: f64,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl Default for UmapConfig {
    fn default() -> Self {
        UmapConfig {
            n_neighbors: 30,
            min_dist: 0.3,
            spread: 1.0,
            n_epochs: 200,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: 42,
        }
    }
}

struct Edge {
    i: usize,
    j: usize,
    weight: f64,
}

/// Per-cell bandwidth so that the neighbour memberships sum to `log2(k)`.
fn smooth_distances(neighbours: &[Vec<(usize, f64)>]) -> Vec<(f64, f64)> {
    neighbours
        .iter()
        .map(|nn| {
            let rho = nn.first().map_or(0.0, |&(_, d)| d);
            let target = (nn.len().max(2) as f64).log2();
            let (mut lo, mut hi, mut sigma) = (0.0, f64::INFINITY, 1.0);
            for _ in 0..64 {
                let total: f64 = nn.iter().map(|&(_, d)| (-(d - rho).max(0.0) / sigma).exp()).sum();
                if (total - target).abs() < 1e-5 {
                    break;
                }
                if total > target {
                    hi = sigma;
                    sigma = (lo + hi) / 2.0;
                } else {
                    lo = sigma;
                    sigma = if hi.is_infinite() { sigma * 2.0 } else { (lo + hi) / 2.0 };
                }
            }
            (rho, sigma.max(1e-3))
        })
        .collect()
}

/// Symmetrized fuzzy neighbour graph, `w_ij + w_ji - w_ij * w_ji`.
fn fuzzy_graph(neighbours: &[Vec<(usize, f64)>]) -> Vec<Edge> {
    let bandwidths = smooth_distances(neighbours);
    let mut pairs: BTreeMap<(usize, usize), (f64, f64)> = BTreeMap::new();
    for (i, nn) in neighbours.iter().enumerate() {
        let (rho, sigma) = bandwidths[i];
        for &(j, d) in nn {
            let w = (-(d - rho).max(0.0) / sigma).exp();
            if i < j {
                pairs.entry((i, j)).or_insert((0.0, 0.0)).0 = w;
            } else {
                pairs.entry((j, i)).or_insert((0.0, 0.0)).1 = w;
            }
        }
    }
    pairs
        .into_iter()
        .map(|((i, j), (a, b))| Edge { i, j, weight: a + b - a * b })
        .filter(|e| e.weight > 0.0)
        .collect()
}

/// Fit `1 / (1 + a d^(2b))` to the target membership curve by Gauss-Newton.
fn fit_curve(min_dist: f64, spread: f64) -> (f64, f64) {
    let n_points = 300;
    let max_d = 3.0 * spread;
    let (mut a, mut b) = (1.0f64, 1.0f64);
    for _ in 0..100 {
        let (mut jj00, mut jj01, mut jj11, mut jr0, mut jr1) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for k in 0..n_points {
            let d = (k as f64 + 0.5) * max_d / n_points as f64;
            let target = if d <= min_dist { 1.0 } else { (-(d - min_dist) / spread).exp() };
            let d2b = d.powf(2.0 * b);
            let denom = 1.0 + a * d2b;
            let residual = 1.0 / denom - target;
            let da = -d2b / (denom * denom);
            let db = -a * d2b * 2.0 * d.ln() / (denom * denom);
            jj00 += da * da;
            jj01 += da * db;
            jj11 += db * db;
            jr0 += da * residual;
            jr1 += db * residual;
        }
        let det = jj00 * jj11 - jj01 * jj01;
        if det.abs() < 1e-20 {
            break;
        }
        let step_a = -(jj11 * jr0 - jj01 * jr1) / det;
        let step_b = -(jj00 * jr1 - jj01 * jr0) / det;
        a = (a + step_a).max(1e-3);
        b = (b + step_b).max(1e-3);
        if step_a.abs() < 1e-8 && step_b.abs() < 1e-8 {
            break;
        }
    }
    (a, b)
}

/// Two-dimensional UMAP of the rows of `data`. Identical input and seed give
/// identical coordinates.
pub fn umap(data: &Array2<f64>, config: &UmapConfig) -> Result<Array2<f64>> {
    let n = data.nrows();
    if n < 2 {
        return Err(anyhow!("UMAP needs at least two cells, got {}", n));
    }
    let k = config.n_neighbors.clamp(1, n - 1);
    let edges = fuzzy_graph(&knn_self(data, k));
    let (a, b) = fit_curve(config.min_dist, config.spread);
    debug!("UMAP over {} cells, {} edges, a = {:.4}, b = {:.4}", n, edges.len(), a, b);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut embedding = Array2::from_shape_fn((n, 2), |_| rng.random_range(-10.0..10.0));

    let max_weight = edges.iter().map(|e| e.weight).fold(0.0, f64::max);
    if max_weight <= 0.0 || config.n_epochs == 0 {
        return Ok(embedding);
    }
    let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
    let mut next_sample = epochs_per_sample.clone();
    let clip = 4.0;

    for epoch in 0..config.n_epochs {
        let alpha = config.learning_rate * (1.0 - epoch as f64 / config.n_epochs as f64);
        for (e, edge) in edges.iter().enumerate() {
            if next_sample[e] > epoch as f64 {
                continue;
            }
            let (i, j) = (edge.i, edge.j);

            let diff = [
                embedding[[i, 0]] - embedding[[j, 0]],
                embedding[[i, 1]] - embedding[[j, 1]],
            ];
            let dist_sq = (diff[0] * diff[0] + diff[1] * diff[1]).max(1e-10);
            let attract = -2.0 * a * b * dist_sq.powf(b - 1.0) / (1.0 + a * dist_sq.powf(b));
            for d in 0..2 {
                let grad = (attract * diff[d]).clamp(-clip, clip);
                embedding[[i, d]] += alpha * grad;
                embedding[[j, d]] -= alpha * grad;
            }

            for _ in 0..config.negative_sample_rate {
                let other = rng.random_range(0..n);
                if other == i {
                    continue;
                }
                let diff = [
                    embedding[[i, 0]] - embedding[[other, 0]],
                    embedding[[i, 1]] - embedding[[other, 1]],
                ];
                let dist_sq = (diff[0] * diff[0] + diff[1] * diff[1]).max(1e-10);
                let repel = 2.0 * b / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)));
                for d in 0..2 {
                    embedding[[i, d]] += alpha * (repel * diff[d]).clamp(-clip, clip);
                }
            }
            next_sample[e] += epochs_per_sample[e];
        }
    }
    Ok(embedding)
}
