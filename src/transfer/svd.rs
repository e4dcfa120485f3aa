//! Randomized truncated SVD (Halko et al. 2009, Alg 4.4) over matrices that
//! are only touched through products, so that `reference^T * query` never
//! has to be formed.

use anyhow::{Result, anyhow};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const OVERSAMPLE: usize = 5;
const POWER_ITERATIONS: usize = 5;
const SKETCH_SEED: u64 = 42;

/// A matrix known by its products with dense blocks.
pub(crate) trait LinearMap {
    fn shape(&self) -> (usize, usize);

    /// `A * x`
    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64>;

    /// `A^T * x`
    fn apply_transpose(&self, x: &DMatrix<f64>) -> DMatrix<f64>;
}

impl LinearMap for DMatrix<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self * x
    }

    fn apply_transpose(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.tr_mul(x)
    }
}

/// `left^T * right` for two matrices sharing their row space.
pub(crate) struct CrossProduct<'a> {
    pub left: &'a DMatrix<f64>,
    pub right: &'a DMatrix<f64>,
}

impl LinearMap for CrossProduct<'_> {
    fn shape(&self) -> (usize, usize) {
        (self.left.ncols(), self.right.ncols())
    }

    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.left.tr_mul(&(self.right * x))
    }

    fn apply_transpose(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.right.tr_mul(&(self.left * x))
    }
}

/// Leading singular triplets, largest first.
pub(crate) struct TruncatedSvd {
    /// rows x rank
    pub u: DMatrix<f64>,
    pub singular_values: DVector<f64>,
    /// cols x rank
    pub v: DMatrix<f64>,
}

fn orthonormal_basis(block: DMatrix<f64>) -> DMatrix<f64> {
    block.qr().q()
}

/// The leading `rank` singular triplets of `matrix`. Exact whenever
/// `rank` plus the oversampling covers the smaller dimension.
pub(crate) fn randomized_svd<M: LinearMap>(matrix: &M, rank: usize) -> Result<TruncatedSvd> {
    let (nr, nc) = matrix.shape();
    let rank = rank.min(nr).min(nc);
    if rank == 0 {
        return Err(anyhow!("SVD of a {} x {} matrix", nr, nc));
    }
    let width = (rank + OVERSAMPLE).min(nr).min(nc);

    let mut rng = StdRng::seed_from_u64(SKETCH_SEED);
    let sketch = DMatrix::from_fn(nc, width, |_, _| rng.random_range(-1.0..1.0));
    let mut qq = orthonormal_basis(matrix.apply(&sketch));
    for _ in 0..POWER_ITERATIONS {
        let back = orthonormal_basis(matrix.apply_transpose(&qq));
        qq = orthonormal_basis(matrix.apply(&back));
    }

    // B = Q^T A, small enough for a dense SVD
    let bb = matrix.apply_transpose(&qq).transpose();
    let svd = bb.svd(true, true);
    let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) else {
        return Err(anyhow!("SVD did not return singular vectors"));
    };

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    order.truncate(rank);

    let small_u = DMatrix::from_fn(svd_u.nrows(), rank, |i, d| svd_u[(i, order[d])]);
    Ok(TruncatedSvd {
        u: qq * small_u,
        singular_values: DVector::from_fn(rank, |d, _| svd.singular_values[order[d]]),
        v: DMatrix::from_fn(nc, rank, |j, d| svd_vt[(order[d], j)]),
    })
}
