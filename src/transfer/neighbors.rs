//! Euclidean nearest neighbours over row embeddings.
//!
//! Up to [`EXACT_LIMIT`] indexed rows the search is an exact scan; larger
//! inputs go through an HNSW graph and only the returned candidates are
//! re-measured in full precision.

use instant_distance::{Builder, HnswMap, Search};
use ndarray::{Array2, ArrayView1};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Largest number of indexed rows searched exhaustively.
pub(crate) const EXACT_LIMIT: usize = 4096;

const GRAPH_SEED: u64 = 42;
const MIN_EF_SEARCH: usize = 100;

pub(crate) fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[derive(Clone, Debug)]
struct RowPoint {
    data: Vec<f32>,
}

impl instant_distance::Point for RowPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

fn to_point(row: ArrayView1<f64>) -> RowPoint {
    RowPoint {
        data: row.iter().map(|&v| v as f32).collect(),
    }
}

fn by_distance(pairs: &mut [(usize, f64)]) {
    pairs.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

/// The `k` rows of `data` closest to `point`, nearest first. Ties keep the
/// lower row index first.
pub(crate) fn nearest(
    point: ArrayView1<f64>,
    data: &Array2<f64>,
    k: usize,
    exclude: Option<usize>,
) -> Vec<(usize, f64)> {
    let mut dists: Vec<(usize, f64)> = data
        .rows()
        .into_iter()
        .enumerate()
        .filter(|&(j, _)| Some(j) != exclude)
        .map(|(j, row)| (j, euclidean(point, row)))
        .collect();
    by_distance(&mut dists);
    dists.truncate(k);
    dists
}

/// Search structure over the rows of one matrix.
pub(crate) struct NeighborIndex<'a> {
    data: &'a Array2<f64>,
    graph: Option<HnswMap<RowPoint, usize>>,
}

impl<'a> NeighborIndex<'a> {
    /// Exact scan for small inputs, HNSW graph otherwise. `k` is the largest
    /// neighbour count that will be asked for.
    pub(crate) fn new(data: &'a Array2<f64>, k: usize) -> Self {
        if data.nrows() <= EXACT_LIMIT {
            NeighborIndex { data, graph: None }
        } else {
            Self::approximate(data, k)
        }
    }

    pub(crate) fn approximate(data: &'a Array2<f64>, k: usize) -> Self {
        let points: Vec<RowPoint> = data.rows().into_iter().map(to_point).collect();
        let values: Vec<usize> = (0..data.nrows()).collect();
        let graph = Builder::default()
            .ef_search((k + 1).max(MIN_EF_SEARCH))
            .seed(GRAPH_SEED)
            .build(points, values);
        NeighborIndex {
            data,
            graph: Some(graph),
        }
    }

    pub(crate) fn query(
        &self,
        point: ArrayView1<f64>,
        k: usize,
        exclude: Option<usize>,
    ) -> Vec<(usize, f64)> {
        let Some(graph) = &self.graph else {
            return nearest(point, self.data, k, exclude);
        };
        let target = to_point(point);
        let mut search = Search::default();
        let mut found: Vec<(usize, f64)> = graph
            .search(&target, &mut search)
            .map(|item| *item.value)
            .filter(|&j| Some(j) != exclude)
            .take(k + 1)
            .map(|j| (j, euclidean(point, self.data.row(j))))
            .collect();
        by_distance(&mut found);
        found.truncate(k);
        found
    }
}

/// Neighbours in `data` of every row of `queries`.
pub(crate) fn knn(queries: &Array2<f64>, data: &Array2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let index = NeighborIndex::new(data, k);
    (0..queries.nrows())
        .into_par_iter()
        .map(|i| index.query(queries.row(i), k, None))
        .collect()
}

/// Neighbours of every row within the same matrix, excluding the row itself.
pub(crate) fn knn_self(data: &Array2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let index = NeighborIndex::new(data, k + 1);
    (0..data.nrows())
        .into_par_iter()
        .map(|i| index.query(data.row(i), k, Some(i)))
        .collect()
}
