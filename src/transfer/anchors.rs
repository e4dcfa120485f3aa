//! Transfer anchors: mutual nearest neighbours between reference and query
//! cells in a shared canonical-correlation space.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::{Array2, Axis};

use crate::error::MarkerError;
use crate::matrix::FeatureMatrix;
use crate::transfer::neighbors::knn;
use crate::transfer::normalize::scale_rows;
use crate::transfer::svd::{CrossProduct, randomized_svd};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    /// Reference cell index.
    pub reference: usize,
    /// Query cell index.
    pub query: usize,
    /// Neighbourhood agreement rescaled to [0, 1].
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct AnchorSet {
    pub features: Vec<String>,
    pub anchors: Vec<Anchor>,
    /// L2-normalized canonical coordinates, query cells x dims.
    pub query_embedding: Array2<f64>,
}

/// Reference variable features that also appear in the activity matrix, in
/// the order given.
pub fn shared_features(
    variable_features: &[String],
    reference: &FeatureMatrix<f64>,
    activity: &FeatureMatrix<f64>,
) -> Result<Vec<String>> {
    let shared: Vec<String> = variable_features
        .iter()
        .filter(|f| {
            reference.feature_position(f).is_some() && activity.feature_position(f).is_some()
        })
        .cloned()
        .collect();
    if shared.is_empty() {
        return Err(MarkerError::NoSharedFeatures.into());
    }
    Ok(shared)
}

/// Dense features x cells values of the named rows.
pub(crate) fn dense_rows(matrix: &FeatureMatrix<f64>, features: &[String]) -> Result<Array2<f64>> {
    let rows = features
        .iter()
        .map(|f| {
            matrix
                .feature_position(f)
                .ok_or_else(|| anyhow!("feature '{}' is missing from the matrix", f))
        })
        .collect::<Result<Vec<usize>>>()?;
    Ok(matrix.select_features(&rows)?.to_dense())
}

pub(crate) fn l2_normalize_rows(values: &mut Array2<f64>) {
    for mut row in values.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

fn to_dmatrix(values: &Array2<f64>) -> DMatrix<f64> {
    let (nr, nc) = values.dim();
    DMatrix::from_fn(nr, nc, |i, j| values[[i, j]])
}

/// Canonical correlation vectors of two scaled features x cells matrices.
///
/// Returns the leading `dims` left and right singular vectors of
/// `reference^T * query`, as reference cells x dims and query cells x dims.
/// The cells x cells product is never formed.
pub fn canonical_correlation(
    reference: &Array2<f64>,
    query: &Array2<f64>,
    dims: usize,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (n_ref, n_query) = (reference.ncols(), query.ncols());
    let dims = dims.min(n_ref).min(n_query);
    if dims == 0 {
        return Err(anyhow!(
            "canonical correlation needs at least one cell on each side"
        ));
    }
    if reference.nrows() != query.nrows() {
        return Err(anyhow!(
            "reference has {} features, query has {}",
            reference.nrows(),
            query.nrows()
        ));
    }

    let left = to_dmatrix(reference);
    let right = to_dmatrix(query);
    let svd = randomized_svd(
        &CrossProduct {
            left: &left,
            right: &right,
        },
        dims,
    )?;
    let dims = svd.singular_values.len();

    let ref_embedding = Array2::from_shape_fn((n_ref, dims), |(i, d)| svd.u[(i, d)]);
    let query_embedding = Array2::from_shape_fn((n_query, dims), |(j, d)| svd.v[(j, d)]);
    Ok((ref_embedding, query_embedding))
}

/// Value at probability `p` of sorted `values`, linear interpolation.
pub(crate) fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

fn neighbourhood(
    own: &[(usize, f64)],
    other: &[(usize, f64)],
    own_offset: usize,
    other_offset: usize,
) -> HashSet<usize> {
    own.iter()
        .map(|&(i, _)| i + own_offset)
        .chain(other.iter().map(|&(j, _)| j + other_offset))
        .collect()
}

/// Mutual nearest neighbour pairs between the two embeddings, scored by the
/// overlap of their joint `k_score` neighbourhoods.
///
/// Raw overlaps are rescaled between their 0.01 and 0.90 quantiles and
/// clamped to [0, 1]; when both quantiles coincide every anchor scores 1.
pub fn find_anchors(
    reference: &Array2<f64>,
    query: &Array2<f64>,
    k_anchor: usize,
    k_score: usize,
) -> Vec<Anchor> {
    let (n_ref, n_query) = (reference.nrows(), query.nrows());
    let k = k_anchor.min(n_ref).min(n_query);
    if k == 0 {
        return Vec::new();
    }
    let ref_to_query = knn(reference, query, k);
    let query_to_ref = knn(query, reference, k);

    let mut pairs = Vec::new();
    for (r, neighbours) in ref_to_query.iter().enumerate() {
        for &(q, _) in neighbours {
            if query_to_ref[q].iter().any(|&(back, _)| back == r) {
                pairs.push((r, q));
            }
        }
    }
    if pairs.is_empty() {
        return Vec::new();
    }

    let ks_ref = k_score.min(n_ref);
    let ks_query = k_score.min(n_query);
    let ref_ref = knn(reference, reference, ks_ref);
    let ref_query = knn(reference, query, ks_query);
    let query_query = knn(query, query, ks_query);
    let query_ref = knn(query, reference, ks_ref);

    // Reference cells occupy ids 0..n_ref, query cells follow.
    let raw: Vec<f64> = pairs
        .iter()
        .map(|&(r, q)| {
            let around_ref = neighbourhood(&ref_ref[r], &ref_query[r], 0, n_ref);
            let around_query = neighbourhood(&query_query[q], &query_ref[q], n_ref, 0);
            around_ref.intersection(&around_query).count() as f64
        })
        .collect();

    let mut sorted = raw.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let lo = quantile(&sorted, 0.01);
    let hi = quantile(&sorted, 0.90);
    debug!("Anchor overlap quantiles: {:.3} (1%) {:.3} (90%)", lo, hi);

    pairs
        .into_iter()
        .zip(raw)
        .map(|((reference, query), overlap)| {
            let score = if hi > lo {
                ((overlap - lo) / (hi - lo)).clamp(0.0, 1.0)
            } else {
                1.0
            };
            Anchor { reference, query, score }
        })
        .collect()
}

/// Scale both sides over the shared features, project them into `dims`
/// canonical dimensions and collect scored anchors.
pub fn find_transfer_anchors(
    reference: &FeatureMatrix<f64>,
    variable_features: &[String],
    activity: &FeatureMatrix<f64>,
    dims: usize,
    k_anchor: usize,
    k_score: usize,
    clip: f64,
) -> Result<AnchorSet> {
    let features = shared_features(variable_features, reference, activity)?;
    info!("Finding anchors over {} shared features", features.len());

    let ref_scaled = scale_rows(&dense_rows(reference, &features)?, clip);
    let query_scaled = scale_rows(&dense_rows(activity, &features)?, clip);
    let (mut reference_embedding, mut query_embedding) =
        canonical_correlation(&ref_scaled, &query_scaled, dims)?;
    l2_normalize_rows(&mut reference_embedding);
    l2_normalize_rows(&mut query_embedding);

    let anchors = find_anchors(&reference_embedding, &query_embedding, k_anchor, k_score);
    if anchors.is_empty() {
        return Err(MarkerError::NoAnchors.into());
    }
    info!("Found {} anchors", anchors.len());

    Ok(AnchorSet {
        features,
        anchors,
        query_embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn circle(n: usize, jitter: f64) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, d)| {
            let angle = i as f64 * std::f64::consts::TAU / n as f64 + jitter;
            if d == 0 { angle.cos() } else { angle.sin() }
        })
    }

    #[test]
    fn test_quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 0.5), 3.0);
        assert_relative_eq!(quantile(&v, 0.9), 4.6, epsilon = 1e-12);
    }

    #[test]
    fn test_matching_cells_become_anchors() {
        let reference = circle(12, 0.0);
        let query = circle(12, 0.01);
        let anchors = find_anchors(&reference, &query, 1, 3);
        assert_eq!(anchors.len(), 12);
        assert!(anchors.iter().all(|a| a.reference == a.query));
        assert!(anchors.iter().all(|a| (0.0..=1.0).contains(&a.score)));
    }

    #[test]
    fn test_identical_sides_share_canonical_space() {
        let x = array![
            [1.0, -2.0, 0.5, 3.0],
            [0.0, 1.0, -1.0, 2.0],
            [2.0, 0.5, 1.5, -1.0]
        ];
        let (a, b) = canonical_correlation(&x, &x, 2).unwrap();
        assert_eq!(a.dim(), (4, 2));
        for (u, v) in a.iter().zip(b.iter()) {
            assert_relative_eq!(*u, *v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_canonical_vectors_match_full_decomposition() {
        let reference =
            Array2::from_shape_fn((5, 30), |(f, c)| ((f * 7 + c * 3) % 11) as f64 - 5.0);
        let query = Array2::from_shape_fn((5, 20), |(f, c)| ((f * 5 + c * 2) % 13) as f64 - 6.0);
        let (a, b) = canonical_correlation(&reference, &query, 2).unwrap();
        assert_eq!(a.dim(), (30, 2));
        assert_eq!(b.dim(), (20, 2));

        let cross = reference.t().dot(&query);
        let full = DMatrix::from_fn(30, 20, |i, j| cross[[i, j]]);
        let mut values: Vec<f64> = full.singular_values().iter().copied().collect();
        values.sort_by(|x, y| y.total_cmp(x));
        for d in 0..2 {
            // cross * v_d = s_d * u_d
            let projected = cross.dot(&b.column(d));
            for i in 0..30 {
                assert_relative_eq!(projected[i], values[d] * a[[i, d]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_no_shared_features() {
        let reference =
            FeatureMatrix::from_dense_rows(&[vec![1.0]], vec!["CD3E".into()], vec!["r0".into()])
                .unwrap();
        let activity =
            FeatureMatrix::from_dense_rows(&[vec![1.0]], vec!["MS4A1".into()], vec!["q0".into()])
                .unwrap();
        let err = shared_features(&["CD3E".to_string()], &reference, &activity).unwrap_err();
        assert_eq!(err.downcast_ref::<MarkerError>(), Some(&MarkerError::NoSharedFeatures));
    }
}
