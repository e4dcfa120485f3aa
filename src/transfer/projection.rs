//! Anchor-weighted label and expression transfer onto query cells.

use ndarray::Array2;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::testing::utils::extract_unique_labels;
use crate::transfer::anchors::Anchor;
use crate::transfer::neighbors::NeighborIndex;

/// Normalized weights of the nearest anchors of every query cell, as
/// `(anchor index, weight)` pairs summing to one.
#[derive(Debug, Clone)]
pub struct TransferWeights {
    pub neighbours: Vec<Vec<(usize, f64)>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub predicted_id: String,
    /// Highest label score, in [0, 1].
    pub score: f64,
}

fn kernel(weight: f64, sd_weight: f64) -> f64 {
    let bandwidth = 2.0 / sd_weight;
    1.0 - (-weight / (bandwidth * bandwidth)).exp()
}

/// Weights each query cell puts on its `k_weight` nearest anchors, measured
/// against the query cell of each anchor.
///
/// The raw weight `(1 - d / d_k) * score` goes through a Gaussian kernel of
/// width `sd_weight` and is normalized per cell; a cell whose weights all
/// vanish spreads them evenly.
pub fn anchor_weights(
    query: &Array2<f64>,
    anchors: &[Anchor],
    k_weight: usize,
    sd_weight: f64,
) -> TransferWeights {
    let anchor_points = Array2::from_shape_fn((anchors.len(), query.ncols()), |(a, d)| {
        query[[anchors[a].query, d]]
    });
    let k = k_weight.min(anchors.len());
    let index = NeighborIndex::new(&anchor_points, k);

    let neighbours = (0..query.nrows())
        .into_par_iter()
        .map(|q| {
            let nn = index.query(query.row(q), k, None);
            let d_k = nn.last().map_or(0.0, |&(_, d)| d);
            let mut weighted: Vec<(usize, f64)> = nn
                .iter()
                .map(|&(a, d)| {
                    let closeness = if d_k > 0.0 { 1.0 - d / d_k } else { 1.0 };
                    (a, kernel(closeness * anchors[a].score, sd_weight))
                })
                .collect();
            let total: f64 = weighted.iter().map(|p| p.1).sum();
            if total > 0.0 {
                weighted.iter_mut().for_each(|p| p.1 /= total);
            } else if !weighted.is_empty() {
                let even = 1.0 / weighted.len() as f64;
                weighted.iter_mut().for_each(|p| p.1 = even);
            }
            weighted
        })
        .collect();
    TransferWeights { neighbours }
}

/// Per-label scores (query cells x sorted labels) and the best label per cell.
///
/// Ties go to the label that sorts first.
pub fn transfer_labels<S: AsRef<str>>(
    weights: &TransferWeights,
    anchors: &[Anchor],
    reference_labels: &[S],
) -> (Vec<String>, Array2<f64>, Vec<Prediction>) {
    let labels = extract_unique_labels(reference_labels);
    let mut scores = Array2::zeros((weights.neighbours.len(), labels.len()));
    for (q, neighbours) in weights.neighbours.iter().enumerate() {
        for &(a, w) in neighbours {
            let label = reference_labels[anchors[a].reference].as_ref();
            if let Ok(l) = labels.binary_search_by(|probe| probe.as_str().cmp(label)) {
                scores[[q, l]] += w;
            }
        }
    }

    let predictions = scores
        .rows()
        .into_iter()
        .map(|row| {
            let (best, score) = row
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (l, &s)| if s > acc.1 { (l, s) } else { acc });
            Prediction {
                predicted_id: labels.get(best).cloned().unwrap_or_default(),
                score: score.max(0.0),
            }
        })
        .collect();
    (labels, scores, predictions)
}

/// Query profiles as the anchor-weighted average of the anchored reference
/// cells. `reference` is features x reference cells; the result is features x
/// query cells.
pub fn impute(
    weights: &TransferWeights,
    anchors: &[Anchor],
    reference: &Array2<f64>,
) -> Array2<f64> {
    let mut imputed = Array2::zeros((reference.nrows(), weights.neighbours.len()));
    for (q, neighbours) in weights.neighbours.iter().enumerate() {
        for &(a, w) in neighbours {
            let source = reference.column(anchors[a].reference);
            imputed.column_mut(q).scaled_add(w, &source);
        }
    }
    imputed
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn anchors() -> Vec<Anchor> {
        vec![
            Anchor { reference: 0, query: 0, score: 1.0 },
            Anchor { reference: 1, query: 1, score: 1.0 },
            Anchor { reference: 2, query: 2, score: 0.5 },
        ]
    }

    fn query() -> Array2<f64> {
        array![[0.0, 0.0], [1.0, 0.0], [5.0, 0.0], [0.1, 0.0]]
    }

    #[test]
    fn test_weights_are_normalized_and_local() {
        let w = anchor_weights(&query(), &anchors(), 3, 1.0);
        for cell in &w.neighbours {
            assert_relative_eq!(cell.iter().map(|p| p.1).sum::<f64>(), 1.0, epsilon = 1e-12);
        }
        // The farthest of the k anchors gets zero weight.
        let cell3 = &w.neighbours[3];
        assert_eq!(cell3[0].0, 0);
        assert_eq!(cell3.last().unwrap().1, 0.0);
    }

    #[test]
    fn test_single_anchor_spreads_evenly() {
        let w = anchor_weights(&query(), &anchors(), 1, 1.0);
        assert!(w.neighbours.iter().all(|c| c.len() == 1 && c[0].1 == 1.0));
    }

    #[test]
    fn test_labels_and_imputation() {
        let weights = TransferWeights {
            neighbours: vec![vec![(0, 0.75), (1, 0.25)], vec![(2, 1.0)]],
        };
        let labels = ["T", "B", "T"];
        let (names, scores, predictions) = transfer_labels(&weights, &anchors(), &labels);
        assert_eq!(names, vec!["B".to_string(), "T".to_string()]);
        assert_eq!(scores[[0, 1]], 0.75);
        assert_eq!(predictions[0].predicted_id, "T");
        assert_eq!(predictions[0].score, 0.75);
        assert_eq!(predictions[1].predicted_id, "T");

        let reference = array![[1.0, 3.0, 10.0], [0.0, 4.0, 0.0]];
        let imputed = impute(&weights, &anchors(), &reference);
        assert_relative_eq!(imputed[[0, 0]], 1.5, epsilon = 1e-12);
        assert_relative_eq!(imputed[[1, 0]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(imputed[[0, 1]], 10.0, epsilon = 1e-12);
    }
}
