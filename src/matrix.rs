//! Labelled feature-by-cell matrices, two-group cell partitions and covariate tables.

use std::collections::{BTreeSet, HashMap};

use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::error::MarkerError;

/// Which representation of expression the matrix holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataLayer {
    /// Raw counts.
    Counts,
    /// log1p-normalized expression.
    #[default]
    Data,
    /// Centered and scaled values.
    ScaleData,
}

/// Sparse matrix with rows = features, columns = cells, and unique names on both axes.
#[derive(Debug, Clone)]
pub struct FeatureMatrix<T> {
    matrix: CsrMatrix<T>,
    feature_names: Vec<String>,
    cell_names: Vec<String>,
    feature_index: HashMap<String, usize>,
    cell_index: HashMap<String, usize>,
}

fn build_index(names: &[String], axis: &str) -> anyhow::Result<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if index.insert(name.clone(), i).is_some() {
            let message = format!("duplicate {} name '{}'", axis, name);
            return Err(MarkerError::InvalidMatrix(message).into());
        }
    }
    Ok(index)
}

impl<T> FeatureMatrix<T>
where
    T: FloatOpsTS,
{
    pub fn new(
        matrix: CsrMatrix<T>,
        feature_names: Vec<String>,
        cell_names: Vec<String>,
    ) -> anyhow::Result<Self> {
        if matrix.nrows() != feature_names.len() {
            return Err(MarkerError::InvalidMatrix(format!(
                "{} rows but {} feature names",
                matrix.nrows(),
                feature_names.len()
            ))
            .into());
        }
        if matrix.ncols() != cell_names.len() {
            return Err(MarkerError::InvalidMatrix(format!(
                "{} columns but {} cell names",
                matrix.ncols(),
                cell_names.len()
            ))
            .into());
        }
        let feature_index = build_index(&feature_names, "feature")?;
        let cell_index = build_index(&cell_names, "cell")?;
        Ok(FeatureMatrix {
            matrix,
            feature_names,
            cell_names,
            feature_index,
            cell_index,
        })
    }

    pub fn matrix(&self) -> &CsrMatrix<T> {
        &self.matrix
    }

    pub fn n_features(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_cells(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn cell_names(&self) -> &[String] {
        &self.cell_names
    }

    pub fn feature_position(&self, name: &str) -> Option<usize> {
        self.feature_index.get(name).copied()
    }

    pub fn cell_position(&self, name: &str) -> Option<usize> {
        self.cell_index.get(name).copied()
    }

    /// Dense values of one feature over a column selection, in selection order.
    pub fn row_values(&self, row: usize, lookup: &ColumnLookup) -> Vec<f64> {
        let mut values = vec![0.0; lookup.len()];
        let row_view = self.matrix.row(row);
        for (&col, value) in row_view.col_indices().iter().zip(row_view.values()) {
            if let Some(pos) = lookup.position(col) {
                values[pos] = value.to_f64().unwrap_or(0.0);
            }
        }
        values
    }

    /// Explicitly stored entries of one feature restricted to a selection,
    /// as `(selection position, value)` pairs. Implicit zeros are skipped.
    pub fn row_entries(&self, row: usize, lookup: &ColumnLookup) -> Vec<(usize, f64)> {
        let row_view = self.matrix.row(row);
        row_view
            .col_indices()
            .iter()
            .zip(row_view.values())
            .filter_map(|(&col, value)| {
                lookup
                    .position(col)
                    .map(|pos| (pos, value.to_f64().unwrap_or(0.0)))
            })
            .collect()
    }
}

impl FeatureMatrix<f64> {
    /// Build from dense rows (one `Vec` per feature). Exact zeros are not stored.
    pub fn from_dense_rows(
        rows: &[Vec<f64>],
        feature_names: Vec<String>,
        cell_names: Vec<String>,
    ) -> anyhow::Result<Self> {
        let ncols = cell_names.len();
        let mut coo = CooMatrix::new(rows.len(), ncols);
        for (r, row) in rows.iter().enumerate() {
            if row.len() != ncols {
                return Err(MarkerError::InvalidMatrix(format!(
                    "row {} has {} values, expected {}",
                    r,
                    row.len(),
                    ncols
                ))
                .into());
            }
            for (c, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    coo.push(r, c, v);
                }
            }
        }
        FeatureMatrix::new(CsrMatrix::from(&coo), feature_names, cell_names)
    }

    /// Keep the given columns, in the given order.
    pub fn select_cells(&self, cells: &[usize]) -> anyhow::Result<Self> {
        let lookup = ColumnLookup::new(self.n_cells(), cells);
        let mut coo = CooMatrix::new(self.n_features(), cells.len());
        for r in 0..self.n_features() {
            for (pos, v) in self.row_entries(r, &lookup) {
                coo.push(r, pos, v);
            }
        }
        let names = cells.iter().map(|&c| self.cell_names[c].clone()).collect();
        FeatureMatrix::new(CsrMatrix::from(&coo), self.feature_names.clone(), names)
    }

    /// Keep the given rows, in the given order.
    pub fn select_features(&self, features: &[usize]) -> anyhow::Result<Self> {
        let mut coo = CooMatrix::new(features.len(), self.n_cells());
        for (new_row, &r) in features.iter().enumerate() {
            let row_view = self.matrix.row(r);
            for (&c, &v) in row_view.col_indices().iter().zip(row_view.values()) {
                coo.push(new_row, c, v);
            }
        }
        let names = features.iter().map(|&r| self.feature_names[r].clone()).collect();
        FeatureMatrix::new(CsrMatrix::from(&coo), names, self.cell_names.clone())
    }

    /// Dense copy, features x cells.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n_features(), self.n_cells()));
        for r in 0..self.n_features() {
            let row_view = self.matrix.row(r);
            for (&c, &v) in row_view.col_indices().iter().zip(row_view.values()) {
                dense[[r, c]] = v;
            }
        }
        dense
    }
}

/// Maps matrix column indices to positions within an ordered cell selection.
#[derive(Debug, Clone)]
pub struct ColumnLookup {
    positions: Vec<Option<usize>>,
    len: usize,
}

impl ColumnLookup {
    pub fn new(n_cols: usize, selection: &[usize]) -> Self {
        let mut positions = vec![None; n_cols];
        for (pos, &col) in selection.iter().enumerate() {
            positions[col] = Some(pos);
        }
        ColumnLookup {
            positions,
            len: selection.len(),
        }
    }

    pub fn position(&self, col: usize) -> Option<usize> {
        self.positions.get(col).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Two disjoint, non-empty sets of matrix columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGroups {
    group1: Vec<usize>,
    group2: Vec<usize>,
}

fn invalid_groups(message: impl Into<String>) -> anyhow::Error {
    MarkerError::InvalidGroups(message.into()).into()
}

impl CellGroups {
    pub fn from_indices(
        group1: Vec<usize>,
        group2: Vec<usize>,
        n_cells: usize,
    ) -> anyhow::Result<Self> {
        if group1.is_empty() || group2.is_empty() {
            return Err(invalid_groups("both groups must contain at least one cell"));
        }
        if let Some(&bad) = group1.iter().chain(group2.iter()).find(|&&c| c >= n_cells) {
            return Err(invalid_groups(format!("cell index {} out of range", bad)));
        }
        let first: BTreeSet<usize> = group1.iter().copied().collect();
        if first.len() != group1.len() {
            return Err(invalid_groups("group 1 lists a cell twice"));
        }
        let mut second = BTreeSet::new();
        for &c in &group2 {
            if first.contains(&c) {
                return Err(invalid_groups(format!("cell index {} is in both groups", c)));
            }
            if !second.insert(c) {
                return Err(invalid_groups("group 2 lists a cell twice"));
            }
        }
        Ok(CellGroups { group1, group2 })
    }

    pub fn from_names<T, S>(
        matrix: &FeatureMatrix<T>,
        group1: &[S],
        group2: &[S],
    ) -> anyhow::Result<Self>
    where
        T: FloatOpsTS,
        S: AsRef<str>,
    {
        let resolve = |names: &[S]| -> anyhow::Result<Vec<usize>> {
            names
                .iter()
                .map(|n| {
                    matrix
                        .cell_position(n.as_ref())
                        .ok_or_else(|| invalid_groups(format!("unknown cell '{}'", n.as_ref())))
                })
                .collect()
        };
        CellGroups::from_indices(resolve(group1)?, resolve(group2)?, matrix.n_cells())
    }

    /// Cells labelled `ident_1` against cells labelled `ident_2`, or against all
    /// remaining cells when `ident_2` is `None`.
    pub fn from_labels<S: AsRef<str>>(
        labels: &[S],
        ident_1: &str,
        ident_2: Option<&str>,
    ) -> anyhow::Result<Self> {
        let group1: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| (l.as_ref() == ident_1).then_some(i))
            .collect();
        let group2: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| match ident_2 {
                Some(id2) => (l.as_ref() == id2).then_some(i),
                None => (l.as_ref() != ident_1).then_some(i),
            })
            .collect();
        if group1.is_empty() {
            return Err(invalid_groups(format!("no cell labelled '{}'", ident_1)));
        }
        if group2.is_empty() {
            return Err(MarkerError::InvalidGroups(format!(
                "no cell in the comparison group for '{}'",
                ident_2.unwrap_or("rest")
            ))
            .into());
        }
        CellGroups::from_indices(group1, group2, labels.len())
    }

    pub fn group1(&self) -> &[usize] {
        &self.group1
    }

    pub fn group2(&self) -> &[usize] {
        &self.group2
    }

    pub fn n1(&self) -> usize {
        self.group1.len()
    }

    pub fn n2(&self) -> usize {
        self.group2.len()
    }

    /// Group 1 columns followed by group 2 columns.
    pub fn ordered_cells(&self) -> Vec<usize> {
        self.group1.iter().chain(self.group2.iter()).copied().collect()
    }

    pub fn lookup(&self, n_cells: usize) -> ColumnLookup {
        ColumnLookup::new(n_cells, &self.ordered_cells())
    }

    /// 0 for group 1 positions, 1 for group 2 positions, in `ordered_cells` order.
    pub fn indicator(&self) -> Vec<f64> {
        let mut ind = vec![0.0; self.n1()];
        ind.extend(std::iter::repeat_n(1.0, self.n2()));
        ind
    }

    /// Randomly keep at most `max_cells` per group. Sampling is seeded and the
    /// kept cells preserve their original order.
    pub fn downsample(&self, max_cells: usize, seed: u64) -> CellGroups {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut take = |group: &[usize]| -> Vec<usize> {
            if group.len() <= max_cells {
                return group.to_vec();
            }
            let mut picked = rand::seq::index::sample(&mut rng, group.len(), max_cells).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| group[i]).collect()
        };
        let group1 = take(&self.group1);
        let group2 = take(&self.group2);
        CellGroups { group1, group2 }
    }
}

/// Cell-indexed numeric covariates (latent variables).
#[derive(Debug, Clone)]
pub struct Covariates {
    names: Vec<String>,
    values: Array2<f64>,
    cell_index: HashMap<String, usize>,
}

impl Covariates {
    /// `values` is cells x covariates.
    pub fn new(
        cell_names: Vec<String>,
        names: Vec<String>,
        values: Array2<f64>,
    ) -> anyhow::Result<Self> {
        if values.nrows() != cell_names.len() || values.ncols() != names.len() {
            return Err(MarkerError::InvalidMatrix(format!(
                "covariate table is {}x{}, expected {}x{}",
                values.nrows(),
                values.ncols(),
                cell_names.len(),
                names.len()
            ))
            .into());
        }
        let cell_index = build_index(&cell_names, "covariate cell")?;
        Ok(Covariates {
            names,
            values,
            cell_index,
        })
    }

    pub fn n_covariates(&self) -> usize {
        self.names.len()
    }

    /// Rows re-ordered to match `cells`; fails if any cell is missing.
    pub fn reindex<S: AsRef<str>>(&self, cells: &[S]) -> anyhow::Result<Array2<f64>> {
        let mut out = Array2::zeros((cells.len(), self.n_covariates()));
        for (i, cell) in cells.iter().enumerate() {
            let src = self
                .cell_index
                .get(cell.as_ref())
                .ok_or_else(|| MarkerError::CovariateMismatch(cell.as_ref().to_string()))?;
            out.row_mut(i).assign(&self.values.row(*src));
        }
        Ok(out)
    }
}
