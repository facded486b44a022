//! # Sparse Design Matrix
//!
//! Immutable dual-layout (CSR + CSC) storage for the feature matrix `X`.
//!
//! Prediction walks rows, while every coordinate update of the solvers walks a
//! single feature column. Keeping both layouts lets each of those loops touch
//! only the nonzeros it needs. The matrix is built once and never mutated, so a
//! `&SparseDesignMatrix` can be shared freely across threads and iterations.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Errors raised for malformed inputs: bad sparse structure, or vectors whose
/// length does not agree with the design matrix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("Entry ({row}, {col}) lies outside the {rows}x{cols} design matrix.")]
    IndexOutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Column {col} appears more than once in row {row}.")]
    DuplicateEntry { row: usize, col: usize },
    #[error("Entry ({row}, {col}) holds a non-finite value ({value}).")]
    NonFiniteValue { row: usize, col: usize, value: f64 },
    #[error("CSR row pointers are malformed: {0}")]
    MalformedIndptr(String),
    #[error("The design matrix has no rows; at least one sample is required for training.")]
    EmptyDesign,
    #[error("Expected {expected} targets (one per row of the design matrix), found {found}.")]
    TargetLengthMismatch { expected: usize, found: usize },
    #[error("Target at row {row} is not finite ({value}).")]
    NonFiniteTarget { row: usize, value: f64 },
    #[error("Expected {expected} sample weights (one per row), found {found}.")]
    WeightLengthMismatch { expected: usize, found: usize },
    #[error("Sample weight at row {row} is {value}; weights must be finite and non-negative.")]
    InvalidWeight { row: usize, value: f64 },
    #[error("All sample weights are zero; at least one row must contribute to the fit.")]
    ZeroTotalWeight,
    #[error("Design matrix has {found} columns, but the model was trained on {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
}

/// Compressed sparse design matrix with both row-major and column-major indexes.
///
/// Row `r` owns `row_values[row_ptr[r]..row_ptr[r + 1]]` with column indices in
/// `col_idx` over the same range, sorted ascending. Column `c` owns
/// `col_values[col_ptr[c]..col_ptr[c + 1]]` with row indices in `row_idx`,
/// also sorted ascending. Explicit zeros are never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseDesignMatrix {
    n_rows: usize,
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    row_values: Vec<f64>,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    col_values: Vec<f64>,
}

impl SparseDesignMatrix {
    /// Builds the matrix from `(row, col, value)` triplets given in any order.
    ///
    /// Zero values are skipped. Fails if an index is out of range, a value is
    /// not finite, or the same `(row, col)` pair is supplied twice.
    pub fn from_triplets<I>(n_rows: usize, n_cols: usize, triplets: I) -> Result<Self, ShapeError>
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut entries: Vec<(usize, usize, f64)> = Vec::new();
        for (row, col, value) in triplets {
            if row >= n_rows || col >= n_cols {
                return Err(ShapeError::IndexOutOfRange {
                    row,
                    col,
                    rows: n_rows,
                    cols: n_cols,
                });
            }
            if !value.is_finite() {
                return Err(ShapeError::NonFiniteValue { row, col, value });
            }
            entries.push((row, col, value));
        }

        // Sort by (row, col) so duplicates become adjacent and rows come out ordered.
        entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 && pair[0].1 == pair[1].1 {
                return Err(ShapeError::DuplicateEntry {
                    row: pair[0].0,
                    col: pair[0].1,
                });
            }
        }
        entries.retain(|&(_, _, value)| value != 0.0);

        let nnz = entries.len();
        let mut row_ptr = vec![0usize; n_rows + 1];
        let mut col_idx = Vec::with_capacity(nnz);
        let mut row_values = Vec::with_capacity(nnz);
        for &(row, col, value) in &entries {
            row_ptr[row + 1] += 1;
            col_idx.push(col);
            row_values.push(value);
        }
        for r in 0..n_rows {
            row_ptr[r + 1] += row_ptr[r];
        }

        let (col_ptr, row_idx, col_values) = transpose(n_rows, n_cols, &row_ptr, &col_idx, &row_values);

        Ok(Self {
            n_rows,
            n_cols,
            row_ptr,
            col_idx,
            row_values,
            col_ptr,
            row_idx,
            col_values,
        })
    }

    /// Builds the matrix from a dense array, storing only its nonzero entries.
    pub fn from_dense(dense: ArrayView2<f64>) -> Result<Self, ShapeError> {
        let (n_rows, n_cols) = dense.dim();
        let triplets = dense
            .indexed_iter()
            .filter(|&(_, &value)| value != 0.0)
            .map(|((row, col), &value)| (row, col, value));
        Self::from_triplets(n_rows, n_cols, triplets)
    }

    /// Builds the matrix from standard CSR arrays (`indptr`, `indices`, `values`).
    ///
    /// Column indices inside a row need not be sorted; they are sorted during
    /// construction and checked for duplicates.
    pub fn from_csr_parts(
        n_rows: usize,
        n_cols: usize,
        indptr: &[usize],
        indices: &[usize],
        values: &[f64],
    ) -> Result<Self, ShapeError> {
        if indptr.len() != n_rows + 1 {
            return Err(ShapeError::MalformedIndptr(format!(
                "expected {} row pointers, found {}",
                n_rows + 1,
                indptr.len()
            )));
        }
        if indptr[0] != 0 {
            return Err(ShapeError::MalformedIndptr(format!(
                "first row pointer must be 0, found {}",
                indptr[0]
            )));
        }
        if indptr.windows(2).any(|w| w[1] < w[0]) {
            return Err(ShapeError::MalformedIndptr(
                "row pointers must be non-decreasing".to_string(),
            ));
        }
        if indices.len() != values.len() || indptr[n_rows] != indices.len() {
            return Err(ShapeError::MalformedIndptr(format!(
                "last row pointer ({}) must equal the number of indices ({}) and values ({})",
                indptr[n_rows],
                indices.len(),
                values.len()
            )));
        }

        let triplets = (0..n_rows).flat_map(|row| {
            (indptr[row]..indptr[row + 1]).map(move |k| (row, indices[k], values[k]))
        });
        Self::from_triplets(n_rows, n_cols, triplets)
    }

    /// Number of rows (samples).
    pub fn rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns (features).
    pub fn cols(&self) -> usize {
        self.n_cols
    }

    /// Number of stored nonzero entries.
    pub fn nnz(&self) -> usize {
        self.row_values.len()
    }

    /// Number of nonzero entries in `row`.
    pub fn row_nnz(&self, row: usize) -> usize {
        self.row_ptr[row + 1] - self.row_ptr[row]
    }

    /// Column indices and values of the nonzeros in `row`, sorted by column.
    ///
    /// # Panics
    /// Panics if `row >= self.rows()`.
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        (&self.col_idx[range.clone()], &self.row_values[range])
    }

    /// Row indices and values of the nonzeros in `col`, sorted by row.
    ///
    /// # Panics
    /// Panics if `col >= self.cols()`.
    pub fn column(&self, col: usize) -> (&[usize], &[f64]) {
        let range = self.col_ptr[col]..self.col_ptr[col + 1];
        (&self.row_idx[range.clone()], &self.col_values[range])
    }

    /// Value stored at `(row, col)`, or zero if the entry is absent.
    ///
    /// # Panics
    /// Panics if `row >= self.rows()`.
    pub fn value_at(&self, row: usize, col: usize) -> f64 {
        let (cols, values) = self.row(row);
        match cols.binary_search(&col) {
            Ok(k) => values[k],
            Err(_) => 0.0,
        }
    }

    /// Calls `f(col, value)` for every nonzero of `row`, in column order.
    ///
    /// # Panics
    /// Panics if `row >= self.rows()`.
    pub fn for_each_nonzero_in_row<F>(&self, row: usize, mut f: F)
    where
        F: FnMut(usize, f64),
    {
        let (cols, values) = self.row(row);
        for (&col, &value) in cols.iter().zip(values) {
            f(col, value);
        }
    }

    /// Calls `f(row, value)` for every nonzero of `col`, in row order.
    ///
    /// # Panics
    /// Panics if `col >= self.cols()`.
    pub fn for_each_nonzero_in_column<F>(&self, col: usize, mut f: F)
    where
        F: FnMut(usize, f64),
    {
        let (rows, values) = self.column(col);
        for (&row, &value) in rows.iter().zip(values) {
            f(row, value);
        }
    }

    /// Materializes the matrix as a dense array. Intended for diagnostics and tests.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::<f64>::zeros((self.n_rows, self.n_cols));
        for row in 0..self.n_rows {
            self.for_each_nonzero_in_row(row, |col, value| dense[[row, col]] = value);
        }
        dense
    }
}

/// Builds the CSC index from a CSR index. Rows are visited in order, so the
/// row indices of every column come out sorted.
fn transpose(
    n_rows: usize,
    n_cols: usize,
    row_ptr: &[usize],
    col_idx: &[usize],
    row_values: &[f64],
) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let nnz = row_values.len();
    let mut col_ptr = vec![0usize; n_cols + 1];
    for &col in col_idx {
        col_ptr[col + 1] += 1;
    }
    for c in 0..n_cols {
        col_ptr[c + 1] += col_ptr[c];
    }

    let mut cursor = col_ptr[..n_cols].to_vec();
    let mut row_idx = vec![0usize; nnz];
    let mut col_values = vec![0.0; nnz];
    for row in 0..n_rows {
        for k in row_ptr[row]..row_ptr[row + 1] {
            let col = col_idx[k];
            let slot = cursor[col];
            row_idx[slot] = row;
            col_values[slot] = row_values[k];
            cursor[col] += 1;
        }
    }
    (col_ptr, row_idx, col_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fixture() -> SparseDesignMatrix {
        // | 1 2 0 |
        // | 0 3 0 |
        // | 4 0 2 |
        // | 4 5 0 |
        SparseDesignMatrix::from_dense(
            array![
                [1.0, 2.0, 0.0],
                [0.0, 3.0, 0.0],
                [4.0, 0.0, 2.0],
                [4.0, 5.0, 0.0]
            ]
            .view(),
        )
        .unwrap()
    }

    #[test]
    fn dense_round_trip_preserves_entries() {
        let x = fixture();
        assert_eq!(x.rows(), 4);
        assert_eq!(x.cols(), 3);
        assert_eq!(x.nnz(), 7);
        assert_eq!(
            x.to_dense(),
            array![
                [1.0, 2.0, 0.0],
                [0.0, 3.0, 0.0],
                [4.0, 0.0, 2.0],
                [4.0, 5.0, 0.0]
            ]
        );
    }

    #[test]
    fn column_view_matches_row_view() {
        let x = fixture();
        let (rows, values) = x.column(0);
        assert_eq!(rows, &[0, 2, 3]);
        assert_eq!(values, &[1.0, 4.0, 4.0]);

        let mut seen = Vec::new();
        x.for_each_nonzero_in_column(1, |row, value| seen.push((row, value)));
        assert_eq!(seen, vec![(0, 2.0), (1, 3.0), (3, 5.0)]);

        for row in 0..x.rows() {
            x.for_each_nonzero_in_row(row, |col, value| {
                assert_eq!(x.value_at(row, col), value);
            });
        }
    }

    #[test]
    fn unordered_triplets_are_sorted_per_row() {
        let x = SparseDesignMatrix::from_triplets(
            2,
            4,
            vec![(1, 3, 1.5), (0, 2, -1.0), (1, 0, 2.0), (0, 1, 4.0)],
        )
        .unwrap();
        assert_eq!(x.row(0), (&[1usize, 2][..], &[4.0, -1.0][..]));
        assert_eq!(x.row(1), (&[0usize, 3][..], &[2.0, 1.5][..]));
        assert_eq!(x.value_at(0, 0), 0.0);
    }

    #[test]
    fn explicit_zeros_are_not_stored() {
        let x = SparseDesignMatrix::from_triplets(2, 2, vec![(0, 0, 0.0), (1, 1, 3.0)]).unwrap();
        assert_eq!(x.nnz(), 1);
        assert_eq!(x.row_nnz(0), 0);
        assert_eq!(x.row_nnz(1), 1);
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let err = SparseDesignMatrix::from_triplets(2, 2, vec![(0, 1, 1.0), (0, 1, 2.0)])
            .unwrap_err();
        assert_eq!(err, ShapeError::DuplicateEntry { row: 0, col: 1 });
    }

    #[test]
    fn out_of_range_entries_are_rejected() {
        let err = SparseDesignMatrix::from_triplets(2, 2, vec![(0, 2, 1.0)]).unwrap_err();
        assert!(matches!(err, ShapeError::IndexOutOfRange { col: 2, .. }));

        let err = SparseDesignMatrix::from_triplets(2, 2, vec![(5, 0, 1.0)]).unwrap_err();
        assert!(matches!(err, ShapeError::IndexOutOfRange { row: 5, .. }));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let err = SparseDesignMatrix::from_dense(array![[1.0, f64::NAN]].view()).unwrap_err();
        assert!(matches!(err, ShapeError::NonFiniteValue { row: 0, col: 1, .. }));
    }

    #[test]
    fn csr_parts_are_validated() {
        let x = SparseDesignMatrix::from_csr_parts(2, 3, &[0, 2, 3], &[2, 0, 1], &[1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(x.row(0), (&[0usize, 2][..], &[2.0, 1.0][..]));

        let err = SparseDesignMatrix::from_csr_parts(2, 3, &[0, 2], &[0, 1], &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, ShapeError::MalformedIndptr(_)));

        let err = SparseDesignMatrix::from_csr_parts(2, 3, &[0, 3, 2], &[0, 1, 2], &[1.0; 3])
            .unwrap_err();
        assert!(matches!(err, ShapeError::MalformedIndptr(_)));
    }

    #[test]
    fn empty_rows_and_columns_are_supported() {
        let x = SparseDesignMatrix::from_triplets(3, 3, vec![(2, 2, 1.0)]).unwrap();
        assert_eq!(x.row_nnz(0), 0);
        assert_eq!(x.column(0).0.len(), 0);
        assert_eq!(x.column(2), (&[2usize][..], &[1.0][..]));
    }
}
