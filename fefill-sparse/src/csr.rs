use crate::map::{combine, CombineMode, MapMismatch};
use fefill_traits::Real;
use nalgebra::{DVector, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::AddAssign;

/// Builds the square sparsity pattern coupling all DOFs that share an element.
///
/// Each item of `elements` lists the (local) DOF indices of one element.
pub fn pattern_from_element_dofs<'a, I>(num_dofs: usize, elements: I) -> SparsityPattern
where
    I: IntoIterator<Item = &'a [usize]>,
{
    // Collecting into a BTreeSet stores every matrix entry once, and gives us the entries
    // in row-major order for free
    let mut matrix_entries = BTreeSet::new();
    for element_dofs in elements {
        for &i in element_dofs {
            for &j in element_dofs {
                matrix_entries.insert((i, j));
            }
        }
    }

    let mut offsets = Vec::with_capacity(num_dofs + 1);
    let mut column_indices = Vec::with_capacity(matrix_entries.len());

    offsets.push(0);
    for (i, j) in matrix_entries {
        assert!(i < num_dofs && j < num_dofs, "Element DOF index out of bounds");
        while i + 1 > offsets.len() {
            // Loop to handle consecutive empty rows
            offsets.push(column_indices.len());
        }
        column_indices.push(j);
    }

    while offsets.len() < (num_dofs + 1) {
        offsets.push(column_indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(num_dofs, num_dofs, offsets, column_indices)
        .expect("Internal error: pattern built from sorted, deduplicated entries must be valid")
}

/// Creates a matrix with the given pattern and all stored values equal to zero.
pub fn zeroed_csr<T: Scalar + Zero>(pattern: &SparsityPattern) -> CsrMatrix<T> {
    let values = vec![T::zero(); pattern.nnz()];
    CsrMatrix::try_from_pattern_and_values(pattern.clone(), values)
        .expect("Internal error: number of values matches the pattern by construction")
}

/// Sets every stored value to zero, keeping the sparsity pattern.
pub fn fill_zero<T: Scalar + Zero>(matrix: &mut CsrMatrix<T>) {
    matrix.values_mut().iter_mut().for_each(|v| *v = T::zero());
}

/// Combines `values` into the entries `(row, cols[k])` of the matrix.
///
/// Fails if a column is not part of the row's sparsity pattern.
pub fn add_to_csr_row<T>(
    matrix: &mut CsrMatrix<T>,
    row: usize,
    cols: &[usize],
    values: &[T],
    mode: CombineMode,
) -> Result<(), MapMismatch>
where
    T: Scalar + AddAssign,
{
    assert_eq!(cols.len(), values.len());
    if row >= matrix.nrows() {
        return Err(MapMismatch::LengthMismatch {
            expected: matrix.nrows(),
            actual: row + 1,
        });
    }
    let mut csr_row = matrix.row_mut(row);
    let (row_cols, row_values) = csr_row.cols_and_values_mut();
    for (&col, value) in cols.iter().zip(values) {
        let idx = row_cols
            .binary_search(&col)
            .map_err(|_| MapMismatch::MissingEntry { row, col })?;
        combine(&mut row_values[idx], value.clone(), mode);
    }
    Ok(())
}

/// Zeroes all stored entries of a row and places `diagonal` on its diagonal entry.
pub fn replace_row_with_diagonal<T: Scalar + Zero>(
    matrix: &mut CsrMatrix<T>,
    row: usize,
    diagonal: T,
) -> Result<(), MapMismatch> {
    if row >= matrix.nrows() {
        return Err(MapMismatch::LengthMismatch {
            expected: matrix.nrows(),
            actual: row + 1,
        });
    }
    let mut csr_row = matrix.row_mut(row);
    let (row_cols, row_values) = csr_row.cols_and_values_mut();
    let diag_idx = row_cols
        .binary_search(&row)
        .map_err(|_| MapMismatch::MissingEntry { row, col: row })?;
    row_values.iter_mut().for_each(|v| *v = T::zero());
    row_values[diag_idx] = diagonal;
    Ok(())
}

/// The main diagonal of a square matrix. Entries outside the pattern read as zero.
pub fn diagonal<T: Real + Send + Sync>(matrix: &CsrMatrix<T>) -> DVector<T> {
    let offsets = matrix.row_offsets();
    let cols = matrix.col_indices();
    let values = matrix.values();
    let diag: Vec<T> = (0..matrix.nrows())
        .into_par_iter()
        .map(|i| {
            let range = offsets[i]..offsets[i + 1];
            cols[range.clone()]
                .binary_search(&i)
                .map(|k| values[range.start + k])
                .unwrap_or_else(|_| T::zero())
        })
        .collect();
    DVector::from_vec(diag)
}

/// Sum of the absolute values of each row.
pub fn abs_row_sums<T: Real + Send + Sync>(matrix: &CsrMatrix<T>) -> DVector<T> {
    let offsets = matrix.row_offsets();
    let values = matrix.values();
    let sums: Vec<T> = (0..matrix.nrows())
        .into_par_iter()
        .map(|i| {
            values[offsets[i]..offsets[i + 1]]
                .iter()
                .fold(T::zero(), |acc, v| acc + v.abs())
        })
        .collect();
    DVector::from_vec(sums)
}

/// Computes `diag(scale) * matrix` in place.
pub fn left_scale<T: Real>(matrix: &mut CsrMatrix<T>, scale: &DVector<T>) {
    assert_eq!(matrix.nrows(), scale.len(), "Scale vector must have one entry per row");
    for (mut row, &s) in matrix.row_iter_mut().zip(scale.iter()) {
        row.values_mut().iter_mut().for_each(|v| *v *= s);
    }
}

/// Computes `v[i] *= scale[i]` for every entry.
pub fn scale_elementwise<T: Real + Send + Sync>(v: &mut DVector<T>, scale: &DVector<T>) {
    assert_eq!(v.len(), scale.len(), "Vectors must have the same length");
    v.as_mut_slice()
        .par_iter_mut()
        .zip(scale.as_slice().par_iter())
        .for_each(|(v, &s)| *v *= s);
}

/// Computes `matrix * x`.
pub fn spmv<T: Real>(matrix: &CsrMatrix<T>, x: &DVector<T>) -> DVector<T> {
    assert_eq!(matrix.ncols(), x.len(), "Dimension mismatch in matrix-vector product");
    let mut y = DVector::zeros(matrix.nrows());
    spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(matrix), Op::NoOp(x));
    y
}
