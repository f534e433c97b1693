//! Dirichlet row editing on sparse matrices.
//!
//! Both transforms are pure: the input is left untouched and a fresh CSC
//! matrix of the same shape is returned.  Cost is one pass over the
//! non-zeros.

use crate::linalg::for_each_entry;
use crate::types::BoundaryNodeSet;
use ndarray::{Array1, Array2, ArrayView1};
use sprs::{CsMat, TriMat};

/// Rows in `boundary` become identity rows; every other row is copied.
///
/// The unit diagonal is written even when the input has no structural
/// entry there.
pub fn replace_rows_with_identity(mat: &CsMat<f64>, boundary: &BoundaryNodeSet) -> CsMat<f64> {
    let mut tri = TriMat::with_capacity((mat.rows(), mat.cols()), mat.nnz() + boundary.len());
    for_each_entry(mat, |row, col, val| {
        if !boundary.contains(row) {
            tri.add_triplet(row, col, val);
        }
    });
    for &b in boundary.indices() {
        if b < mat.cols() {
            tri.add_triplet(b, b, 1.0);
        }
    }
    tri.to_csc()
}

/// Rows in `boundary` are dropped entirely (identically zero).
pub fn zero_rows(mat: &CsMat<f64>, boundary: &BoundaryNodeSet) -> CsMat<f64> {
    let mut tri = TriMat::with_capacity((mat.rows(), mat.cols()), mat.nnz());
    for_each_entry(mat, |row, col, val| {
        if !boundary.contains(row) {
            tri.add_triplet(row, col, val);
        }
    });
    tri.to_csc()
}

/// Zero the Dirichlet rows of every column of `b` in place.
pub fn zero_boundary_rows(b: &mut Array2<f64>, boundary: &BoundaryNodeSet) {
    for &i in boundary.indices() {
        if i < b.nrows() {
            b.row_mut(i).fill(0.0);
        }
    }
}

/// Gather the free entries of a full vector.
pub fn full_to_reduced(full: ArrayView1<f64>, boundary: &BoundaryNodeSet) -> Array1<f64> {
    full.iter()
        .enumerate()
        .filter(|(i, _)| !boundary.contains(*i))
        .map(|(_, &v)| v)
        .collect()
}

/// Scatter a reduced vector back to full size, Dirichlet rows set to zero.
pub fn reduced_to_full(reduced: &[f64], boundary: &BoundaryNodeSet) -> Array1<f64> {
    let mut full = Array1::zeros(boundary.ndof());
    let mut next = 0;
    for (i, v) in full.iter_mut().enumerate() {
        if !boundary.contains(i) {
            *v = reduced[next];
            next += 1;
        }
    }
    full
}
