//! Sparse matrix utilities.
//!
//! Helpers for assembling the nalgebra-sparse matrices handed to the solver.

use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};

/// A single `(row, col, value)` entry.
pub type Triplet = (usize, usize, f64);

/// Create a CSC matrix from triplets.
///
/// Duplicates are summed together. Entries outside the shape are dropped.
pub fn csc_from_triplets(nrows: usize, ncols: usize, triplets: &[Triplet]) -> CscMatrix<f64> {
    if triplets.is_empty() {
        return CscMatrix::zeros(nrows, ncols);
    }

    let mut coo = CooMatrix::new(nrows, ncols);
    for &(row, col, val) in triplets {
        if row < nrows && col < ncols {
            coo.push(row, col, val);
        }
    }

    CscMatrix::from(&coo)
}

/// Push the upper triangle of a dense symmetric block into a triplet list.
///
/// The block lands at `(offset, offset)` and every entry is multiplied by
/// `scale`. Near-zero entries are skipped.
pub fn push_upper_triangle(
    triplets: &mut Vec<Triplet>,
    block: &DMatrix<f64>,
    offset: usize,
    scale: f64,
) {
    for j in 0..block.ncols() {
        for i in 0..=j.min(block.nrows().saturating_sub(1)) {
            let v = block[(i, j)] * scale;
            if v.abs() > 1e-15 {
                triplets.push((offset + i, offset + j, v));
            }
        }
    }
}

/// Convert CSC to dense matrix.
pub fn csc_to_dense(sparse: &CscMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(sparse.nrows(), sparse.ncols());
    for (row, col, val) in sparse.triplet_iter() {
        dense[(row, col)] += *val;
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csc_from_triplets_sums_duplicates() {
        let m = csc_from_triplets(2, 2, &[(0, 0, 1.0), (0, 0, 2.0), (1, 1, 4.0)]);
        let d = csc_to_dense(&m);
        assert_eq!(d[(0, 0)], 3.0);
        assert_eq!(d[(1, 1)], 4.0);
        assert_eq!(d[(0, 1)], 0.0);
    }

    #[test]
    fn test_csc_from_triplets_empty() {
        let m = csc_from_triplets(3, 4, &[]);
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.ncols(), 4);
        assert_eq!(m.nnz(), 0);
    }

    #[test]
    fn test_push_upper_triangle() {
        let block = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]);
        let mut triplets = Vec::new();
        push_upper_triangle(&mut triplets, &block, 1, 2.0);
        assert_eq!(triplets, vec![(1, 1, 2.0), (1, 2, 1.0), (2, 2, 4.0)]);
    }
}
