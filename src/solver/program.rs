//! Conic program assembly.
//!
//! Optimizers describe their problem as variable blocks, an objective and a
//! list of affine rows tagged with the cone they must lie in. `stuff` turns
//! that description into the matrices (P, q, A, b) and cone dimensions
//! Clarabel expects:
//!
//! ```text
//! minimize    (1/2) x' P x + q' x
//! subject to  A x + s = b,  s in K
//! ```

use nalgebra::DMatrix;
use nalgebra_sparse::CscMatrix;

use crate::sparse::{csc_from_triplets, push_upper_triangle, Triplet};

/// Cone dimensions for Clarabel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConeDims {
    /// Number of zero cone (equality) rows.
    pub zero: usize,
    /// Number of nonnegative cone rows.
    pub nonneg: usize,
    /// Second-order cone dimensions (each entry is the cone dimension).
    pub soc: Vec<usize>,
}

impl ConeDims {
    /// Total number of constraint rows.
    pub fn total(&self) -> usize {
        self.zero + self.nonneg + self.soc.iter().sum::<usize>()
    }
}

/// A contiguous block of optimization variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarBlock {
    /// First column of the block.
    pub start: usize,
    /// Number of variables in the block.
    pub len: usize,
}

impl VarBlock {
    /// Column of the `i`-th variable in the block.
    pub fn at(&self, i: usize) -> usize {
        debug_assert!(i < self.len);
        self.start + i
    }

    /// Columns of every variable in the block.
    pub fn columns(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }

    /// Slice this block's values out of a primal solution.
    pub fn slice<'a>(&self, x: &'a [f64]) -> &'a [f64] {
        &x[self.columns()]
    }
}

/// An affine expression `sum_j coeff_j * x_j + constant`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffineRow {
    /// Sparse coefficients as `(column, coefficient)` pairs.
    pub coeffs: Vec<(usize, f64)>,
    /// Constant term.
    pub constant: f64,
}

impl AffineRow {
    /// The zero expression.
    pub fn new() -> Self {
        AffineRow::default()
    }

    /// A constant expression.
    pub fn constant(value: f64) -> Self {
        AffineRow {
            coeffs: Vec::new(),
            constant: value,
        }
    }

    /// Add `coeff * x_col`.
    pub fn term(mut self, col: usize, coeff: f64) -> Self {
        self.coeffs.push((col, coeff));
        self
    }

    /// Add several terms at once.
    pub fn terms(mut self, terms: impl IntoIterator<Item = (usize, f64)>) -> Self {
        self.coeffs.extend(terms);
        self
    }

    /// Add `value` to the constant.
    pub fn plus(mut self, value: f64) -> Self {
        self.constant += value;
        self
    }

    /// Multiply the whole expression by `factor`.
    pub fn scaled(mut self, factor: f64) -> Self {
        for (_, c) in &mut self.coeffs {
            *c *= factor;
        }
        self.constant *= factor;
        self
    }

    /// Evaluate the expression at `x`.
    pub fn eval(&self, x: &[f64]) -> f64 {
        self.coeffs.iter().map(|&(j, c)| c * x[j]).sum::<f64>() + self.constant
    }
}

/// A conic program under construction.
#[derive(Debug, Clone, Default)]
pub struct ConicProgram {
    num_vars: usize,
    p: Vec<Triplet>,
    q: Vec<f64>,
    zeros: Vec<AffineRow>,
    nonnegs: Vec<AffineRow>,
    socs: Vec<Vec<AffineRow>>,
}

impl ConicProgram {
    /// An empty program with no variables.
    pub fn new() -> Self {
        ConicProgram::default()
    }

    /// Allocate `len` new variables and return their block.
    pub fn add_variables(&mut self, len: usize) -> VarBlock {
        let block = VarBlock {
            start: self.num_vars,
            len,
        };
        self.num_vars += len;
        self.q.resize(self.num_vars, 0.0);
        block
    }

    /// Total number of variables.
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Add `x_b' M x_b` to the objective for the variables of `block`.
    ///
    /// `m` must be symmetric; only its upper triangle is read.
    pub fn add_quadratic(&mut self, block: VarBlock, m: &DMatrix<f64>) {
        debug_assert_eq!(m.nrows(), block.len);
        // Clarabel minimizes (1/2) x' P x, so P = 2M.
        push_upper_triangle(&mut self.p, m, block.start, 2.0);
    }

    /// Add `coeff * x_col` to the objective.
    pub fn add_linear(&mut self, col: usize, coeff: f64) {
        self.q[col] += coeff;
    }

    /// Add every term of `row` to the objective. The constant is ignored.
    pub fn add_linear_row(&mut self, row: &AffineRow) {
        for &(col, coeff) in &row.coeffs {
            self.q[col] += coeff;
        }
    }

    /// Constrain `row == 0`.
    pub fn equal_zero(&mut self, row: AffineRow) {
        self.zeros.push(row);
    }

    /// Constrain `row >= 0`.
    pub fn nonneg(&mut self, row: AffineRow) {
        self.nonnegs.push(row);
    }

    /// Constrain `rows[0] >= || rows[1..] ||_2`.
    pub fn second_order(&mut self, rows: Vec<AffineRow>) {
        debug_assert!(rows.len() >= 2, "second-order cone needs at least 2 rows");
        self.socs.push(rows);
    }

    /// Build the matrices and cone dimensions for the solver.
    pub fn stuff(&self) -> StuffedProblem {
        let n = self.num_vars;
        let cone_dims = ConeDims {
            zero: self.zeros.len(),
            nonneg: self.nonnegs.len(),
            soc: self.socs.iter().map(Vec::len).collect(),
        };
        let total_rows = cone_dims.total();

        let mut a_triplets = Vec::new();
        let mut b = vec![0.0; total_rows];
        let mut row_offset = 0;

        // Zero cone: A x + s = b with s = 0, so for row = c'x + k we need
        // c'x = -k.
        for row in &self.zeros {
            stuff_row(row, row_offset, &mut a_triplets, &mut b, false);
            row_offset += 1;
        }

        // Nonnegative and second-order cones: s = b - A x must equal the row
        // itself, so A = -c and b = k.
        for row in &self.nonnegs {
            stuff_row(row, row_offset, &mut a_triplets, &mut b, true);
            row_offset += 1;
        }
        for cone in &self.socs {
            for row in cone {
                stuff_row(row, row_offset, &mut a_triplets, &mut b, true);
                row_offset += 1;
            }
        }

        StuffedProblem {
            p: csc_from_triplets(n, n, &self.p),
            q: self.q.clone(),
            a: csc_from_triplets(total_rows, n, &a_triplets),
            b,
            cone_dims,
        }
    }
}

fn stuff_row(row: &AffineRow, index: usize, a: &mut Vec<Triplet>, b: &mut [f64], negate: bool) {
    let sign = if negate { -1.0 } else { 1.0 };
    for &(col, coeff) in &row.coeffs {
        a.push((index, col, coeff * sign));
    }
    b[index] = if negate { row.constant } else { -row.constant };
}

/// Stuffed problem ready for Clarabel.
#[derive(Debug)]
pub struct StuffedProblem {
    /// Quadratic cost matrix P (n x n, upper triangle).
    pub p: CscMatrix<f64>,
    /// Linear cost vector q (n).
    pub q: Vec<f64>,
    /// Constraint matrix A (m x n).
    pub a: CscMatrix<f64>,
    /// Constraint vector b (m).
    pub b: Vec<f64>,
    /// Cone dimensions.
    pub cone_dims: ConeDims,
}
