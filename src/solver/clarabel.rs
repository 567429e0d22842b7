//! Clarabel solver integration.
//!
//! This module provides the interface to the Clarabel conic solver.

use clarabel::algebra::CscMatrix as ClarabelCsc;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::program::{ConeDims, StuffedProblem};
use crate::error::{PortfolioError, Result};

/// Solution status from the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Optimal solution found.
    Optimal,
    /// Solved to the solver's reduced tolerances only.
    AlmostOptimal,
    /// Problem is infeasible.
    Infeasible,
    /// Problem is unbounded.
    Unbounded,
    /// Iteration or time budget exhausted.
    MaxIterations,
    /// Numerical difficulties.
    NumericalError,
    /// Unknown status.
    Unknown,
}

impl From<SolverStatus> for SolveStatus {
    fn from(status: SolverStatus) -> Self {
        match status {
            SolverStatus::Solved => SolveStatus::Optimal,
            SolverStatus::AlmostSolved => SolveStatus::AlmostOptimal,
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                SolveStatus::Infeasible
            }
            SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
                SolveStatus::Unbounded
            }
            SolverStatus::MaxIterations | SolverStatus::MaxTime => SolveStatus::MaxIterations,
            SolverStatus::NumericalError | SolverStatus::InsufficientProgress => {
                SolveStatus::NumericalError
            }
            _ => SolveStatus::Unknown,
        }
    }
}

/// Solver settings: the iteration/time budget of every solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Print solver output.
    pub verbose: bool,
    /// Maximum iterations.
    pub max_iter: u32,
    /// Time limit in seconds (`None` for no limit).
    pub time_limit: Option<f64>,
    /// Absolute duality gap tolerance.
    pub tol_gap_abs: f64,
    /// Relative duality gap tolerance.
    pub tol_gap_rel: f64,
    /// Feasibility tolerance.
    pub tol_feas: f64,
    /// Accept solutions that only meet Clarabel's reduced tolerances.
    pub accept_reduced_accuracy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            verbose: false,
            max_iter: 200,
            time_limit: None,
            tol_gap_abs: 1e-8,
            tol_gap_rel: 1e-8,
            tol_feas: 1e-8,
            accept_reduced_accuracy: true,
        }
    }
}

impl Settings {
    /// Override the iteration budget.
    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Override the time budget (seconds).
    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    /// Refuse reduced-accuracy solutions.
    pub fn strict(mut self) -> Self {
        self.accept_reduced_accuracy = false;
        self
    }
}

/// Solution from the solver.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Solution status.
    pub status: SolveStatus,
    /// Objective value `(1/2) x'Px + q'x` (if solved).
    pub value: Option<f64>,
    /// Primal variable values.
    pub x: Vec<f64>,
    /// Solve time in seconds.
    pub solve_time: f64,
    /// Number of iterations.
    pub iterations: u32,
}

impl Solution {
    /// Whether the status was only reached at reduced accuracy.
    pub fn is_reduced_accuracy(&self) -> bool {
        self.status == SolveStatus::AlmostOptimal
    }

    /// Turn a non-optimal status into the matching error.
    pub fn into_optimal(self, settings: &Settings) -> Result<Solution> {
        match self.status {
            SolveStatus::Optimal => Ok(self),
            SolveStatus::AlmostOptimal if settings.accept_reduced_accuracy => {
                warn!(
                    iterations = self.iterations,
                    "accepting solution at reduced accuracy"
                );
                Ok(self)
            }
            SolveStatus::Infeasible => Err(PortfolioError::infeasible(
                "constraints",
                "solver certified the constraint set as primal infeasible",
            )),
            SolveStatus::Unbounded => Err(PortfolioError::invalid(
                "constraints",
                "objective is unbounded over the constraint set",
            )),
            status => Err(PortfolioError::SolverNonConvergence {
                status,
                iterations: self.iterations,
            }),
        }
    }
}

/// Solve the stuffed problem using Clarabel.
pub fn solve(problem: &StuffedProblem, settings: &Settings) -> Result<Solution> {
    let p = to_clarabel_csc(&problem.p);
    let a = to_clarabel_csc(&problem.a);
    let cones = to_clarabel_cones(&problem.cone_dims);

    let clarabel_settings = DefaultSettingsBuilder::default()
        .verbose(settings.verbose)
        .max_iter(settings.max_iter)
        .time_limit(settings.time_limit.unwrap_or(f64::INFINITY))
        .tol_gap_abs(settings.tol_gap_abs)
        .tol_gap_rel(settings.tol_gap_rel)
        .tol_feas(settings.tol_feas)
        .build()
        .map_err(|e| PortfolioError::invalid("solver settings", e.to_string()))?;

    let mut solver = DefaultSolver::new(&p, &problem.q, &a, &problem.b, &cones, clarabel_settings);
    solver.solve();

    let status: SolveStatus = solver.solution.status.into();
    let solve_time = solver.solution.solve_time;
    let iterations = solver.info.iterations;
    debug!(?status, iterations, solve_time, "clarabel finished");

    let value = matches!(status, SolveStatus::Optimal | SolveStatus::AlmostOptimal)
        .then(|| compute_objective(&solver.solution.x, &problem.p, &problem.q));

    Ok(Solution {
        status,
        value,
        x: solver.solution.x.clone(),
        solve_time,
        iterations,
    })
}

/// Convert nalgebra CSC to Clarabel CSC.
fn to_clarabel_csc(m: &nalgebra_sparse::CscMatrix<f64>) -> ClarabelCsc<f64> {
    ClarabelCsc::new(
        m.nrows(),
        m.ncols(),
        m.col_offsets().to_vec(),
        m.row_indices().to_vec(),
        m.values().to_vec(),
    )
}

/// Convert cone dimensions to Clarabel cones.
fn to_clarabel_cones(dims: &ConeDims) -> Vec<SupportedConeT<f64>> {
    let mut cones = Vec::new();

    if dims.zero > 0 {
        cones.push(SupportedConeT::ZeroConeT(dims.zero));
    }

    if dims.nonneg > 0 {
        cones.push(SupportedConeT::NonnegativeConeT(dims.nonneg));
    }

    for &soc_dim in &dims.soc {
        cones.push(SupportedConeT::SecondOrderConeT(soc_dim));
    }

    cones
}

/// Compute objective value: (1/2) x' P x + q' x.
fn compute_objective(x: &[f64], p: &nalgebra_sparse::CscMatrix<f64>, q: &[f64]) -> f64 {
    let linear: f64 = q.iter().zip(x.iter()).map(|(qi, xi)| qi * xi).sum();

    let mut quadratic = 0.0;
    for (row, col, val) in p.triplet_iter() {
        if row == col {
            quadratic += 0.5 * *val * x[row] * x[col];
        } else {
            // Upper triangle only, so each off-diagonal pair counts once.
            quadratic += *val * x[row] * x[col];
        }
    }

    linear + quadratic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::program::{AffineRow, ConicProgram};
    use nalgebra::DMatrix;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(!settings.verbose);
        assert_eq!(settings.max_iter, 200);
        assert!(settings.accept_reduced_accuracy);
    }

    #[test]
    fn test_to_clarabel_cones() {
        let dims = ConeDims {
            zero: 2,
            nonneg: 3,
            soc: vec![4],
        };
        let cones = to_clarabel_cones(&dims);
        assert_eq!(cones.len(), 3);
    }

    #[test]
    fn test_solve_small_qp() {
        // minimize x0^2 + x1^2 s.t. x0 + x1 = 2  ->  x = [1, 1], value 2
        let mut prog = ConicProgram::new();
        let x = prog.add_variables(2);
        prog.add_quadratic(x, &DMatrix::identity(2, 2));
        prog.equal_zero(AffineRow::new().term(0, 1.0).term(1, 1.0).plus(-2.0));

        let sol = solve(&prog.stuff(), &Settings::default())
            .unwrap()
            .into_optimal(&Settings::default())
            .unwrap();
        assert!((sol.value.unwrap() - 2.0).abs() < 1e-6);
        assert!((sol.x[0] - 1.0).abs() < 1e-6);
        assert!((sol.x[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_solve_socp() {
        // minimize t s.t. ||x|| <= t, x0 + x1 = 2  ->  t = sqrt(2)
        let mut prog = ConicProgram::new();
        let x = prog.add_variables(2);
        let t = prog.add_variables(1);
        prog.add_linear(t.at(0), 1.0);
        prog.equal_zero(AffineRow::new().term(x.at(0), 1.0).term(x.at(1), 1.0).plus(-2.0));
        prog.second_order(vec![
            AffineRow::new().term(t.at(0), 1.0),
            AffineRow::new().term(x.at(0), 1.0),
            AffineRow::new().term(x.at(1), 1.0),
        ]);

        let sol = solve(&prog.stuff(), &Settings::default()).unwrap();
        assert_eq!(sol.status, SolveStatus::Optimal);
        assert!((sol.value.unwrap() - 2.0_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_maps_to_error() {
        // x >= 1 and x <= 0
        let mut prog = ConicProgram::new();
        let x = prog.add_variables(1);
        prog.add_linear(x.at(0), 1.0);
        prog.nonneg(AffineRow::new().term(0, 1.0).plus(-1.0));
        prog.nonneg(AffineRow::new().term(0, -1.0));

        let settings = Settings::default();
        let sol = solve(&prog.stuff(), &settings).unwrap();
        assert_eq!(sol.status, SolveStatus::Infeasible);
        assert!(matches!(
            sol.into_optimal(&settings),
            Err(PortfolioError::InfeasibleConstraints { .. })
        ));
    }

    #[test]
    fn test_iteration_budget_is_reported() {
        let mut prog = ConicProgram::new();
        let x = prog.add_variables(3);
        prog.add_quadratic(x, &DMatrix::identity(3, 3));
        prog.equal_zero(AffineRow::new().terms(x.columns().map(|c| (c, 1.0))).plus(-1.0));
        for c in x.columns() {
            prog.nonneg(AffineRow::new().term(c, 1.0));
        }

        let settings = Settings::default().with_max_iter(1).strict();
        let sol = solve(&prog.stuff(), &settings).unwrap();
        assert_eq!(sol.status, SolveStatus::MaxIterations);
        assert!(matches!(
            sol.into_optimal(&settings),
            Err(PortfolioError::SolverNonConvergence { .. })
        ));
    }
}
