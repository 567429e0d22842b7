//! The weight program shared by every optimizer.
//!
//! Daily returns and variances are tiny numbers (1e-4 to 1e-3), well below
//! the solver's absolute tolerances. Every block of the program is therefore
//! expressed in rescaled units: risk rows are multiplied by
//! `1/sqrt(avg variance)`, return rows by `1/max|μ|` and scenario rows by
//! `1/max|r|`. Weights themselves are never rescaled.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::{Allocation, OptimizationInputs};
use crate::error::{PortfolioError, Result};
use crate::solver::{self, AffineRow, ConicProgram, Settings, VarBlock};

/// Unit changes applied to the program blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scaling {
    /// Multiplies `R w` (volatility units).
    pub risk: f64,
    /// Multiplies `μ' w`.
    pub ret: f64,
    /// Multiplies scenario losses.
    pub scenario: f64,
}

impl Scaling {
    pub fn new(inputs: &OptimizationInputs<'_>) -> Self {
        let avg = inputs.covariance.average_variance();
        Scaling {
            risk: if avg > 0.0 && avg.is_finite() { 1.0 / avg.sqrt() } else { 1.0 },
            ret: unit_scale(inputs.mean.iter()),
            scenario: unit_scale(inputs.scenarios.iter()),
        }
    }
}

fn unit_scale<'v>(values: impl Iterator<Item = &'v f64>) -> f64 {
    let max = values.fold(0.0_f64, |m, v| m.max(v.abs()));
    if max > 0.0 && max.is_finite() {
        1.0 / max
    } else {
        1.0
    }
}

/// Rockafellar–Uryasev auxiliaries: `ζ` and the objective
/// `ζ + Σ uₜ / (αT)`, both in scenario units.
#[derive(Debug, Clone)]
pub(crate) struct CvarEpigraph {
    pub zeta: usize,
    pub objective: AffineRow,
}

/// Portfolio weights `w` with the constraint set and risk caps applied.
pub(crate) struct WeightProgram<'a> {
    pub program: ConicProgram,
    pub w: VarBlock,
    pub scale: Scaling,
    inputs: OptimizationInputs<'a>,
    min_scenarios: usize,
    cvar: Option<CvarEpigraph>,
}

impl<'a> WeightProgram<'a> {
    pub fn new(inputs: &OptimizationInputs<'a>, min_scenarios: usize) -> Result<Self> {
        let mut program = ConicProgram::new();
        let w = program.add_variables(inputs.num_assets());
        inputs.constraints.apply(&mut program, w);

        let mut wp = WeightProgram {
            program,
            w,
            scale: Scaling::new(inputs),
            inputs: *inputs,
            min_scenarios: min_scenarios.max(1),
            cvar: None,
        };

        if let Some(vol) = inputs.constraints.volatility_max() {
            let mut rows = vec![AffineRow::constant(wp.scale.risk * vol)];
            rows.extend(wp.risk_rows());
            wp.program.second_order(rows);
        }

        if let Some(cap) = inputs.constraints.cvar_max() {
            let epigraph = wp.cvar_epigraph()?;
            let row = epigraph.objective.scaled(-1.0).plus(wp.scale.scenario * cap);
            wp.program.nonneg(row);
        }

        Ok(wp)
    }

    /// Rows of `R̃ w` where `R̃' R̃ = scale.risk² Σ`.
    pub fn risk_rows(&self) -> Vec<AffineRow> {
        let factor = self.inputs.covariance.risk_factor();
        (0..factor.nrows())
            .map(|k| {
                AffineRow::new().terms(
                    self.w
                        .columns()
                        .enumerate()
                        .map(|(j, col)| (col, self.scale.risk * factor[(k, j)]))
                        .filter(|&(_, c)| c != 0.0),
                )
            })
            .collect()
    }

    /// `scale.ret * μ' w`.
    pub fn expected_return_row(&self) -> AffineRow {
        AffineRow::new().terms(
            self.w
                .columns()
                .enumerate()
                .map(|(j, col)| (col, self.scale.ret * self.inputs.mean[j])),
        )
    }

    /// Minimize `scale.risk² w' Σ w`.
    pub fn add_variance_objective(&mut self) {
        let scaled: DMatrix<f64> = self.inputs.covariance.matrix() * self.scale.risk.powi(2);
        self.program.add_quadratic(self.w, &scaled);
    }

    /// Constrain `μ' w == target`.
    pub fn require_return_equal(&mut self, target: f64) {
        let row = self.expected_return_row().plus(-self.scale.ret * target);
        self.program.equal_zero(row);
    }

    /// Constrain `μ' w >= target`.
    pub fn require_return_at_least(&mut self, target: f64) {
        let row = self.expected_return_row().plus(-self.scale.ret * target);
        self.program.nonneg(row);
    }

    /// The CVaR epigraph, created on first use.
    pub fn cvar_epigraph(&mut self) -> Result<CvarEpigraph> {
        let epigraph = match self.cvar.take() {
            Some(existing) => existing,
            None => self.build_cvar_epigraph()?,
        };
        Ok(self.cvar.insert(epigraph).clone())
    }

    fn build_cvar_epigraph(&mut self) -> Result<CvarEpigraph> {
        let scenarios = self.inputs.scenarios;
        let t = scenarios.nrows();
        if t < self.min_scenarios {
            return Err(PortfolioError::InsufficientScenarios {
                required: self.min_scenarios,
                actual: t,
            });
        }

        let ss = self.scale.scenario;
        let zeta = self.program.add_variables(1).at(0);
        let u = self.program.add_variables(t);
        for s in 0..t {
            self.program.nonneg(AffineRow::new().term(u.at(s), 1.0));
            // uₜ >= loss_t - ζ with loss_t = -rₜ' w
            let row = AffineRow::new()
                .term(u.at(s), 1.0)
                .term(zeta, 1.0)
                .terms(
                    self.w
                        .columns()
                        .enumerate()
                        .map(|(j, col)| (col, ss * scenarios[(s, j)]))
                        .filter(|&(_, c)| c != 0.0),
                );
            self.program.nonneg(row);
        }

        let tail_weight = 1.0 / (self.inputs.alpha * t as f64);
        let objective = AffineRow::new()
            .term(zeta, 1.0)
            .terms(u.columns().map(|col| (col, tail_weight)));
        Ok(CvarEpigraph { zeta, objective })
    }

    /// Solve and read the weights back, projected onto the bounds.
    pub fn solve(self, settings: &Settings) -> Result<Allocation> {
        let stuffed = self.program.stuff();
        debug!(
            variables = self.program.num_vars(),
            rows = stuffed.cone_dims.total(),
            socs = stuffed.cone_dims.soc.len(),
            "solving weight program"
        );
        let solution = solver::solve(&stuffed, settings)?.into_optimal(settings)?;

        let raw = DVector::from_column_slice(self.w.slice(&solution.x));
        let weights = self.inputs.constraints.project(&raw);
        let ss = self.scale.scenario;
        let (var, cvar) = match &self.cvar {
            Some(e) => (
                Some(solution.x[e.zeta] / ss),
                Some(e.objective.eval(&solution.x) / ss),
            ),
            None => (None, None),
        };

        Ok(Allocation {
            weights,
            var,
            cvar,
            iterations: solution.iterations,
            solve_time: solution.solve_time,
            reduced_accuracy: solution.is_reduced_accuracy(),
        })
    }
}

/// Re-attribute a solver infeasibility certificate to `parameter`.
pub(crate) fn blame(err: PortfolioError, parameter: &str) -> PortfolioError {
    match err {
        PortfolioError::InfeasibleConstraints { reason, .. } => PortfolioError::InfeasibleConstraints {
            parameter: parameter.to_string(),
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintSet;
    use crate::covariance::CovarianceMatrix;

    #[test]
    fn test_scaling_normalizes_magnitudes() {
        let mean = DVector::from_vec(vec![0.0004, -0.0008]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::from_diagonal(&DVector::from_vec(vec![1e-4, 3e-4]))).unwrap();
        let scenarios = DMatrix::from_row_slice(2, 2, &[0.01, -0.02, 0.005, 0.0]);
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let scale = Scaling::new(&inputs);
        assert!((scale.ret - 1250.0).abs() < 1e-9);
        assert!((scale.scenario - 50.0).abs() < 1e-9);
        assert!((scale.risk - 1.0 / 2e-4_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_zero_inputs_keep_unit_scale() {
        assert_eq!(unit_scale([0.0, 0.0].iter()), 1.0);
        assert_eq!(unit_scale(std::iter::empty()), 1.0);
    }

    #[test]
    fn test_epigraph_is_built_once() {
        let mean = DVector::from_vec(vec![0.01]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::identity(1, 1)).unwrap();
        let scenarios = DMatrix::from_element(4, 1, 0.01);
        let constraints = ConstraintSet::builder(1).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let mut wp = WeightProgram::new(&inputs, 1).unwrap();
        let first = wp.cvar_epigraph().unwrap();
        let vars = wp.program.num_vars();
        let second = wp.cvar_epigraph().unwrap();
        assert_eq!(first.zeta, second.zeta);
        assert_eq!(wp.program.num_vars(), vars);
        assert_eq!(vars, 1 + 1 + 4);
    }

    #[test]
    fn test_epigraph_requires_scenarios() {
        let mean = DVector::from_vec(vec![0.01]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::identity(1, 1)).unwrap();
        let scenarios = DMatrix::from_element(4, 1, 0.01);
        let constraints = ConstraintSet::builder(1).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let mut wp = WeightProgram::new(&inputs, 30).unwrap();
        assert!(matches!(
            wp.cvar_epigraph(),
            Err(PortfolioError::InsufficientScenarios { required: 30, actual: 4 })
        ));
    }
}
