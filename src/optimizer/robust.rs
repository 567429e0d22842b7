//! Robust mean-variance optimization.
//!
//! The expected returns are only known up to an ellipsoid
//! `{ μ + κ L u : ||u|| <= 1 }` with `L L' = Σ`. The worst-case return of
//! a portfolio over that set is `μ' w - κ ||R w||`, a concave function, so
//! every program below is a second-order cone program:
//!
//! * with a target: minimize `w' Σ w` subject to
//!   `μ' w - κ ||R w|| >= target`;
//! * without one: maximize the worst-case Sharpe ratio
//!   `(μ' w - κ σ(w) - r_f) / σ(w)` with the same golden-section search the
//!   mean-variance optimizer uses, probing the worst-case frontier between
//!   the GMV portfolio and the portfolio of highest worst-case return.
//!
//! With `κ = 0` both modes reduce to the mean-variance programs. Because the
//! ellipsoid has the shape of `Σ`, the worst-case Sharpe ratio is the nominal
//! one minus `κ`: the tangency portfolio is kept while its Sharpe ratio
//! exceeds `κ`, and the GMV portfolio is returned once it does not.

use nalgebra::DVector;
use tracing::{debug, instrument};

use super::formulation::{blame, WeightProgram};
use super::mean_variance::{SearchCost, SharpeSearch};
use super::{Allocation, Method, OptimizationInputs, PortfolioOptimizer};
use crate::config::EngineConfig;
use crate::error::{PortfolioError, Result};
use crate::solver::{AffineRow, Settings};

/// Robust optimizer with uncertainty radius `κ`.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustOptimizer {
    uncertainty_radius: f64,
    settings: Settings,
    search: SharpeSearch,
    min_scenarios: usize,
}

impl RobustOptimizer {
    /// Create a robust optimizer. `κ` must be finite and non-negative.
    pub fn new(uncertainty_radius: f64) -> Result<Self> {
        Self::from_config(uncertainty_radius, &EngineConfig::default())
    }

    /// Take solver settings, risk-free rate and search parameters from `config`.
    pub fn from_config(uncertainty_radius: f64, config: &EngineConfig) -> Result<Self> {
        if !(uncertainty_radius.is_finite() && uncertainty_radius >= 0.0) {
            return Err(PortfolioError::invalid(
                "uncertainty_radius",
                format!("must be finite and >= 0, got {}", uncertainty_radius),
            ));
        }
        Ok(RobustOptimizer {
            uncertainty_radius,
            settings: config.solver.clone(),
            search: SharpeSearch::from_config(config),
            min_scenarios: config.min_cvar_scenarios,
        })
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_min_scenarios(mut self, min: usize) -> Self {
        self.min_scenarios = min;
        self
    }

    /// Use a different risk-free rate for the worst-case Sharpe search.
    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.search.risk_free_rate = rate;
        self
    }

    pub fn uncertainty_radius(&self) -> f64 {
        self.uncertainty_radius
    }

    /// Worst-case expected return of `weights` over the uncertainty set.
    pub fn worst_case_return(&self, inputs: &OptimizationInputs<'_>, weights: &DVector<f64>) -> f64 {
        inputs.expected_return(weights) - self.uncertainty_radius * inputs.covariance.volatility(weights)
    }

    /// Worst-case Sharpe ratio `(μ' w - κ σ(w) - r_f) / σ(w)`.
    pub fn worst_case_sharpe(&self, inputs: &OptimizationInputs<'_>, weights: &DVector<f64>) -> f64 {
        let excess = self.worst_case_return(inputs, weights) - self.search.risk_free_rate;
        excess / inputs.covariance.volatility(weights).max(f64::MIN_POSITIVE)
    }

    /// Minimum-variance portfolio whose worst-case return reaches `target`.
    ///
    /// Without a target this is the GMV portfolio.
    pub fn min_variance(&self, inputs: &OptimizationInputs<'_>, target: Option<f64>) -> Result<Allocation> {
        let kappa = self.uncertainty_radius;
        let mut wp = WeightProgram::new(inputs, self.min_scenarios)?;
        wp.add_variance_objective();
        let Some(target) = target else {
            return wp.solve(&self.settings);
        };
        if kappa > 0.0 {
            // κ ||R w|| in return units, expressed on the scaled risk rows.
            let penalty = kappa * wp.scale.ret / wp.scale.risk;
            let head = wp.expected_return_row().plus(-wp.scale.ret * target);
            let mut rows = vec![head];
            rows.extend(wp.risk_rows().into_iter().map(|r| r.scaled(penalty)));
            wp.program.second_order(rows);
        } else {
            wp.require_return_at_least(target);
        }
        wp.solve(&self.settings).map_err(|e| blame(e, "target_return"))
    }

    /// Portfolio with the highest worst-case return `μ' w - κ ||R w||`.
    pub fn max_worst_case_return(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        let kappa = self.uncertainty_radius;
        let mut wp = WeightProgram::new(inputs, self.min_scenarios)?;
        let objective = wp.expected_return_row().scaled(-1.0);
        wp.program.add_linear_row(&objective);
        if kappa > 0.0 {
            let penalty = kappa * wp.scale.ret / wp.scale.risk;
            let t = wp.program.add_variables(1).at(0);
            wp.program.add_linear(t, penalty);
            let mut rows = vec![AffineRow::new().term(t, 1.0)];
            rows.extend(wp.risk_rows());
            wp.program.second_order(rows);
        }
        wp.solve(&self.settings)
    }

    /// Portfolio with the highest worst-case Sharpe ratio.
    ///
    /// Falls back to the GMV portfolio when no feasible portfolio has a
    /// worst-case return above the risk-free rate.
    #[instrument(skip_all, fields(kappa = self.uncertainty_radius, risk_free_rate = self.search.risk_free_rate))]
    pub fn max_worst_case_sharpe(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        let gmv = self.min_variance(inputs, None)?;
        let top = self.max_worst_case_return(inputs)?;
        let mut cost = SearchCost::default();
        cost.add(&gmv);
        cost.add(&top);

        let r_min = self.worst_case_return(inputs, &gmv.weights);
        let r_max = self.worst_case_return(inputs, &top.weights);
        debug!(r_min, r_max, "worst-case return range");
        let start = (self.worst_case_sharpe(inputs, &gmv.weights), gmv);
        self.search.run(start, r_min, r_max, cost, |target| {
            let alloc = self.min_variance(inputs, Some(target))?;
            Ok((self.worst_case_sharpe(inputs, &alloc.weights), alloc))
        })
    }
}

impl PortfolioOptimizer for RobustOptimizer {
    fn method(&self) -> Method {
        Method::Robust
    }

    #[instrument(skip_all, fields(kappa = self.uncertainty_radius, target = ?inputs.target_return))]
    fn solve(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        match inputs.target_return {
            Some(target) => self.min_variance(inputs, Some(target)),
            None => self.max_worst_case_sharpe(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintSet;
    use crate::covariance::CovarianceMatrix;
    use crate::optimizer::MeanVarianceOptimizer;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    // Uncorrelated, both assets at Sharpe 0.05: tangency [2/3, 1/3] with
    // Sharpe sqrt(0.005) ≈ 0.0707, GMV [0.8, 0.2].
    fn inputs_parts() -> (DVector<f64>, CovarianceMatrix, DMatrix<f64>, ConstraintSet) {
        let mean = DVector::from_vec(vec![0.0005, 0.0010]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::from_row_slice(2, 2, &[1e-4, 0.0, 0.0, 4e-4])).unwrap();
        (mean, cov, DMatrix::zeros(0, 2), ConstraintSet::builder(2).build().unwrap())
    }

    #[test]
    fn test_rejects_negative_radius() {
        assert!(matches!(
            RobustOptimizer::new(-0.5),
            Err(PortfolioError::InvalidParameter { .. })
        ));
        assert!(RobustOptimizer::new(f64::NAN).is_err());
    }

    #[test]
    fn test_worst_case_target_holds() {
        let (mean, cov, scenarios, constraints) = inputs_parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints)
            .unwrap()
            .with_target_return(Some(0.0))
            .unwrap();
        let optimizer = RobustOptimizer::new(0.05).unwrap();
        let alloc = optimizer.solve(&inputs).unwrap();
        assert!(optimizer.worst_case_return(&inputs, &alloc.weights) >= -1e-8);
        assert_relative_eq!(alloc.weights.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_radius_without_target_is_max_sharpe() {
        let (mean, cov, scenarios, constraints) = inputs_parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let robust = RobustOptimizer::new(0.0).unwrap().solve(&inputs).unwrap();
        let mv = MeanVarianceOptimizer::new().solve(&inputs).unwrap();
        assert_relative_eq!(robust.weights[0], 2.0 / 3.0, epsilon = 1e-3);
        assert_relative_eq!(robust.weights[1], 1.0 / 3.0, epsilon = 1e-3);
        for (r, m) in robust.weights.iter().zip(mv.weights.iter()) {
            assert_relative_eq!(r, m, epsilon = 1e-3);
        }
        assert!(robust.iterations > 0);
    }

    #[test]
    fn test_small_radius_keeps_tangency() {
        let (mean, cov, scenarios, constraints) = inputs_parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let optimizer = RobustOptimizer::new(0.03).unwrap();
        let alloc = optimizer.solve(&inputs).unwrap();
        assert_relative_eq!(alloc.weights[0], 2.0 / 3.0, epsilon = 2e-3);
        let sharpe = optimizer.worst_case_sharpe(&inputs, &alloc.weights);
        assert_relative_eq!(sharpe, 0.005_f64.sqrt() - 0.03, epsilon = 1e-5);
    }

    #[test]
    fn test_large_radius_moves_toward_low_risk() {
        let (mean, cov, scenarios, constraints) = inputs_parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let nominal = RobustOptimizer::new(0.0).unwrap().solve(&inputs).unwrap();
        let cautious = RobustOptimizer::new(0.1).unwrap().solve(&inputs).unwrap();
        assert_relative_eq!(cautious.weights[0], 0.8, epsilon = 1e-5);
        assert!(cautious.weights[0] > nominal.weights[0] + 0.1);
        assert!(cov.volatility(&cautious.weights) < cov.volatility(&nominal.weights));
    }

    #[test]
    fn test_max_worst_case_return_leans_to_low_risk() {
        let (mean, cov, scenarios, constraints) = inputs_parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let nominal = RobustOptimizer::new(0.0).unwrap().max_worst_case_return(&inputs).unwrap();
        assert_relative_eq!(nominal.weights[1], 1.0, epsilon = 1e-6);
        let cautious = RobustOptimizer::new(1.0).unwrap().max_worst_case_return(&inputs).unwrap();
        assert!(cov.volatility(&cautious.weights) < cov.volatility(&nominal.weights));
    }
}
