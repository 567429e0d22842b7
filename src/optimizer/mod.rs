//! Portfolio optimizers.
//!
//! The three methods form a closed set ([`Method`]) and share one capability,
//! [`PortfolioOptimizer::solve`]: given the mean vector, the covariance, the
//! scenario matrix and a validated [`ConstraintSet`], produce a weight
//! vector. Solves are stateless; an optimizer only holds its parameters.

pub mod cvar;
mod formulation;
pub mod mean_variance;
pub mod robust;

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::constraints::ConstraintSet;
use crate::covariance::CovarianceMatrix;
use crate::error::{PortfolioError, Result};

pub use cvar::CvarOptimizer;
pub use mean_variance::MeanVarianceOptimizer;
pub use robust::RobustOptimizer;

/// Optimization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Markowitz minimum variance / maximum Sharpe.
    #[default]
    MeanVariance,
    /// Rockafellar–Uryasev CVaR minimization.
    Cvar,
    /// Worst case over an ellipsoidal mean uncertainty set.
    Robust,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::MeanVariance => "mean_variance",
            Method::Cvar => "cvar",
            Method::Robust => "robust",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a solve reads. Borrowed for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationInputs<'a> {
    /// Expected return per asset.
    pub mean: &'a DVector<f64>,
    /// Asset covariance.
    pub covariance: &'a CovarianceMatrix,
    /// Historical scenarios, `T x N`.
    pub scenarios: &'a DMatrix<f64>,
    /// Validated constraints.
    pub constraints: &'a ConstraintSet,
    /// Target expected return, if any.
    pub target_return: Option<f64>,
    /// CVaR tail probability (0.05 for 95% CVaR).
    pub alpha: f64,
}

impl<'a> OptimizationInputs<'a> {
    /// Bundle inputs after checking that their shapes agree.
    pub fn new(
        mean: &'a DVector<f64>,
        covariance: &'a CovarianceMatrix,
        scenarios: &'a DMatrix<f64>,
        constraints: &'a ConstraintSet,
    ) -> Result<Self> {
        let n = mean.len();
        if covariance.dim() != n {
            return Err(PortfolioError::shape(
                format!("{}x{} covariance", n, n),
                format!("{}x{}", covariance.dim(), covariance.dim()),
            ));
        }
        if scenarios.ncols() != n {
            return Err(PortfolioError::shape(
                format!("{} scenario columns", n),
                format!("{}", scenarios.ncols()),
            ));
        }
        if constraints.num_assets() != n {
            return Err(PortfolioError::shape(
                format!("constraints for {} assets", n),
                format!("{}", constraints.num_assets()),
            ));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(PortfolioError::invalid("mean", "expected returns must be finite"));
        }
        Ok(OptimizationInputs {
            mean,
            covariance,
            scenarios,
            constraints,
            target_return: None,
            alpha: 0.05,
        })
    }

    /// Set the target return.
    pub fn with_target_return(mut self, target: Option<f64>) -> Result<Self> {
        if let Some(t) = target {
            if !t.is_finite() {
                return Err(PortfolioError::invalid("target_return", "must be finite"));
            }
        }
        self.target_return = target;
        Ok(self)
    }

    /// Set the CVaR tail probability.
    pub fn with_alpha(mut self, alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(PortfolioError::invalid(
                "alpha",
                format!("must lie in (0, 1), got {}", alpha),
            ));
        }
        self.alpha = alpha;
        Ok(self)
    }

    /// Number of assets.
    pub fn num_assets(&self) -> usize {
        self.mean.len()
    }

    /// Expected portfolio return `μ' w`.
    pub fn expected_return(&self, weights: &DVector<f64>) -> f64 {
        self.mean.dot(weights)
    }
}

/// Weights produced by one optimizer call, plus solver bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Portfolio weights in asset order.
    pub weights: DVector<f64>,
    /// VaR from the CVaR program (`ζ`), when one was solved.
    pub var: Option<f64>,
    /// Optimal CVaR objective, when one was solved.
    pub cvar: Option<f64>,
    /// Solver iterations summed over every conic solve.
    pub iterations: u32,
    /// Solver time summed over every conic solve, in seconds.
    pub solve_time: f64,
    /// Whether any solve was accepted at reduced accuracy.
    pub reduced_accuracy: bool,
}

/// The common capability of every optimizer.
pub trait PortfolioOptimizer {
    /// Which method this optimizer implements.
    fn method(&self) -> Method;

    /// Solve for portfolio weights.
    fn solve(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation>;
}

/// One optimizer per [`Method`].
#[derive(Debug, Clone)]
pub enum Optimizer {
    MeanVariance(MeanVarianceOptimizer),
    Cvar(CvarOptimizer),
    Robust(RobustOptimizer),
}

impl Optimizer {
    /// Build the optimizer for `method` from engine configuration.
    ///
    /// `uncertainty_radius` only matters for [`Method::Robust`]; when absent
    /// the configured default is used.
    pub fn for_method(
        method: Method,
        config: &EngineConfig,
        uncertainty_radius: Option<f64>,
    ) -> Result<Self> {
        Ok(match method {
            Method::MeanVariance => Optimizer::MeanVariance(MeanVarianceOptimizer::from_config(config)),
            Method::Cvar => Optimizer::Cvar(CvarOptimizer::from_config(config)),
            Method::Robust => Optimizer::Robust(RobustOptimizer::from_config(
                uncertainty_radius.unwrap_or(config.default_uncertainty_radius),
                config,
            )?),
        })
    }
}

impl PortfolioOptimizer for Optimizer {
    fn method(&self) -> Method {
        match self {
            Optimizer::MeanVariance(o) => o.method(),
            Optimizer::Cvar(o) => o.method(),
            Optimizer::Robust(o) => o.method(),
        }
    }

    fn solve(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        match self {
            Optimizer::MeanVariance(o) => o.solve(inputs),
            Optimizer::Cvar(o) => o.solve(inputs),
            Optimizer::Robust(o) => o.solve(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_wire_names() {
        assert_eq!(serde_json::to_string(&Method::MeanVariance).unwrap(), "\"mean_variance\"");
        assert_eq!(serde_json::from_str::<Method>("\"cvar\"").unwrap(), Method::Cvar);
        assert!(serde_json::from_str::<Method>("\"black_litterman\"").is_err());
        assert_eq!(Method::Robust.to_string(), "robust");
    }

    #[test]
    fn test_inputs_shape_checks() {
        let mean = DVector::from_vec(vec![0.01, 0.02]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::identity(3, 3)).unwrap();
        let scenarios = DMatrix::zeros(5, 2);
        let constraints = ConstraintSet::builder(2).build().unwrap();
        assert!(matches!(
            OptimizationInputs::new(&mean, &cov, &scenarios, &constraints),
            Err(PortfolioError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_inputs_alpha_range() {
        let mean = DVector::from_vec(vec![0.01]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::identity(1, 1)).unwrap();
        let scenarios = DMatrix::zeros(5, 1);
        let constraints = ConstraintSet::builder(1).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();
        assert!(inputs.with_alpha(0.0).is_err());
        assert!(inputs.with_alpha(1.0).is_err());
        assert_eq!(inputs.with_alpha(0.01).unwrap().alpha, 0.01);
    }

    #[test]
    fn test_for_method_rejects_negative_radius() {
        let config = EngineConfig::default();
        assert!(Optimizer::for_method(Method::Robust, &config, Some(-0.1)).is_err());
        let opt = Optimizer::for_method(Method::Cvar, &config, None).unwrap();
        assert_eq!(opt.method(), Method::Cvar);
    }
}
