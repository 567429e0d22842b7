//! Engine configuration.
//!
//! Every tunable of the engine lives in [`EngineConfig`]. It deserializes
//! from JSON with all fields optional:
//!
//! ```
//! use cvxfolio::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "risk_free_rate": 0.0001 }"#).unwrap();
//! assert_eq!(config.min_cvar_scenarios, 30);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PortfolioError, Result};
use crate::solver::Settings;

/// Configuration of the optimization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Solver iteration/time budget and tolerances.
    pub solver: Settings,
    /// Risk-free rate per period, in the same frequency as the returns.
    pub risk_free_rate: f64,
    /// Robust uncertainty radius used when a request does not give one.
    pub default_uncertainty_radius: f64,
    /// Ridge added to an ill-conditioned sample covariance, as a fraction of
    /// its average variance.
    pub default_regularization: f64,
    /// Smallest to largest eigenvalue ratio below which a sample estimate is
    /// replaced by [`CovarianceMethod::Regularized`](crate::CovarianceMethod).
    pub ill_conditioned_ratio: f64,
    /// Observations beyond the asset count after which negligible shrinkage
    /// falls back to the sample estimate.
    pub shrinkage_safety_margin: usize,
    /// Shrinkage intensities below this are negligible.
    pub negligible_shrinkage: f64,
    /// Smallest allowed ratio of smallest to largest covariance eigenvalue
    /// before automatic regularization kicks in.
    pub min_eigenvalue_ratio: f64,
    /// Minimum number of return observations for an empirical CVaR.
    pub min_cvar_scenarios: usize,
    /// Maximum number of symbols in one request.
    pub max_portfolio_size: usize,
    /// Relative width of the return interval at which the max-Sharpe search stops.
    pub sharpe_search_tolerance: f64,
    /// Maximum number of QP solves in the max-Sharpe search.
    pub max_sharpe_iterations: usize,
    /// Solve frontier points on the rayon pool.
    pub parallel_frontier: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            solver: Settings::default(),
            risk_free_rate: 0.0,
            default_uncertainty_radius: 0.1,
            default_regularization: 0.01,
            ill_conditioned_ratio: 1e-6,
            shrinkage_safety_margin: 10,
            negligible_shrinkage: 1e-6,
            min_eigenvalue_ratio: 1e-10,
            min_cvar_scenarios: 30,
            max_portfolio_size: 100,
            sharpe_search_tolerance: 1e-7,
            max_sharpe_iterations: 200,
            parallel_frontier: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| PortfolioError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.default_uncertainty_radius >= 0.0) {
            return Err(PortfolioError::invalid(
                "default_uncertainty_radius",
                "must be >= 0",
            ));
        }
        if !(self.default_regularization > 0.0) {
            return Err(PortfolioError::invalid("default_regularization", "must be > 0"));
        }
        if !(self.ill_conditioned_ratio >= 0.0 && self.ill_conditioned_ratio < 1.0) {
            return Err(PortfolioError::invalid("ill_conditioned_ratio", "must lie in [0, 1)"));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(PortfolioError::invalid("risk_free_rate", "must be finite"));
        }
        if !(self.min_eigenvalue_ratio > 0.0 && self.min_eigenvalue_ratio < 1.0) {
            return Err(PortfolioError::invalid("min_eigenvalue_ratio", "must lie in (0, 1)"));
        }
        if !(self.sharpe_search_tolerance > 0.0) {
            return Err(PortfolioError::invalid("sharpe_search_tolerance", "must be > 0"));
        }
        if self.max_sharpe_iterations < 3 {
            return Err(PortfolioError::invalid("max_sharpe_iterations", "must be >= 3"));
        }
        if self.max_portfolio_size == 0 {
            return Err(PortfolioError::invalid("max_portfolio_size", "must be >= 1"));
        }
        Ok(())
    }

    /// Use a different risk-free rate.
    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    /// Use different solver settings.
    pub fn with_solver(mut self, solver: Settings) -> Self {
        self.solver = solver;
        self
    }

    /// Turn parallel frontier tracing on or off.
    pub fn with_parallel_frontier(mut self, parallel: bool) -> Self {
        self.parallel_frontier = parallel;
        self
    }

    /// Change the CVaR scenario threshold.
    pub fn with_min_cvar_scenarios(mut self, min: usize) -> Self {
        self.min_cvar_scenarios = min;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "risk_free_rate": 0.0002, "solver": { "max_iter": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.risk_free_rate, 0.0002);
        assert_eq!(config.solver.max_iter, 50);
        assert_eq!(config.solver.tol_gap_abs, 1e-8);
        assert_eq!(config.max_portfolio_size, 100);
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig::default().with_parallel_frontier(false);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_regularization() {
        let err = EngineConfig::from_json_str(r#"{ "default_regularization": 0.0 }"#).unwrap_err();
        assert!(err.to_string().contains("default_regularization"));
        let err = EngineConfig::from_json_str(r#"{ "ill_conditioned_ratio": 1.5 }"#).unwrap_err();
        assert!(err.to_string().contains("ill_conditioned_ratio"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(PortfolioError::Config(_))
        ));
    }
}
