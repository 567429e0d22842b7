//! Error types for cvxfolio.

use thiserror::Error;

use crate::solver::SolveStatus;

/// Error type for portfolio optimization.
///
/// Every variant names the estimator or parameter that caused it. Nothing in
/// the crate retries on error; relaxing tolerances or switching strategy is a
/// caller decision.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// Too few observations for the requested estimator.
    #[error("Insufficient data for {estimator}: need at least {required} observations, got {actual}")]
    InsufficientData {
        estimator: &'static str,
        required: usize,
        actual: usize,
    },

    /// Parameter out of range (α, κ, λ, weight bounds, ...).
    #[error("Invalid parameter `{parameter}`: {reason}")]
    InvalidParameter { parameter: String, reason: String },

    /// The constraint set has an empty feasible region.
    #[error("Infeasible constraints (`{parameter}`): {reason}")]
    InfeasibleConstraints { parameter: String, reason: String },

    /// The solver stopped without meeting its tolerance.
    #[error("Solver did not converge: status {status:?} after {iterations} iterations")]
    SolverNonConvergence { status: SolveStatus, iterations: u32 },

    /// Requested frontier target outside the achievable return range.
    #[error("Target return {target} outside efficient frontier range [{min}, {max}]")]
    InvalidFrontierRange { target: f64, min: f64, max: f64 },

    /// Too few scenarios for an empirical CVaR.
    #[error("Insufficient scenarios for CVaR: need at least {required}, got {actual}")]
    InsufficientScenarios { required: usize, actual: usize },

    /// Shape mismatch between inputs.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Symbol not present in the return series.
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Numerical error.
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Failure reported by the market data collaborator.
    #[error("Data source error: {0}")]
    DataSource(String),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PortfolioError {
    pub(crate) fn invalid(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        PortfolioError::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn infeasible(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        PortfolioError::InfeasibleConstraints {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        PortfolioError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result type for cvxfolio operations.
pub type Result<T> = std::result::Result<T, PortfolioError>;
