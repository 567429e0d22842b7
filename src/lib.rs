//! # cvxfolio
//!
//! Portfolio optimization on top of the Clarabel conic solver.
//!
//! cvxfolio estimates a covariance matrix from historical returns, assembles
//! the mean-variance, CVaR or robust mean-variance program under a validated
//! constraint set, solves it with Clarabel and reports the weights together
//! with derived risk metrics.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cvxfolio::prelude::*;
//!
//! let source = InMemoryMarketData::new(returns);
//! let engine = PortfolioEngine::new(source);
//!
//! let request = OptimizationRequest::new(symbols, Method::MeanVariance)
//!     .with_weight_bounds(0.0, 0.3);
//! let response = engine.optimize(&request)?;
//!
//! for (symbol, weight) in request.symbols.iter().zip(&response.weights) {
//!     println!("{}: {:.2}%", symbol, weight * 100.0);
//! }
//! ```
//!
//! ## Methods
//!
//! - **Mean-variance**: minimum variance at a target return, or the
//!   maximum-Sharpe portfolio when no target is given
//! - **CVaR**: minimum Conditional Value-at-Risk over historical scenarios
//!   (Rockafellar–Uryasev linearization)
//! - **Robust**: the mean-variance programs with the return replaced by its
//!   worst case over an ellipsoidal uncertainty set around the mean
//!
//! ## Constraints
//!
//! - Budget `Σ w = 1` (always)
//! - Long-only and per-asset bounds
//! - Sector caps
//! - Concentration cap on `Σ w²`
//! - CVaR and volatility caps
//!
//! ## Architecture
//!
//! - **Covariance** estimation with Ledoit–Wolf shrinkage and eigenvalue
//!   stabilization
//! - **Program assembly** into Clarabel's `Ax + s = b, s ∈ K` form
//! - **Native QP** for variance objectives (not SOCP reformulation)
//! - **Frontier** points solved in parallel with rayon

pub mod config;
pub mod constraints;
pub mod covariance;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod frontier;
pub mod optimizer;
pub mod request;
pub mod returns;
pub mod solver;
pub mod sparse;
pub mod stress;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use cvxfolio::prelude::*;
/// ```
pub mod prelude {
    // Engine and boundary types
    pub use crate::engine::PortfolioEngine;
    pub use crate::request::{
        EfficientFrontierRequest, EfficientFrontierResponse, OptimizationRequest,
        OptimizationResponse, SolveMetadata, StressTestRequest, StressTestResponse,
    };

    // Market data
    pub use crate::covariance::{CovarianceEstimator, CovarianceMatrix, CovarianceMethod};
    pub use crate::returns::{InMemoryMarketData, MarketData, ReturnKind, ReturnSeries};

    // Optimizers
    pub use crate::constraints::{ConstraintSet, ConstraintSetBuilder};
    pub use crate::optimizer::{
        Allocation, CvarOptimizer, MeanVarianceOptimizer, Method, OptimizationInputs, Optimizer,
        PortfolioOptimizer, RobustOptimizer,
    };

    // Analysis
    pub use crate::evaluator::{PortfolioMetrics, ResultEvaluator};
    pub use crate::frontier::{EfficientFrontier, EfficientFrontierPoint, EfficientFrontierTracer};
    pub use crate::stress::{StressReport, StressScenario, StressTester};

    // Configuration and errors
    pub use crate::config::EngineConfig;
    pub use crate::error::{PortfolioError, Result};
    pub use crate::solver::{Settings, SolveStatus};
}

// Re-export main types at crate root
pub use config::EngineConfig;
pub use covariance::CovarianceMethod;
pub use engine::PortfolioEngine;
pub use error::{PortfolioError, Result};
pub use optimizer::Method;
pub use request::{OptimizationRequest, OptimizationResponse};
