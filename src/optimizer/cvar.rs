//! Conditional Value at Risk minimization.
//!
//! Rockafellar–Uryasev linear program over `T` historical scenarios with
//! tail probability `α`:
//!
//! ```text
//! minimize    ζ + 1/(αT) Σₜ uₜ
//! subject to  uₜ >= -rₜ' w - ζ,  uₜ >= 0
//!             μ' w >= target (optional),  constraints(w)
//! ```
//!
//! At the optimum `ζ` is the empirical VaR and the objective the empirical
//! CVaR of the portfolio.

use tracing::instrument;

use super::formulation::{blame, WeightProgram};
use super::{Allocation, Method, OptimizationInputs, PortfolioOptimizer};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::solver::Settings;

/// CVaR optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct CvarOptimizer {
    settings: Settings,
    min_scenarios: usize,
}

impl Default for CvarOptimizer {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl CvarOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        CvarOptimizer {
            settings: config.solver.clone(),
            min_scenarios: config.min_cvar_scenarios,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Minimum number of scenarios accepted.
    pub fn with_min_scenarios(mut self, min: usize) -> Self {
        self.min_scenarios = min;
        self
    }
}

impl PortfolioOptimizer for CvarOptimizer {
    fn method(&self) -> Method {
        Method::Cvar
    }

    #[instrument(skip_all, fields(scenarios = inputs.scenarios.nrows(), alpha = inputs.alpha))]
    fn solve(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        let mut wp = WeightProgram::new(inputs, self.min_scenarios)?;
        let epigraph = wp.cvar_epigraph()?;
        wp.program.add_linear_row(&epigraph.objective);

        match inputs.target_return {
            Some(target) => {
                wp.require_return_at_least(target);
                wp.solve(&self.settings).map_err(|e| blame(e, "target_return"))
            }
            None => wp.solve(&self.settings),
        }
    }
}
