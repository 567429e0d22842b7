//! Markowitz mean-variance optimization.
//!
//! With a target return this is the classic quadratic program
//!
//! ```text
//! minimize    w' Σ w
//! subject to  μ' w = target,  constraints(w)
//! ```
//!
//! Without a target it returns the maximum Sharpe ratio portfolio. The Sharpe
//! ratio is quasi-concave along the efficient frontier, so a golden-section
//! search over the target return (one QP per step) finds the tangency
//! portfolio under any convex constraint set, including caps that rule out
//! the closed-form Σ⁻¹(μ - r_f) solution.

use tracing::{debug, instrument, warn};

use super::formulation::{blame, WeightProgram};
use super::{Allocation, Method, OptimizationInputs, PortfolioOptimizer};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::solver::Settings;

/// Fraction of the `[r_gmv, r_max]` interval kept clear of the top end.
///
/// At exactly `r_max` the feasible set can collapse to a single face and
/// interior-point solvers lose accuracy.
const FRONTIER_EDGE: f64 = 1e-6;

/// Highest target return the frontier and the Sharpe search will ask for.
pub(crate) fn frontier_ceiling(min_return: f64, max_return: f64) -> f64 {
    max_return - FRONTIER_EDGE * (max_return - min_return)
}

/// Mean-variance optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanVarianceOptimizer {
    settings: Settings,
    search: SharpeSearch,
    min_scenarios: usize,
}

impl Default for MeanVarianceOptimizer {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl MeanVarianceOptimizer {
    /// Create an optimizer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take solver settings, risk-free rate and search parameters from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        MeanVarianceOptimizer {
            settings: config.solver.clone(),
            search: SharpeSearch::from_config(config),
            min_scenarios: config.min_cvar_scenarios,
        }
    }

    /// Use a different risk-free rate for the Sharpe search.
    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.search.risk_free_rate = rate;
        self
    }

    /// Use different solver settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Solver settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Minimum-variance portfolio, optionally at an exact target return.
    ///
    /// With `target = None` this is the global minimum-variance (GMV)
    /// portfolio.
    pub fn min_variance(&self, inputs: &OptimizationInputs<'_>, target: Option<f64>) -> Result<Allocation> {
        let mut wp = WeightProgram::new(inputs, self.min_scenarios)?;
        wp.add_variance_objective();
        match target {
            Some(t) => {
                wp.require_return_equal(t);
                wp.solve(&self.settings).map_err(|e| blame(e, "target_return"))
            }
            None => wp.solve(&self.settings),
        }
    }

    /// Highest expected return reachable under the constraints.
    pub fn max_return(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        let mut wp = WeightProgram::new(inputs, self.min_scenarios)?;
        let objective = wp.expected_return_row().scaled(-1.0);
        wp.program.add_linear_row(&objective);
        wp.solve(&self.settings)
    }

    /// Sharpe ratio `(μ' w - r_f) / σ(w)`.
    pub fn sharpe_ratio(&self, inputs: &OptimizationInputs<'_>, allocation: &Allocation) -> f64 {
        let excess = inputs.expected_return(&allocation.weights) - self.search.risk_free_rate;
        let vol = inputs.covariance.volatility(&allocation.weights);
        excess / vol.max(f64::MIN_POSITIVE)
    }

    /// Maximum Sharpe ratio portfolio.
    ///
    /// Falls back to the GMV portfolio when no feasible portfolio earns more
    /// than the risk-free rate.
    #[instrument(skip_all, fields(assets = inputs.num_assets(), risk_free_rate = self.search.risk_free_rate))]
    pub fn max_sharpe(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        let gmv = self.min_variance(inputs, None)?;
        let top = self.max_return(inputs)?;
        let mut cost = SearchCost::default();
        cost.add(&gmv);
        cost.add(&top);

        let r_min = inputs.expected_return(&gmv.weights);
        let r_max = inputs.expected_return(&top.weights);
        let start = (self.sharpe_ratio(inputs, &gmv), gmv);
        self.search.run(start, r_min, r_max, cost, |target| {
            let alloc = self.min_variance(inputs, Some(target))?;
            Ok((self.sharpe_ratio(inputs, &alloc), alloc))
        })
    }
}

/// Golden-section search for the best-scoring portfolio along a frontier.
///
/// The frontier is parameterized by a return level between the GMV
/// portfolio's and the highest reachable one; each step solves for the
/// portfolio at one level and scores it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SharpeSearch {
    pub risk_free_rate: f64,
    pub tolerance: f64,
    pub max_steps: usize,
}

impl SharpeSearch {
    pub fn from_config(config: &EngineConfig) -> Self {
        SharpeSearch {
            risk_free_rate: config.risk_free_rate,
            tolerance: config.sharpe_search_tolerance,
            max_steps: config.max_sharpe_iterations,
        }
    }

    /// Search `[r_min, frontier_ceiling(r_min, r_max)]` starting from the
    /// scored GMV portfolio. `cost` carries the solves done before the search.
    pub fn run<P>(
        &self,
        gmv: (f64, Allocation),
        r_min: f64,
        r_max: f64,
        mut cost: SearchCost,
        mut solve_at: P,
    ) -> Result<Allocation>
    where
        P: FnMut(f64) -> Result<(f64, Allocation)>,
    {
        if r_max <= self.risk_free_rate {
            warn!(
                max_return = r_max,
                risk_free_rate = self.risk_free_rate,
                "no feasible portfolio beats the risk-free rate; using the minimum-variance portfolio"
            );
            return Ok(cost.charge(gmv.1));
        }
        if r_max - r_min <= f64::EPSILON * r_max.abs().max(1.0) {
            debug!(r_min, r_max, "degenerate frontier; minimum-variance portfolio is the tangency portfolio");
            return Ok(cost.charge(gmv.1));
        }

        let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
        let tolerance = self.tolerance * (r_max - r_min);
        let mut a = r_min;
        let mut b = frontier_ceiling(r_min, r_max);

        let mut scored = |target: f64, cost: &mut SearchCost| -> Result<(f64, Allocation)> {
            let (score, alloc) = solve_at(target)?;
            cost.add(&alloc);
            Ok((score, alloc))
        };

        let mut best = gmv;
        let mut c = b - inv_phi * (b - a);
        let mut d = a + inv_phi * (b - a);
        let mut fc = scored(c, &mut cost)?;
        let mut fd = scored(d, &mut cost)?;
        let mut steps = 2;

        while b - a > tolerance {
            if steps >= self.max_steps {
                warn!(steps, width = b - a, "Sharpe search hit its step limit; returning best portfolio found");
                break;
            }
            if fc.0 >= fd.0 {
                b = d;
                d = c;
                c = b - inv_phi * (b - a);
                let next = scored(c, &mut cost)?;
                keep_best(&mut best, std::mem::replace(&mut fd, std::mem::replace(&mut fc, next)));
            } else {
                a = c;
                c = d;
                d = a + inv_phi * (b - a);
                let next = scored(d, &mut cost)?;
                keep_best(&mut best, std::mem::replace(&mut fc, std::mem::replace(&mut fd, next)));
            }
            steps += 1;
        }
        keep_best(&mut best, fc);
        keep_best(&mut best, fd);

        debug!(steps, sharpe = best.0, "Sharpe search converged");
        Ok(cost.charge(best.1))
    }
}

fn keep_best(best: &mut (f64, Allocation), candidate: (f64, Allocation)) {
    if candidate.0 > best.0 {
        *best = candidate;
    }
}

/// Solver effort summed over the steps of a search.
#[derive(Debug, Default)]
pub(crate) struct SearchCost {
    iterations: u32,
    solve_time: f64,
    reduced_accuracy: bool,
}

impl SearchCost {
    pub fn add(&mut self, alloc: &Allocation) {
        self.iterations += alloc.iterations;
        self.solve_time += alloc.solve_time;
        self.reduced_accuracy |= alloc.reduced_accuracy;
    }

    fn charge(self, alloc: Allocation) -> Allocation {
        Allocation {
            iterations: self.iterations,
            solve_time: self.solve_time,
            reduced_accuracy: self.reduced_accuracy,
            ..alloc
        }
    }
}

impl PortfolioOptimizer for MeanVarianceOptimizer {
    fn method(&self) -> Method {
        Method::MeanVariance
    }

    fn solve(&self, inputs: &OptimizationInputs<'_>) -> Result<Allocation> {
        match inputs.target_return {
            Some(target) => self.min_variance(inputs, Some(target)),
            None => self.max_sharpe(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintSet;
    use crate::covariance::CovarianceMatrix;
    use crate::error::PortfolioError;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    fn two_assets() -> (DVector<f64>, CovarianceMatrix, DMatrix<f64>) {
        let mean = DVector::from_vec(vec![0.0005, 0.0010]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::from_row_slice(
            2,
            2,
            &[1e-4, 0.0, 0.0, 4e-4],
        ))
        .unwrap();
        (mean, cov, DMatrix::zeros(0, 2))
    }

    #[test]
    fn test_gmv_two_uncorrelated_assets() {
        // w ∝ 1/σ²: [1e4, 2.5e3] / 1.25e4 = [0.8, 0.2]
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let gmv = MeanVarianceOptimizer::new().min_variance(&inputs, None).unwrap();
        assert_relative_eq!(gmv.weights[0], 0.8, epsilon = 1e-5);
        assert_relative_eq!(gmv.weights[1], 0.2, epsilon = 1e-5);
        assert_relative_eq!(gmv.weights.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_target_return_is_met() {
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let alloc = MeanVarianceOptimizer::new().min_variance(&inputs, Some(0.00075)).unwrap();
        assert_relative_eq!(inputs.expected_return(&alloc.weights), 0.00075, epsilon = 1e-8);
        assert_relative_eq!(alloc.weights[0], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_unreachable_target_blames_target() {
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let err = MeanVarianceOptimizer::new().min_variance(&inputs, Some(0.01)).unwrap_err();
        assert!(matches!(
            err,
            PortfolioError::InfeasibleConstraints { ref parameter, .. } if parameter == "target_return"
        ));
    }

    #[test]
    fn test_max_return_picks_best_asset() {
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).weight_bounds(0.0, 0.7).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let alloc = MeanVarianceOptimizer::new().max_return(&inputs).unwrap();
        assert_relative_eq!(alloc.weights[1], 0.7, epsilon = 1e-6);
        assert_relative_eq!(alloc.weights[0], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_max_sharpe_matches_tangency() {
        // Uncorrelated: w ∝ Σ⁻¹μ = [5, 2.5] -> [2/3, 1/3]
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let alloc = MeanVarianceOptimizer::new().max_sharpe(&inputs).unwrap();
        assert_relative_eq!(alloc.weights[0], 2.0 / 3.0, epsilon = 1e-3);
        assert_relative_eq!(alloc.weights[1], 1.0 / 3.0, epsilon = 1e-3);
        assert!(alloc.iterations > 0);
    }

    #[test]
    fn test_max_sharpe_falls_back_to_gmv() {
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

        let optimizer = MeanVarianceOptimizer::new().with_risk_free_rate(0.002);
        let alloc = optimizer.max_sharpe(&inputs).unwrap();
        assert_relative_eq!(alloc.weights[0], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_solve_dispatches_on_target() {
        let (mean, cov, scenarios) = two_assets();
        let constraints = ConstraintSet::builder(2).build().unwrap();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints)
            .unwrap()
            .with_target_return(Some(0.0006))
            .unwrap();
        let alloc = MeanVarianceOptimizer::new().solve(&inputs).unwrap();
        assert_relative_eq!(inputs.expected_return(&alloc.weights), 0.0006, epsilon = 1e-8);
    }
}
