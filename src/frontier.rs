//! Efficient frontier tracing.
//!
//! Targets are spaced evenly between the return of the global
//! minimum-variance (GMV) portfolio and the highest return reachable under
//! the constraints. Each target is an independent minimum-variance solve;
//! with `parallel` on they run on the rayon pool and are collected back in
//! target order.

use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::error::{PortfolioError, Result};
use crate::optimizer::mean_variance::frontier_ceiling;
use crate::optimizer::{Allocation, MeanVarianceOptimizer, OptimizationInputs};

/// Slack allowed when checking a target against the achievable range.
const RANGE_TOL: f64 = 1e-12;

/// One portfolio on the frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontierPoint {
    /// Expected return `μ' w`.
    pub return_value: f64,
    /// Volatility `sqrt(w' Σ w)`.
    pub volatility: f64,
    /// Weights in asset order.
    pub weights: Vec<f64>,
}

impl EfficientFrontierPoint {
    fn from_allocation(inputs: &OptimizationInputs<'_>, allocation: &Allocation) -> Self {
        EfficientFrontierPoint {
            return_value: inputs.expected_return(&allocation.weights),
            volatility: inputs.covariance.volatility(&allocation.weights),
            weights: allocation.weights.iter().copied().collect(),
        }
    }

    /// Weights as a vector.
    pub fn weight_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.weights)
    }
}

/// A traced frontier, ordered by non-decreasing expected return.
#[derive(Debug, Clone, PartialEq)]
pub struct EfficientFrontier {
    pub points: Vec<EfficientFrontierPoint>,
    pub min_variance_return: f64,
    pub min_variance_volatility: f64,
    /// Highest return reachable under the constraints.
    pub max_return: f64,
    /// Solver iterations over every solve of the trace.
    pub iterations: u32,
    /// Solver time over every solve of the trace, in seconds.
    pub solve_time: f64,
    /// Whether any solve was accepted at reduced accuracy.
    pub reduced_accuracy: bool,
}

impl EfficientFrontier {
    /// Point with the highest Sharpe ratio at `risk_free_rate`.
    pub fn max_sharpe_point(&self, risk_free_rate: f64) -> Option<&EfficientFrontierPoint> {
        self.points
            .iter()
            .filter(|p| p.volatility > 0.0)
            .max_by(|a, b| {
                let sa = (a.return_value - risk_free_rate) / a.volatility;
                let sb = (b.return_value - risk_free_rate) / b.volatility;
                sa.total_cmp(&sb)
            })
    }
}

/// The achievable return range under a constraint set.
#[derive(Debug, Clone)]
pub struct ReturnRange {
    /// The GMV portfolio.
    pub min_variance: Allocation,
    pub min_return: f64,
    pub max_return: f64,
    iterations: u32,
    solve_time: f64,
}

/// Sweeps target returns through a [`MeanVarianceOptimizer`].
#[derive(Debug, Clone)]
pub struct EfficientFrontierTracer {
    optimizer: MeanVarianceOptimizer,
    parallel: bool,
}

impl Default for EfficientFrontierTracer {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EfficientFrontierTracer {
    pub fn new(optimizer: MeanVarianceOptimizer) -> Self {
        EfficientFrontierTracer {
            optimizer,
            parallel: true,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        EfficientFrontierTracer {
            optimizer: MeanVarianceOptimizer::from_config(config),
            parallel: config.parallel_frontier,
        }
    }

    /// Solve frontier points on the rayon pool (default) or sequentially.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Returns of the GMV portfolio and of the maximum-return portfolio.
    pub fn return_range(&self, inputs: &OptimizationInputs<'_>) -> Result<ReturnRange> {
        let gmv = self.optimizer.min_variance(inputs, None)?;
        let top = self.optimizer.max_return(inputs)?;
        let min_return = inputs.expected_return(&gmv.weights);
        let max_return = inputs.expected_return(&top.weights).max(min_return);
        Ok(ReturnRange {
            iterations: gmv.iterations + top.iterations,
            solve_time: gmv.solve_time + top.solve_time,
            min_variance: gmv,
            min_return,
            max_return,
        })
    }

    /// Minimum-variance portfolio at `target`.
    ///
    /// Targets below the GMV return lie on the dominated branch and targets
    /// above the maximum return are unreachable; both are rejected.
    pub fn point_at(&self, inputs: &OptimizationInputs<'_>, target: f64) -> Result<EfficientFrontierPoint> {
        let range = self.return_range(inputs)?;
        check_target(target, &range)?;
        let allocation = if target <= range.min_return {
            range.min_variance
        } else {
            let capped = target.min(range.max_return);
            self.optimizer.min_variance(inputs, Some(capped))?
        };
        Ok(EfficientFrontierPoint::from_allocation(inputs, &allocation))
    }

    /// Trace `num_points` portfolios from the GMV portfolio upward.
    #[instrument(skip_all, fields(assets = inputs.num_assets(), num_points = num_points, parallel = self.parallel))]
    pub fn trace(&self, inputs: &OptimizationInputs<'_>, num_points: usize) -> Result<EfficientFrontier> {
        if num_points < 2 {
            return Err(PortfolioError::invalid(
                "num_points",
                format!("a frontier needs at least 2 points, got {}", num_points),
            ));
        }

        let range = self.return_range(inputs)?;
        let gmv_point = EfficientFrontierPoint::from_allocation(inputs, &range.min_variance);
        let mut frontier = EfficientFrontier {
            points: Vec::with_capacity(num_points),
            min_variance_return: gmv_point.return_value,
            min_variance_volatility: gmv_point.volatility,
            max_return: range.max_return,
            iterations: range.iterations,
            solve_time: range.solve_time,
            reduced_accuracy: range.min_variance.reduced_accuracy,
        };

        let width = range.max_return - range.min_return;
        if width <= f64::EPSILON * range.max_return.abs().max(1.0) {
            debug!(return_value = range.min_return, "constraint set admits a single return; frontier is one point");
            frontier.points.push(gmv_point);
            return Ok(frontier);
        }

        let ceiling = frontier_ceiling(range.min_return, range.max_return);
        let step = (ceiling - range.min_return) / (num_points - 1) as f64;
        let targets: Vec<f64> = (1..num_points)
            .map(|i| range.min_return + step * i as f64)
            .collect();

        let solve_target = |target: &f64| self.optimizer.min_variance(inputs, Some(*target));
        let allocations: Vec<Allocation> = if self.parallel {
            targets.par_iter().map(solve_target).collect::<Result<_>>()?
        } else {
            targets.iter().map(solve_target).collect::<Result<_>>()?
        };

        frontier.points.push(gmv_point);
        for allocation in &allocations {
            frontier.iterations += allocation.iterations;
            frontier.solve_time += allocation.solve_time;
            frontier.reduced_accuracy |= allocation.reduced_accuracy;
            frontier
                .points
                .push(EfficientFrontierPoint::from_allocation(inputs, allocation));
        }

        info!(
            points = frontier.points.len(),
            min_return = range.min_return,
            max_return = range.max_return,
            iterations = frontier.iterations,
            "efficient frontier traced"
        );
        Ok(frontier)
    }
}

fn check_target(target: f64, range: &ReturnRange) -> Result<()> {
    let slack = RANGE_TOL * range.max_return.abs().max(1.0);
    if !target.is_finite() || target < range.min_return - slack || target > range.max_return + slack {
        return Err(PortfolioError::InvalidFrontierRange {
            target,
            min: range.min_return,
            max: range.max_return,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintSet;
    use crate::covariance::CovarianceMatrix;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn parts() -> (DVector<f64>, CovarianceMatrix, DMatrix<f64>, ConstraintSet) {
        let mean = DVector::from_vec(vec![0.0004, 0.0008, 0.0012]);
        let cov = CovarianceMatrix::from_matrix(DMatrix::from_row_slice(
            3,
            3,
            &[1e-4, 2e-5, 0.0, 2e-5, 2.5e-4, 3e-5, 0.0, 3e-5, 6e-4],
        ))
        .unwrap();
        (mean, cov, DMatrix::zeros(0, 3), ConstraintSet::builder(3).build().unwrap())
    }

    #[test]
    fn test_trace_is_ordered_and_monotone() {
        let (mean, cov, scenarios, constraints) = parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();
        let frontier = EfficientFrontierTracer::default().trace(&inputs, 12).unwrap();

        assert_eq!(frontier.points.len(), 12);
        for pair in frontier.points.windows(2) {
            assert!(pair[1].return_value >= pair[0].return_value);
            assert!(pair[1].volatility >= pair[0].volatility - 1e-9);
        }
        assert_relative_eq!(frontier.points[0].return_value, frontier.min_variance_return);
        assert!(frontier
            .points
            .iter()
            .all(|p| p.volatility >= frontier.min_variance_volatility - 1e-9));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (mean, cov, scenarios, constraints) = parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();
        let parallel = EfficientFrontierTracer::default().trace(&inputs, 6).unwrap();
        let sequential = EfficientFrontierTracer::default()
            .with_parallel(false)
            .trace(&inputs, 6)
            .unwrap();
        for (p, s) in parallel.points.iter().zip(&sequential.points) {
            assert_relative_eq!(p.return_value, s.return_value, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rejects_dominated_target() {
        let (mean, cov, scenarios, constraints) = parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();
        let tracer = EfficientFrontierTracer::default();
        assert!(matches!(
            tracer.point_at(&inputs, 0.0),
            Err(PortfolioError::InvalidFrontierRange { .. })
        ));
        assert!(matches!(
            tracer.point_at(&inputs, 0.002),
            Err(PortfolioError::InvalidFrontierRange { .. })
        ));
        let point = tracer.point_at(&inputs, 0.0009).unwrap();
        assert_relative_eq!(point.return_value, 0.0009, epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_single_point() {
        let (mean, cov, scenarios, constraints) = parts();
        let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();
        assert!(EfficientFrontierTracer::default().trace(&inputs, 1).is_err());
    }
}
