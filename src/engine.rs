//! The optimization engine.
//!
//! [`PortfolioEngine`] turns boundary requests into results: it fetches
//! returns from its [`MarketData`] source, estimates the covariance, builds
//! the validated constraint set, dispatches to the optimizer named by the
//! request and evaluates the resulting weights. The `*_with` variants take
//! the data directly and never touch the source.

use std::collections::HashMap;

use nalgebra::DVector;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::constraints::ConstraintSet;
use crate::covariance::{CovarianceEstimator, CovarianceMatrix, CovarianceMethod};
use crate::error::{PortfolioError, Result};
use crate::evaluator::ResultEvaluator;
use crate::frontier::EfficientFrontierTracer;
use crate::optimizer::{Method, OptimizationInputs, Optimizer, PortfolioOptimizer};
use crate::request::{
    EfficientFrontierRequest, EfficientFrontierResponse, OptimizationRequest, OptimizationResponse,
    SolveMetadata, StressTestRequest, StressTestResponse,
};
use crate::returns::{MarketData, ReturnSeries};
use crate::stress::StressTester;

/// Returns aligned to a request, with their moments.
struct MarketInputs {
    returns: ReturnSeries,
    mean: DVector<f64>,
    covariance: CovarianceMatrix,
}

/// A solved request together with the data it was solved on.
struct Solved {
    response: OptimizationResponse,
    weights: DVector<f64>,
    market: MarketInputs,
}

/// Portfolio optimization engine over a market data source.
#[derive(Debug, Clone)]
pub struct PortfolioEngine<M> {
    source: M,
    config: EngineConfig,
    estimator: CovarianceEstimator,
}

impl<M: MarketData> PortfolioEngine<M> {
    /// Engine with the default configuration.
    pub fn new(source: M) -> Self {
        let config = EngineConfig::default();
        PortfolioEngine {
            estimator: CovarianceEstimator::from_config(&config),
            source,
            config,
        }
    }

    /// Engine with a custom configuration, validated first.
    pub fn with_config(source: M, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(PortfolioEngine {
            estimator: CovarianceEstimator::from_config(&config),
            source,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    /// Optimize a portfolio with data from the source.
    #[instrument(skip_all, fields(method = %request.method, assets = request.symbols.len()))]
    pub fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse> {
        let (returns, sectors) = self.fetch(request)?;
        self.optimize_with(request, &returns, &sectors)
    }

    /// Optimize a portfolio on the given returns and symbol → sector map.
    pub fn optimize_with(
        &self,
        request: &OptimizationRequest,
        returns: &ReturnSeries,
        sector_map: &HashMap<String, String>,
    ) -> Result<OptimizationResponse> {
        Ok(self.solve(request, returns, sector_map)?.response)
    }

    /// Trace the efficient frontier with data from the source.
    #[instrument(skip_all, fields(assets = request.symbols.len(), num_points = request.num_points))]
    pub fn efficient_frontier(&self, request: &EfficientFrontierRequest) -> Result<EfficientFrontierResponse> {
        request.validate(self.config.max_portfolio_size)?;
        let returns = self
            .source
            .fetch_returns(&request.symbols, request.lookback_period)?;
        self.efficient_frontier_with(request, &returns)
    }

    /// Trace the efficient frontier on the given returns.
    ///
    /// Frontier requests carry no bounds; the constraint set is long-only
    /// with the budget.
    pub fn efficient_frontier_with(
        &self,
        request: &EfficientFrontierRequest,
        returns: &ReturnSeries,
    ) -> Result<EfficientFrontierResponse> {
        request.validate(self.config.max_portfolio_size)?;
        let market = self.market_inputs(
            returns,
            &request.symbols,
            request.lookback_period,
            request.covariance_method(),
        )?;
        let constraints = ConstraintSet::builder(request.symbols.len()).build()?;
        let inputs = OptimizationInputs::new(
            &market.mean,
            &market.covariance,
            market.returns.matrix(),
            &constraints,
        )?;

        let frontier = EfficientFrontierTracer::from_config(&self.config).trace(&inputs, request.num_points)?;
        let metadata = SolveMetadata {
            solver_iterations: frontier.iterations,
            solve_time: frontier.solve_time,
            reduced_accuracy: frontier.reduced_accuracy,
            ..self.metadata(&market)
        };
        Ok(EfficientFrontierResponse {
            points: frontier.points,
            min_variance_return: frontier.min_variance_return,
            min_variance_volatility: frontier.min_variance_volatility,
            metadata,
        })
    }

    /// Optimize, then stress the optimized weights, with data from the source.
    #[instrument(skip_all, fields(method = %request.optimization.method, scenarios = request.scenarios.len()))]
    pub fn stress_test(&self, request: &StressTestRequest) -> Result<StressTestResponse> {
        let (returns, sectors) = self.fetch(&request.optimization)?;
        self.stress_test_with(request, &returns, &sectors)
    }

    /// Optimize, then stress the optimized weights, on the given data.
    pub fn stress_test_with(
        &self,
        request: &StressTestRequest,
        returns: &ReturnSeries,
        sector_map: &HashMap<String, String>,
    ) -> Result<StressTestResponse> {
        let solved = self.solve(&request.optimization, returns, sector_map)?;
        let report = StressTester::new(request.optimization.alpha)?.run(
            &solved.weights,
            &solved.market.returns,
            &solved.market.covariance,
            &request.scenarios,
        )?;
        Ok(StressTestResponse {
            optimization: solved.response,
            report,
        })
    }

    fn fetch(&self, request: &OptimizationRequest) -> Result<(ReturnSeries, HashMap<String, String>)> {
        request.validate(self.config.max_portfolio_size)?;
        let returns = self
            .source
            .fetch_returns(&request.symbols, request.lookback_period)?;
        let sectors = match request.sector_constraints {
            Some(_) => self.source.fetch_sector_map(&request.symbols)?,
            None => HashMap::new(),
        };
        Ok((returns, sectors))
    }

    fn solve(
        &self,
        request: &OptimizationRequest,
        returns: &ReturnSeries,
        sector_map: &HashMap<String, String>,
    ) -> Result<Solved> {
        request.validate(self.config.max_portfolio_size)?;
        let constraints = self.constraints_for(request, sector_map)?;
        let market = self.market_inputs(
            returns,
            &request.symbols,
            request.lookback_period,
            request.covariance_method(),
        )?;

        let optimizer = Optimizer::for_method(request.method, &self.config, request.uncertainty_radius)?;
        let inputs = OptimizationInputs::new(
            &market.mean,
            &market.covariance,
            market.returns.matrix(),
            &constraints,
        )?
        .with_target_return(request.target_return)?
        .with_alpha(request.alpha)?;
        let allocation = optimizer.solve(&inputs)?;

        let mut metrics = ResultEvaluator::new(self.config.risk_free_rate).evaluate(
            &allocation.weights,
            &market.mean,
            &market.covariance,
            market.returns.matrix(),
            request.alpha,
        )?;
        if optimizer.method() == Method::Cvar {
            metrics.var = allocation.var.or(metrics.var);
            metrics.cvar = allocation.cvar.or(metrics.cvar);
        }

        let metadata = SolveMetadata {
            solver_iterations: allocation.iterations,
            solve_time: allocation.solve_time,
            reduced_accuracy: allocation.reduced_accuracy,
            ..self.metadata(&market)
        };
        info!(
            method = %optimizer.method(),
            expected_return = metrics.expected_return,
            volatility = metrics.volatility,
            iterations = allocation.iterations,
            "portfolio optimized"
        );

        let response = OptimizationResponse::from_metrics(
            allocation.weights.iter().copied().collect(),
            &metrics,
            optimizer.method(),
            metadata,
        );
        Ok(Solved {
            response,
            weights: allocation.weights,
            market,
        })
    }

    fn market_inputs(
        &self,
        returns: &ReturnSeries,
        symbols: &[String],
        lookback: usize,
        method: CovarianceMethod,
    ) -> Result<MarketInputs> {
        let returns = returns.select(symbols)?.tail(lookback);
        let covariance = self
            .estimator
            .estimate(&returns, method)?
            .stabilized(self.config.min_eigenvalue_ratio);
        Ok(MarketInputs {
            mean: returns.mean(),
            returns,
            covariance,
        })
    }

    fn constraints_for(
        &self,
        request: &OptimizationRequest,
        sector_map: &HashMap<String, String>,
    ) -> Result<ConstraintSet> {
        let n = request.symbols.len();
        let mut builder = ConstraintSet::builder(n)
            .long_only(true)
            .weight_bounds(request.min_weight, request.max_weight);

        if let Some(caps) = &request.sector_constraints {
            if sector_map.is_empty() {
                return Err(PortfolioError::invalid(
                    "sector_constraints",
                    "sector caps given but no sector map is available for the symbols",
                ));
            }
            let assignments = request
                .symbols
                .iter()
                .map(|s| sector_map.get(s).cloned())
                .collect();
            builder = builder.sector_caps(caps.clone(), assignments);
        }
        if let Some(hhi) = request.hhi_max {
            builder = builder.hhi_max(hhi);
        }
        if let Some(cvar) = request.cvar_max {
            builder = builder.cvar_max(cvar);
        }
        if let Some(vol) = request.volatility_max {
            builder = builder.volatility_max(vol);
        }
        builder.build()
    }

    fn metadata(&self, market: &MarketInputs) -> SolveMetadata {
        SolveMetadata {
            covariance_method: market.covariance.method(),
            shrinkage_intensity: market.covariance.shrinkage_intensity(),
            regularization: market.covariance.regularization(),
            observations: market.returns.num_observations(),
            ..SolveMetadata::default()
        }
    }
}
