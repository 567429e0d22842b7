//! Request and response types exchanged with the outer service layer.
//!
//! Field names and defaults are the wire contract; every type round-trips
//! through serde_json.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::covariance::CovarianceMethod;
use crate::error::{PortfolioError, Result};
use crate::evaluator::PortfolioMetrics;
use crate::frontier::EfficientFrontierPoint;
use crate::optimizer::Method;
use crate::stress::{StressReport, StressScenario};

fn default_alpha() -> f64 {
    0.05
}

fn default_max_weight() -> f64 {
    0.1
}

fn default_lookback() -> usize {
    252
}

fn default_num_points() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// One optimization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub target_return: Option<f64>,
    #[serde(default)]
    pub method: Method,
    /// CVaR tail probability.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub cvar_max: Option<f64>,
    #[serde(default)]
    pub volatility_max: Option<f64>,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    #[serde(default)]
    pub min_weight: f64,
    /// Sector → maximum aggregate weight.
    #[serde(default)]
    pub sector_constraints: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub hhi_max: Option<f64>,
    #[serde(default)]
    pub uncertainty_radius: Option<f64>,
    #[serde(default = "default_lookback")]
    pub lookback_period: usize,
    #[serde(default = "default_true", alias = "use_ledoit_wolf")]
    pub use_shrinkage_covariance: bool,
}

impl OptimizationRequest {
    /// A request with every optional field at its default.
    pub fn new(symbols: Vec<String>, method: Method) -> Self {
        OptimizationRequest {
            symbols,
            target_return: None,
            method,
            alpha: default_alpha(),
            cvar_max: None,
            volatility_max: None,
            max_weight: default_max_weight(),
            min_weight: 0.0,
            sector_constraints: None,
            hhi_max: None,
            uncertainty_radius: None,
            lookback_period: default_lookback(),
            use_shrinkage_covariance: true,
        }
    }

    pub fn with_target_return(mut self, target: f64) -> Self {
        self.target_return = Some(target);
        self
    }

    pub fn with_weight_bounds(mut self, min_weight: f64, max_weight: f64) -> Self {
        self.min_weight = min_weight;
        self.max_weight = max_weight;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_lookback(mut self, lookback_period: usize) -> Self {
        self.lookback_period = lookback_period;
        self
    }

    pub fn with_shrinkage(mut self, use_shrinkage: bool) -> Self {
        self.use_shrinkage_covariance = use_shrinkage;
        self
    }

    pub fn with_sector_constraints(mut self, caps: HashMap<String, f64>) -> Self {
        self.sector_constraints = Some(caps);
        self
    }

    pub fn with_hhi_max(mut self, hhi_max: f64) -> Self {
        self.hhi_max = Some(hhi_max);
        self
    }

    pub fn with_cvar_max(mut self, cvar_max: f64) -> Self {
        self.cvar_max = Some(cvar_max);
        self
    }

    pub fn with_volatility_max(mut self, volatility_max: f64) -> Self {
        self.volatility_max = Some(volatility_max);
        self
    }

    pub fn with_uncertainty_radius(mut self, radius: f64) -> Self {
        self.uncertainty_radius = Some(radius);
        self
    }

    /// Covariance estimator selected by the request.
    pub fn covariance_method(&self) -> CovarianceMethod {
        covariance_method(self.use_shrinkage_covariance)
    }

    /// Range checks that do not need market data.
    pub fn validate(&self, max_portfolio_size: usize) -> Result<()> {
        validate_symbols(&self.symbols, max_portfolio_size)?;
        validate_lookback(self.lookback_period)?;
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(PortfolioError::invalid(
                "alpha",
                format!("must lie in (0, 1), got {}", self.alpha),
            ));
        }
        if !self.min_weight.is_finite() || !self.max_weight.is_finite() {
            return Err(PortfolioError::invalid("min_weight/max_weight", "bounds must be finite"));
        }
        if let Some(t) = self.target_return {
            if !t.is_finite() {
                return Err(PortfolioError::invalid("target_return", "must be finite"));
            }
        }
        Ok(())
    }
}

/// Result of one optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResponse {
    /// Weights in request symbol order.
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
    pub cvar: Option<f64>,
    pub var: Option<f64>,
    pub diversification_ratio: Option<f64>,
    pub method_used: String,
    #[serde(default)]
    pub metadata: SolveMetadata,
}

impl OptimizationResponse {
    pub(crate) fn from_metrics(
        weights: Vec<f64>,
        metrics: &PortfolioMetrics,
        method: Method,
        metadata: SolveMetadata,
    ) -> Self {
        OptimizationResponse {
            weights,
            expected_return: metrics.expected_return,
            volatility: metrics.volatility,
            sharpe_ratio: metrics.sharpe_ratio,
            cvar: metrics.cvar,
            var: metrics.var,
            diversification_ratio: metrics.diversification_ratio,
            method_used: method.to_string(),
            metadata,
        }
    }
}

/// How a result was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveMetadata {
    /// Estimator actually used (sample requests may escalate to shrinkage).
    pub covariance_method: CovarianceMethod,
    pub shrinkage_intensity: Option<f64>,
    /// Ridge added to the covariance diagonal.
    pub regularization: f64,
    pub solver_iterations: u32,
    /// Seconds spent in the conic solver.
    pub solve_time: f64,
    /// Some solve was accepted at the solver's reduced tolerances.
    pub reduced_accuracy: bool,
    pub observations: usize,
}

impl Default for SolveMetadata {
    fn default() -> Self {
        SolveMetadata {
            covariance_method: CovarianceMethod::Sample,
            shrinkage_intensity: None,
            regularization: 0.0,
            solver_iterations: 0,
            solve_time: 0.0,
            reduced_accuracy: false,
            observations: 0,
        }
    }
}

/// Efficient frontier call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontierRequest {
    pub symbols: Vec<String>,
    #[serde(default = "default_num_points")]
    pub num_points: usize,
    #[serde(default = "default_lookback")]
    pub lookback_period: usize,
    #[serde(default = "default_true", alias = "use_ledoit_wolf")]
    pub use_shrinkage_covariance: bool,
}

impl EfficientFrontierRequest {
    pub fn new(symbols: Vec<String>) -> Self {
        EfficientFrontierRequest {
            symbols,
            num_points: default_num_points(),
            lookback_period: default_lookback(),
            use_shrinkage_covariance: true,
        }
    }

    pub fn with_num_points(mut self, num_points: usize) -> Self {
        self.num_points = num_points;
        self
    }

    pub fn with_shrinkage(mut self, use_shrinkage: bool) -> Self {
        self.use_shrinkage_covariance = use_shrinkage;
        self
    }

    pub fn covariance_method(&self) -> CovarianceMethod {
        covariance_method(self.use_shrinkage_covariance)
    }

    pub fn validate(&self, max_portfolio_size: usize) -> Result<()> {
        validate_symbols(&self.symbols, max_portfolio_size)?;
        validate_lookback(self.lookback_period)?;
        if self.num_points < 2 {
            return Err(PortfolioError::invalid(
                "num_points",
                format!("must be >= 2, got {}", self.num_points),
            ));
        }
        Ok(())
    }
}

/// Traced frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontierResponse {
    pub points: Vec<EfficientFrontierPoint>,
    pub min_variance_return: f64,
    pub min_variance_volatility: f64,
    #[serde(default)]
    pub metadata: SolveMetadata,
}

/// Optimize, then stress the resulting weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestRequest {
    #[serde(flatten)]
    pub optimization: OptimizationRequest,
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<StressScenario>,
}

/// Scenarios run when a stress request names none.
pub fn default_scenarios() -> Vec<StressScenario> {
    vec![
        StressScenario::MarketShock(-0.10),
        StressScenario::MarketShock(-0.20),
        StressScenario::VolatilityMultiplier(2.0),
        StressScenario::WorstHistorical,
    ]
}

/// Optimized portfolio plus its stress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResponse {
    pub optimization: OptimizationResponse,
    pub report: StressReport,
}

fn covariance_method(use_shrinkage: bool) -> CovarianceMethod {
    if use_shrinkage {
        CovarianceMethod::Shrinkage
    } else {
        CovarianceMethod::Sample
    }
}

fn validate_symbols(symbols: &[String], max_portfolio_size: usize) -> Result<()> {
    if symbols.is_empty() {
        return Err(PortfolioError::invalid("symbols", "at least one symbol is required"));
    }
    if symbols.len() > max_portfolio_size {
        return Err(PortfolioError::invalid(
            "symbols",
            format!("at most {} symbols per request, got {}", max_portfolio_size, symbols.len()),
        ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = symbols.iter().find(|s| !seen.insert(s.as_str())) {
        return Err(PortfolioError::invalid("symbols", format!("duplicate symbol {}", dup)));
    }
    Ok(())
}

fn validate_lookback(lookback_period: usize) -> Result<()> {
    if lookback_period < 2 {
        return Err(PortfolioError::invalid(
            "lookback_period",
            format!("must be >= 2, got {}", lookback_period),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_json() {
        let req: OptimizationRequest = serde_json::from_str(r#"{ "symbols": ["A", "B"] }"#).unwrap();
        assert_eq!(req.method, Method::MeanVariance);
        assert_eq!(req.alpha, 0.05);
        assert_eq!(req.max_weight, 0.1);
        assert_eq!(req.min_weight, 0.0);
        assert_eq!(req.lookback_period, 252);
        assert!(req.use_shrinkage_covariance);
        assert!(req.target_return.is_none());
        assert_eq!(req, OptimizationRequest::new(vec!["A".into(), "B".into()], Method::MeanVariance));
    }

    #[test]
    fn test_request_rejects_unknown_method() {
        let parsed = serde_json::from_str::<OptimizationRequest>(r#"{ "symbols": ["A"], "method": "kelly" }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_legacy_shrinkage_flag() {
        let req: EfficientFrontierRequest =
            serde_json::from_str(r#"{ "symbols": ["A"], "use_ledoit_wolf": false }"#).unwrap();
        assert!(!req.use_shrinkage_covariance);
        assert_eq!(req.num_points, 50);
    }

    #[test]
    fn test_validate() {
        let req = OptimizationRequest::new(vec!["A".into(), "A".into()], Method::Cvar);
        assert!(req.validate(100).is_err());
        let req = OptimizationRequest::new(vec!["A".into(), "B".into()], Method::Cvar).with_alpha(1.5);
        assert!(req.validate(100).is_err());
        let req = OptimizationRequest::new(vec!["A".into(), "B".into()], Method::Cvar);
        assert!(req.validate(1).is_err());
        assert!(req.validate(2).is_ok());
        let frontier = EfficientFrontierRequest::new(vec!["A".into()]).with_num_points(1);
        assert!(frontier.validate(100).is_err());
    }

    #[test]
    fn test_stress_request_flattens() {
        let req: StressTestRequest = serde_json::from_str(
            r#"{ "symbols": ["A", "B"], "method": "cvar", "scenarios": [{"kind": "market_shock", "value": -0.3}] }"#,
        )
        .unwrap();
        assert_eq!(req.optimization.method, Method::Cvar);
        assert_eq!(req.scenarios, vec![StressScenario::MarketShock(-0.3)]);

        let req: StressTestRequest = serde_json::from_str(r#"{ "symbols": ["A"] }"#).unwrap();
        assert_eq!(req.scenarios.len(), 4);
    }
}
