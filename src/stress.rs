//! Stress testing of a fixed allocation.
//!
//! A [`StressTester`] replays the lookback window (worst/best period,
//! maximum drawdown of the compounded path) and applies hypothetical
//! [`StressScenario`]s to the weights.

use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info};

use crate::covariance::CovarianceMatrix;
use crate::error::{PortfolioError, Result};
use crate::returns::ReturnSeries;

/// A hypothetical market move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StressScenario {
    /// Every asset returns the same amount.
    MarketShock(f64),
    /// Per-symbol returns; unlisted assets are unchanged.
    AssetShocks(HashMap<String, f64>),
    /// All volatilities scale by this factor.
    VolatilityMultiplier(f64),
    /// The worst period of the lookback window.
    WorstHistorical,
}

impl StressScenario {
    /// Short name used in reports.
    pub fn name(&self) -> &'static str {
        match self {
            StressScenario::MarketShock(_) => "market_shock",
            StressScenario::AssetShocks(_) => "asset_shocks",
            StressScenario::VolatilityMultiplier(_) => "volatility_multiplier",
            StressScenario::WorstHistorical => "worst_historical",
        }
    }
}

/// Portfolio outcome under one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    /// One-period portfolio return under the scenario.
    pub portfolio_return: f64,
    /// Stressed volatility, for volatility scenarios.
    pub volatility: Option<f64>,
    /// Parametric VaR at the tester's α, for volatility scenarios.
    pub var: Option<f64>,
    /// Index of the historical period, for historical scenarios.
    pub period: Option<usize>,
}

/// Historical replay plus scenario outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub worst_period_return: f64,
    pub best_period_return: f64,
    /// Largest peak-to-trough decline of the compounded path, as a fraction.
    pub max_drawdown: f64,
    pub scenarios: Vec<ScenarioOutcome>,
}

/// Applies stress scenarios to a weight vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressTester {
    alpha: f64,
}

impl Default for StressTester {
    fn default() -> Self {
        StressTester { alpha: 0.05 }
    }
}

impl StressTester {
    /// Tester reporting parametric VaR at tail probability `alpha`.
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(PortfolioError::invalid(
                "alpha",
                format!("must lie in (0, 1), got {}", alpha),
            ));
        }
        Ok(StressTester { alpha })
    }

    pub fn run(
        &self,
        weights: &DVector<f64>,
        returns: &ReturnSeries,
        covariance: &CovarianceMatrix,
        scenarios: &[StressScenario],
    ) -> Result<StressReport> {
        if covariance.dim() != weights.len() {
            return Err(PortfolioError::shape(
                format!("{}x{} covariance", weights.len(), weights.len()),
                format!("{}x{}", covariance.dim(), covariance.dim()),
            ));
        }
        let path = returns.portfolio_returns(weights)?;
        if path.is_empty() {
            return Err(PortfolioError::InsufficientData {
                estimator: "stress test",
                required: 1,
                actual: 0,
            });
        }

        let (worst_period, worst_period_return) = path
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));
        let best_period_return = path.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let outcomes = scenarios
            .iter()
            .map(|scenario| -> Result<ScenarioOutcome> {
                let outcome = match scenario {
                    StressScenario::MarketShock(shock) => {
                        check_shock("market_shock", *shock)?;
                        plain(scenario, shock * weights.sum())
                    }
                    StressScenario::AssetShocks(shocks) => {
                        plain(scenario, self.asset_shock_return(weights, returns, shocks)?)
                    }
                    StressScenario::VolatilityMultiplier(factor) => {
                        self.volatility_outcome(weights, returns, covariance, *factor)?
                    }
                    StressScenario::WorstHistorical => ScenarioOutcome {
                        period: Some(worst_period),
                        ..plain(scenario, worst_period_return)
                    },
                };
                debug!(scenario = scenario.name(), portfolio_return = outcome.portfolio_return, "scenario applied");
                Ok(outcome)
            })
            .collect::<Result<Vec<_>>>()?;

        let report = StressReport {
            worst_period_return,
            best_period_return,
            max_drawdown: max_drawdown(path.iter().copied()),
            scenarios: outcomes,
        };
        info!(
            periods = path.len(),
            worst = report.worst_period_return,
            max_drawdown = report.max_drawdown,
            "stress test complete"
        );
        Ok(report)
    }

    fn asset_shock_return(
        &self,
        weights: &DVector<f64>,
        returns: &ReturnSeries,
        shocks: &HashMap<String, f64>,
    ) -> Result<f64> {
        let mut total = 0.0;
        for (symbol, shock) in shocks {
            check_shock(symbol, *shock)?;
            let index = returns
                .symbols()
                .iter()
                .position(|s| s == symbol)
                .ok_or_else(|| PortfolioError::UnknownSymbol(symbol.clone()))?;
            total += weights[index] * shock;
        }
        Ok(total)
    }

    fn volatility_outcome(
        &self,
        weights: &DVector<f64>,
        returns: &ReturnSeries,
        covariance: &CovarianceMatrix,
        factor: f64,
    ) -> Result<ScenarioOutcome> {
        if !(factor.is_finite() && factor >= 0.0) {
            return Err(PortfolioError::invalid(
                "volatility_multiplier",
                format!("must be finite and >= 0, got {}", factor),
            ));
        }
        let normal = Normal::new(0.0, 1.0).map_err(|e| PortfolioError::NumericalError(e.to_string()))?;
        let z = normal.inverse_cdf(1.0 - self.alpha);
        let mean = returns.mean().dot(weights);
        let volatility = factor * covariance.volatility(weights);
        let var = z * volatility - mean;
        Ok(ScenarioOutcome {
            scenario: "volatility_multiplier".to_string(),
            portfolio_return: -var,
            volatility: Some(volatility),
            var: Some(var),
            period: None,
        })
    }
}

fn plain(scenario: &StressScenario, portfolio_return: f64) -> ScenarioOutcome {
    ScenarioOutcome {
        scenario: scenario.name().to_string(),
        portfolio_return,
        volatility: None,
        var: None,
        period: None,
    }
}

fn check_shock(name: &str, shock: f64) -> Result<()> {
    if !shock.is_finite() {
        return Err(PortfolioError::invalid(name, "shock must be finite"));
    }
    Ok(())
}

/// Largest peak-to-trough decline of `Π (1 + rₜ)`.
pub fn max_drawdown(returns: impl IntoIterator<Item = f64>) -> f64 {
    let mut wealth = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        wealth *= 1.0 + r;
        peak = peak.max(wealth);
        if peak > 0.0 {
            worst = worst.max((peak - wealth) / peak);
        }
    }
    worst
}
