//! Derived metrics of a solved weight vector.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::covariance::CovarianceMatrix;
use crate::error::{PortfolioError, Result};

/// Volatility below which the Sharpe ratio is omitted.
const VOLATILITY_FLOOR: f64 = 1e-12;

/// Metrics of one portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub variance: f64,
    pub volatility: f64,
    /// `(μ' w - r_f) / σ`; `None` when `σ ≈ 0`.
    pub sharpe_ratio: Option<f64>,
    /// Historical VaR (positive = loss); `None` without scenarios.
    pub var: Option<f64>,
    /// Historical CVaR (positive = loss); `None` without scenarios.
    pub cvar: Option<f64>,
    /// Herfindahl–Hirschman index `Σ wᵢ²`.
    pub hhi: f64,
    /// `1 / HHI`, the effective number of assets.
    pub diversification_ratio: Option<f64>,
}

/// Computes [`PortfolioMetrics`] from weights and market inputs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResultEvaluator {
    risk_free_rate: f64,
}

impl ResultEvaluator {
    pub fn new(risk_free_rate: f64) -> Self {
        ResultEvaluator { risk_free_rate }
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Evaluate `weights` against the mean vector, covariance and the `T x N`
    /// scenario matrix, with VaR/CVaR at tail probability `alpha`.
    pub fn evaluate(
        &self,
        weights: &DVector<f64>,
        mean: &DVector<f64>,
        covariance: &CovarianceMatrix,
        scenarios: &DMatrix<f64>,
        alpha: f64,
    ) -> Result<PortfolioMetrics> {
        let n = weights.len();
        if mean.len() != n || covariance.dim() != n || scenarios.ncols() != n {
            return Err(PortfolioError::shape(
                format!("inputs for {} assets", n),
                format!(
                    "mean {}, covariance {}, scenarios {}",
                    mean.len(),
                    covariance.dim(),
                    scenarios.ncols()
                ),
            ));
        }

        let expected_return = mean.dot(weights);
        let variance = covariance.variance(weights);
        let volatility = variance.sqrt();
        let sharpe_ratio =
            (volatility > VOLATILITY_FLOOR).then(|| (expected_return - self.risk_free_rate) / volatility);

        let (var, cvar) = if scenarios.nrows() == 0 {
            (None, None)
        } else {
            let path = scenarios * weights;
            let (var, cvar) = historical_var_cvar(path.as_slice(), alpha)?;
            (Some(var), Some(cvar))
        };

        let hhi = weights.norm_squared();
        let diversification_ratio = (hhi > 0.0).then(|| 1.0 / hhi);

        Ok(PortfolioMetrics {
            expected_return,
            variance,
            volatility,
            sharpe_ratio,
            var,
            cvar,
            hhi,
            diversification_ratio,
        })
    }
}

/// Historical VaR and CVaR of a series of portfolio returns.
///
/// Losses `Lₜ = -rₜ` are sorted ascending; VaR is the `⌈(1-α)T⌉`-th loss and
/// CVaR is the Rockafellar–Uryasev value `VaR + Σ max(0, Lₜ - VaR) / (αT)`.
pub fn historical_var_cvar(returns: &[f64], alpha: f64) -> Result<(f64, f64)> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(PortfolioError::invalid(
            "alpha",
            format!("must lie in (0, 1), got {}", alpha),
        ));
    }
    if returns.is_empty() {
        return Err(PortfolioError::InsufficientData {
            estimator: "historical VaR",
            required: 1,
            actual: 0,
        });
    }

    let t = returns.len();
    let mut losses: Vec<f64> = returns.iter().map(|r| -r).collect();
    losses.sort_by(f64::total_cmp);

    // Guard the ceiling against products like 0.95 * 100 = 95.00000000000001.
    let rank = ((1.0 - alpha) * t as f64 - 1e-9).ceil() as usize;
    let var = losses[rank.clamp(1, t) - 1];
    let excess: f64 = losses.iter().map(|l| (l - var).max(0.0)).sum();
    let cvar = var + excess / (alpha * t as f64);
    Ok((var, cvar))
}
