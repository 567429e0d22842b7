//! Covariance estimation.
//!
//! Three estimators are available:
//!
//! - **Sample**: unbiased sample covariance.
//! - **Shrinkage**: Ledoit–Wolf linear shrinkage toward a scaled identity,
//!   with the intensity that minimizes expected Frobenius loss.
//! - **Regularized**: sample covariance plus `λI`. A sample request whose
//!   estimate is ill-conditioned gets this one instead.
//!
//! Every estimate is symmetrized and projected onto the PSD cone before it
//! leaves this module. [`CovarianceMatrix::stabilized`] additionally adds a
//! ridge when the estimate is singular or ill-conditioned, and records how
//! much it added.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{PortfolioError, Result};
use crate::returns::ReturnSeries;

/// Smallest eigenvalue floor applied regardless of scale.
const ABSOLUTE_EIGEN_FLOOR: f64 = 1e-14;

/// Which estimator produced a covariance matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CovarianceMethod {
    /// Unbiased sample covariance.
    Sample,
    /// Ledoit–Wolf shrinkage toward a scaled identity.
    Shrinkage,
    /// Sample covariance plus `lambda * I`.
    Regularized { lambda: f64 },
}

/// A symmetric PSD covariance matrix in asset order.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    matrix: DMatrix<f64>,
    method: CovarianceMethod,
    shrinkage: Option<f64>,
    regularization: f64,
}

impl CovarianceMatrix {
    /// Wrap an externally supplied matrix.
    ///
    /// The matrix must be square and finite. It is symmetrized and negative
    /// eigenvalues are clipped to zero.
    pub fn from_matrix(matrix: DMatrix<f64>) -> Result<Self> {
        if !matrix.is_square() {
            return Err(PortfolioError::shape(
                "square covariance matrix",
                format!("{}x{}", matrix.nrows(), matrix.ncols()),
            ));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(PortfolioError::invalid("covariance", "contains non-finite values"));
        }
        Ok(CovarianceMatrix {
            matrix: project_psd(matrix),
            method: CovarianceMethod::Sample,
            shrinkage: None,
            regularization: 0.0,
        })
    }

    /// The underlying matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Number of assets.
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Estimator that produced this matrix.
    pub fn method(&self) -> CovarianceMethod {
        self.method
    }

    /// Ledoit–Wolf intensity, when shrinkage was applied.
    pub fn shrinkage_intensity(&self) -> Option<f64> {
        self.shrinkage
    }

    /// Total ridge added on top of the estimate.
    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    /// Portfolio variance `w' Σ w`.
    pub fn variance(&self, weights: &DVector<f64>) -> f64 {
        (weights.transpose() * &self.matrix * weights)[(0, 0)].max(0.0)
    }

    /// Portfolio volatility `sqrt(w' Σ w)`.
    pub fn volatility(&self, weights: &DVector<f64>) -> f64 {
        self.variance(weights).sqrt()
    }

    /// Mean of the diagonal.
    pub fn average_variance(&self) -> f64 {
        let n = self.dim().max(1) as f64;
        self.matrix.trace() / n
    }

    /// Eigenvalues in ascending order.
    pub fn eigenvalues(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.matrix.clone().symmetric_eigen().eigenvalues.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        values
    }

    /// Add `lambda * I`.
    pub fn regularized(mut self, lambda: f64) -> Self {
        for i in 0..self.dim() {
            self.matrix[(i, i)] += lambda;
        }
        self.regularization += lambda;
        self
    }

    /// Add the smallest ridge that lifts the smallest eigenvalue to
    /// `min_ratio` times the largest.
    pub fn stabilized(self, min_ratio: f64) -> Self {
        let values = self.eigenvalues();
        let (min, max) = match (values.first(), values.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return self,
        };
        let floor = (min_ratio * max).max(ABSOLUTE_EIGEN_FLOOR);
        if min >= floor {
            return self;
        }
        let lambda = floor - min;
        warn!(
            lambda,
            min_eigenvalue = min,
            max_eigenvalue = max,
            "covariance matrix is singular or ill-conditioned; adding ridge"
        );
        self.regularized(lambda)
    }

    /// A factor `R` with `R' R = Σ`, so that `w' Σ w = ||R w||²`.
    pub fn risk_factor(&self) -> DMatrix<f64> {
        let eig = self.matrix.clone().symmetric_eigen();
        let n = self.dim();
        DMatrix::from_fn(n, n, |k, j| eig.eigenvalues[k].max(0.0).sqrt() * eig.eigenvectors[(j, k)])
    }
}

/// Symmetrize and clip negative eigenvalues to zero.
fn project_psd(matrix: DMatrix<f64>) -> DMatrix<f64> {
    let symmetric = (&matrix + matrix.transpose()) * 0.5;
    let mut eig = symmetric.clone().symmetric_eigen();
    if eig.eigenvalues.iter().all(|&v| v >= 0.0) {
        return symmetric;
    }
    for v in eig.eigenvalues.iter_mut() {
        *v = v.max(0.0);
    }
    let rebuilt = eig.recompose();
    (&rebuilt + rebuilt.transpose()) * 0.5
}

/// Estimates covariance matrices from return series.
#[derive(Debug, Clone)]
pub struct CovarianceEstimator {
    safety_margin: usize,
    negligible_shrinkage: f64,
    relative_ridge: f64,
    ill_conditioned_ratio: f64,
}

impl Default for CovarianceEstimator {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self::from_config(&config)
    }
}

impl CovarianceEstimator {
    /// Estimator with default thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator with the thresholds of `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        CovarianceEstimator {
            safety_margin: config.shrinkage_safety_margin,
            negligible_shrinkage: config.negligible_shrinkage,
            relative_ridge: config.default_regularization,
            ill_conditioned_ratio: config.ill_conditioned_ratio,
        }
    }

    /// Observations beyond the asset count needed before negligible
    /// shrinkage may fall back to the sample estimate.
    pub fn with_safety_margin(mut self, margin: usize) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Estimate with the given method.
    ///
    /// A sample estimate on fewer than `N + 1` observations is degenerate,
    /// so it is escalated to shrinkage. A sample estimate that is
    /// ill-conditioned is replaced by the regularized one.
    pub fn estimate(&self, returns: &ReturnSeries, method: CovarianceMethod) -> Result<CovarianceMatrix> {
        match method {
            CovarianceMethod::Sample if returns.num_observations() < returns.num_assets() + 1 => {
                warn!(
                    observations = returns.num_observations(),
                    assets = returns.num_assets(),
                    "too few observations for a sample covariance; using shrinkage"
                );
                self.estimate_shrinkage(returns)
            }
            CovarianceMethod::Sample => self.estimate_conditioned(returns),
            CovarianceMethod::Shrinkage => self.estimate_shrinkage(returns),
            CovarianceMethod::Regularized { lambda } => self.estimate_regularized(returns, lambda),
        }
    }

    fn estimate_conditioned(&self, returns: &ReturnSeries) -> Result<CovarianceMatrix> {
        let sample = self.estimate_sample(returns)?;
        let values = sample.eigenvalues();
        let (min, max) = match (values.first(), values.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return Ok(sample),
        };
        let lambda = self.relative_ridge * sample.average_variance();
        if min >= self.ill_conditioned_ratio * max || !(lambda > 0.0) {
            return Ok(sample);
        }
        warn!(
            lambda,
            min_eigenvalue = min,
            max_eigenvalue = max,
            "sample covariance is ill-conditioned; using regularized estimate"
        );
        self.estimate_regularized(returns, lambda)
    }

    /// Unbiased sample covariance.
    pub fn estimate_sample(&self, returns: &ReturnSeries) -> Result<CovarianceMatrix> {
        let centered = centered(returns, "sample covariance")?;
        let t = returns.num_observations() as f64;
        let sample = centered.transpose() * &centered / (t - 1.0);
        Ok(CovarianceMatrix {
            matrix: project_psd(sample),
            method: CovarianceMethod::Sample,
            shrinkage: None,
            regularization: 0.0,
        })
    }

    /// Ledoit–Wolf shrinkage toward `μI`, `μ = tr(S) / N`.
    pub fn estimate_shrinkage(&self, returns: &ReturnSeries) -> Result<CovarianceMatrix> {
        let x = centered(returns, "shrinkage covariance")?;
        let t = returns.num_observations();
        let n = returns.num_assets();
        let intensity = ledoit_wolf_intensity(&x);

        if t >= n + self.safety_margin && intensity < self.negligible_shrinkage {
            debug!(intensity, "shrinkage negligible; using sample covariance");
            return self.estimate_sample(returns);
        }

        // The intensity is scale free, so apply it to the unbiased estimate;
        // intensity 0 then coincides with `estimate_sample`.
        let sample = x.transpose() * &x / (t as f64 - 1.0);
        let mu = sample.trace() / n as f64;
        let target = DMatrix::<f64>::identity(n, n) * mu;
        let shrunk = sample * (1.0 - intensity) + target * intensity;
        debug!(intensity, mu, "ledoit-wolf shrinkage applied");

        Ok(CovarianceMatrix {
            matrix: project_psd(shrunk),
            method: CovarianceMethod::Shrinkage,
            shrinkage: Some(intensity),
            regularization: 0.0,
        })
    }

    /// Sample covariance plus `lambda * I`.
    pub fn estimate_regularized(&self, returns: &ReturnSeries, lambda: f64) -> Result<CovarianceMatrix> {
        if !(lambda > 0.0) || !lambda.is_finite() {
            return Err(PortfolioError::invalid(
                "lambda",
                format!("regularization must be a finite value > 0, got {}", lambda),
            ));
        }
        let mut cov = self.estimate_sample(returns)?.regularized(lambda);
        cov.method = CovarianceMethod::Regularized { lambda };
        Ok(cov)
    }
}

/// Column-centered return matrix; needs at least two observations.
fn centered(returns: &ReturnSeries, estimator: &'static str) -> Result<DMatrix<f64>> {
    let t = returns.num_observations();
    if t < 2 {
        return Err(PortfolioError::InsufficientData {
            estimator,
            required: 2,
            actual: t,
        });
    }
    let mean = returns.mean();
    let data = returns.matrix();
    Ok(DMatrix::from_fn(t, data.ncols(), |i, j| data[(i, j)] - mean[j]))
}

/// Optimal Ledoit–Wolf shrinkage intensity for centered data `x` (`T x N`).
///
/// Computed on the biased estimate `S = X'X / T` toward `μI`; the result is
/// clamped to `[0, 1]`.
pub fn ledoit_wolf_intensity(x: &DMatrix<f64>) -> f64 {
    let t = x.nrows() as f64;
    let n = x.ncols() as f64;
    if x.nrows() == 0 || x.ncols() == 0 {
        return 0.0;
    }

    let s = x.transpose() * x / t;
    let trace = s.trace();
    let mu = trace / n;

    // Σ_t (Σ_i x_ti²)²
    let beta_raw: f64 = x
        .row_iter()
        .map(|row| {
            let r = row.norm_squared();
            r * r
        })
        .sum();
    let delta_raw = s.norm_squared();

    let beta = (beta_raw / t - delta_raw) / (n * t);
    let delta = (delta_raw - 2.0 * mu * trace + n * mu * mu) / n;
    let beta = beta.min(delta);

    if delta <= f64::EPSILON * delta_raw.max(f64::MIN_POSITIVE) || beta <= 0.0 {
        return 0.0;
    }
    (beta / delta).clamp(0.0, 1.0)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn shrinkage_is_symmetric_psd(
            t in 2usize..12,
            n in 1usize..6,
            seed in proptest::collection::vec(-0.1f64..0.1, 72),
        ) {
            let data = DMatrix::from_fn(t, n, |i, j| seed[(i * n + j) % seed.len()] * (1.0 + i as f64 * 0.1));
            let symbols = (0..n).map(|i| format!("S{}", i)).collect();
            let returns = ReturnSeries::new(symbols, data).unwrap();
            let cov = CovarianceEstimator::new().estimate_shrinkage(&returns).unwrap();
            let m = cov.matrix();
            for i in 0..n {
                prop_assert!(m[(i, i)] >= 0.0);
                for j in 0..n {
                    prop_assert!((m[(i, j)] - m[(j, i)]).abs() < 1e-15);
                }
            }
            let min_eig = m.clone().symmetric_eigen().eigenvalues.min();
            prop_assert!(min_eig >= -1e-12);
        }
    }
}
