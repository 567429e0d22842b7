//! Shared fixtures for the integration tests.
//!
//! Synthetic returns are whitened so that their sample mean and unbiased
//! sample covariance equal the target moments exactly; assertions can then
//! compare against closed-form portfolios without sampling noise.

#![allow(dead_code)]

use cvxfolio::returns::ReturnSeries;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Daily volatilities of the five-asset universe.
pub const VOLS: [f64; 5] = [0.010, 0.012, 0.015, 0.011, 0.013];

/// Pairwise correlation of the five-asset universe.
pub const RHO: f64 = 0.3;

/// Expected return per unit of volatility.
pub const SHARPE_PER_ASSET: f64 = 0.05;

pub fn symbols(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{}", i)).collect()
}

pub fn target_covariance() -> DMatrix<f64> {
    let n = VOLS.len();
    DMatrix::from_fn(n, n, |i, j| {
        let corr = if i == j { 1.0 } else { RHO };
        corr * VOLS[i] * VOLS[j]
    })
}

pub fn target_mean() -> DVector<f64> {
    DVector::from_iterator(VOLS.len(), VOLS.iter().map(|v| SHARPE_PER_ASSET * v))
}

/// `periods x N` returns whose sample moments are exactly `mean` and `cov`.
pub fn whitened_returns(periods: usize, mean: &DVector<f64>, cov: &DMatrix<f64>, seed: u64) -> DMatrix<f64> {
    let n = mean.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut z: DMatrix<f64> = DMatrix::from_fn(periods, n, |_, _| StandardNormal.sample(&mut rng));

    for j in 0..n {
        let m = z.column(j).mean();
        z.column_mut(j).add_scalar_mut(-m);
    }
    let sample = z.transpose() * &z / (periods as f64 - 1.0);
    let lz = Cholesky::new(sample).expect("noise covariance is positive definite").l();
    let lz_inv = lz.try_inverse().expect("cholesky factor is invertible");
    let white = z * lz_inv.transpose();

    let l = Cholesky::new(cov.clone()).expect("target covariance is positive definite").l();
    let mut x = white * l.transpose();
    for mut row in x.row_iter_mut() {
        row += mean.transpose();
    }
    x
}

/// One year of daily returns for the five-asset universe.
pub fn five_asset_series(seed: u64) -> ReturnSeries {
    let data = whitened_returns(252, &target_mean(), &target_covariance(), seed);
    ReturnSeries::new(symbols(VOLS.len()), data).expect("synthetic series is valid")
}

/// Unconstrained tangency portfolio `Σ⁻¹μ / 1'Σ⁻¹μ` at a zero risk-free rate.
pub fn tangency_weights(mean: &DVector<f64>, cov: &DMatrix<f64>) -> DVector<f64> {
    let raw = Cholesky::new(cov.clone())
        .expect("covariance is positive definite")
        .solve(mean);
    let total = raw.sum();
    raw / total
}

pub fn volatility(weights: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
    (weights.transpose() * cov * weights)[(0, 0)].sqrt()
}
