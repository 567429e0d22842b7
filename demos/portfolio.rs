//! Portfolio Optimization Example
//!
//! This example runs the engine over a year of synthetic daily returns for
//! five assets:
//!
//! 1. Maximum-Sharpe mean-variance portfolio (max weight 30%)
//! 2. Minimum-CVaR portfolio at 95% confidence
//! 3. Robust portfolio with uncertainty radius 0.5
//! 4. A short efficient frontier
//! 5. Stress test of the mean-variance portfolio
//!
//! Run with `RUST_LOG=cvxfolio=debug` to see the solver logs.

use cvxfolio::prelude::*;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing_subscriber::EnvFilter;

const SYMBOLS: [&str; 5] = ["AAA", "BBB", "CCC", "DDD", "EEE"];

/// Correlated normal returns with daily vols `vols`, pairwise correlation
/// `rho` and Sharpe-proportional drift.
fn synthetic_returns(periods: usize, vols: &[f64], rho: f64, seed: u64) -> DMatrix<f64> {
    let n = vols.len();
    let corr = DMatrix::from_fn(n, n, |i, j| if i == j { 1.0 } else { rho });
    let cov = DMatrix::from_fn(n, n, |i, j| corr[(i, j)] * vols[i] * vols[j]);
    let chol = nalgebra::Cholesky::new(cov).expect("synthetic covariance is positive definite");
    let l = chol.l();
    let drift = DVector::from_iterator(n, vols.iter().map(|v| 0.05 * v));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = DMatrix::zeros(periods, n);
    for t in 0..periods {
        let z: DVector<f64> = DVector::from_iterator(n, (0..n).map(|_| StandardNormal.sample(&mut rng)));
        let r = &drift + &l * z;
        data.set_row(t, &r.transpose());
    }
    data
}

fn print_weights(symbols: &[String], weights: &[f64]) {
    for (symbol, w) in symbols.iter().zip(weights) {
        println!("  {}: {:>6.2}%", symbol, w * 100.0);
    }
}

fn print_response(title: &str, symbols: &[String], response: &OptimizationResponse) {
    println!("--- {} ---", title);
    print_weights(symbols, &response.weights);
    println!("  Expected return: {:.4}%", response.expected_return * 100.0);
    println!("  Volatility:      {:.4}%", response.volatility * 100.0);
    if let Some(sharpe) = response.sharpe_ratio {
        println!("  Sharpe ratio:    {:.4}", sharpe);
    }
    if let (Some(var), Some(cvar)) = (response.var, response.cvar) {
        println!("  VaR / CVaR:      {:.4}% / {:.4}%", var * 100.0, cvar * 100.0);
    }
    println!(
        "  Solver:          {} iterations, {:.2} ms",
        response.metadata.solver_iterations,
        response.metadata.solve_time * 1e3
    );
    println!();
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Portfolio Optimization ===\n");

    let symbols: Vec<String> = SYMBOLS.iter().map(|s| s.to_string()).collect();
    let data = synthetic_returns(252, &[0.010, 0.012, 0.015, 0.011, 0.013], 0.3, 7);
    let returns = ReturnSeries::new(symbols.clone(), data)?;
    let engine = PortfolioEngine::new(InMemoryMarketData::new(returns));

    // 1. Mean-variance, maximum Sharpe
    let request = OptimizationRequest::new(symbols.clone(), Method::MeanVariance)
        .with_weight_bounds(0.0, 0.3);
    let mean_variance = engine.optimize(&request)?;
    print_response("Mean-variance (max Sharpe)", &symbols, &mean_variance);

    // 2. Minimum CVaR
    let request = OptimizationRequest::new(symbols.clone(), Method::Cvar)
        .with_weight_bounds(0.0, 0.4)
        .with_alpha(0.05);
    print_response("Minimum CVaR (95%)", &symbols, &engine.optimize(&request)?);

    // 3. Robust
    let request = OptimizationRequest::new(symbols.clone(), Method::Robust)
        .with_weight_bounds(0.0, 0.4)
        .with_uncertainty_radius(0.5);
    print_response("Robust (kappa = 0.5)", &symbols, &engine.optimize(&request)?);

    // 4. Efficient frontier
    println!("--- Efficient frontier ---");
    let frontier = engine.efficient_frontier(&EfficientFrontierRequest::new(symbols.clone()).with_num_points(8))?;
    println!("  {:>10}  {:>10}", "return %", "vol %");
    for point in &frontier.points {
        println!(
            "  {:>10.4}  {:>10.4}",
            point.return_value * 100.0,
            point.volatility * 100.0
        );
    }
    println!();

    // 5. Stress test
    println!("--- Stress test ---");
    let request = StressTestRequest {
        optimization: OptimizationRequest::new(symbols.clone(), Method::MeanVariance)
            .with_weight_bounds(0.0, 0.3),
        scenarios: cvxfolio::request::default_scenarios(),
    };
    let stressed = engine.stress_test(&request)?;
    println!("  Worst period: {:.4}%", stressed.report.worst_period_return * 100.0);
    println!("  Max drawdown: {:.4}%", stressed.report.max_drawdown * 100.0);
    for outcome in &stressed.report.scenarios {
        println!(
            "  {:<24} {:>8.4}%",
            outcome.scenario,
            outcome.portfolio_return * 100.0
        );
    }

    Ok(())
}
