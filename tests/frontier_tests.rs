//! Efficient frontier tests on the synthetic five-asset universe.

mod common;

use approx::assert_relative_eq;
use cvxfolio::constraints::ConstraintSet;
use cvxfolio::covariance::CovarianceMatrix;
use cvxfolio::frontier::EfficientFrontierTracer;
use cvxfolio::optimizer::{MeanVarianceOptimizer, OptimizationInputs};
use cvxfolio::request::EfficientFrontierRequest;
use cvxfolio::returns::InMemoryMarketData;
use cvxfolio::{EngineConfig, PortfolioEngine, PortfolioError};
use nalgebra::DMatrix;

fn engine() -> PortfolioEngine<InMemoryMarketData> {
    PortfolioEngine::new(InMemoryMarketData::new(common::five_asset_series(5)))
}

#[test]
fn test_frontier_is_monotone() {
    let request = EfficientFrontierRequest::new(common::symbols(5))
        .with_num_points(15)
        .with_shrinkage(false);
    let frontier = engine().efficient_frontier(&request).unwrap();

    assert_eq!(frontier.points.len(), 15);
    for (i, pair) in frontier.points.windows(2).enumerate() {
        assert!(
            pair[1].return_value >= pair[0].return_value,
            "return decreases between points {} and {}",
            i,
            i + 1
        );
        assert!(
            pair[1].volatility >= pair[0].volatility - 1e-9,
            "volatility decreases between points {} and {}",
            i,
            i + 1
        );
    }
}

#[test]
fn test_min_variance_point_has_lowest_volatility() {
    let request = EfficientFrontierRequest::new(common::symbols(5)).with_num_points(10);
    let frontier = engine().efficient_frontier(&request).unwrap();

    let first = &frontier.points[0];
    assert_relative_eq!(first.return_value, frontier.min_variance_return, epsilon = 1e-12);
    assert_relative_eq!(first.volatility, frontier.min_variance_volatility, epsilon = 1e-12);
    for point in &frontier.points {
        assert!(point.volatility >= frontier.min_variance_volatility - 1e-9);
        assert!((point.weights.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(point.weights.iter().all(|w| *w >= -1e-9));
    }
    assert!(frontier.metadata.solver_iterations > 0);
}

#[test]
fn test_frontier_matches_analytic_min_variance() {
    // Long-only GMV of the equal-correlation universe is interior, so it
    // equals Σ⁻¹1 / 1'Σ⁻¹1.
    let cov = common::target_covariance();
    let ones = nalgebra::DVector::from_element(5, 1.0);
    let raw = nalgebra::Cholesky::new(cov.clone()).unwrap().solve(&ones);
    let gmv = &raw / raw.sum();

    let request = EfficientFrontierRequest::new(common::symbols(5))
        .with_num_points(4)
        .with_shrinkage(false);
    let frontier = engine().efficient_frontier(&request).unwrap();

    assert_relative_eq!(
        frontier.min_variance_volatility,
        common::volatility(&gmv, &cov),
        max_relative = 1e-4
    );
}

#[test]
fn test_parallel_and_sequential_agree() {
    let cov = CovarianceMatrix::from_matrix(common::target_covariance()).unwrap();
    let mean = common::target_mean();
    let scenarios = DMatrix::zeros(0, 5);
    let constraints = ConstraintSet::builder(5).weight_bounds(0.0, 0.35).build().unwrap();
    let inputs = OptimizationInputs::new(&mean, &cov, &scenarios, &constraints).unwrap();

    let parallel = EfficientFrontierTracer::new(MeanVarianceOptimizer::new())
        .trace(&inputs, 9)
        .unwrap();
    let sequential = EfficientFrontierTracer::from_config(&EngineConfig::default().with_parallel_frontier(false))
        .trace(&inputs, 9)
        .unwrap();

    assert_eq!(parallel.points.len(), sequential.points.len());
    for (p, s) in parallel.points.iter().zip(&sequential.points) {
        assert_relative_eq!(p.return_value, s.return_value, epsilon = 1e-12);
        assert_relative_eq!(p.volatility, s.volatility, epsilon = 1e-9);
    }
}

#[test]
fn test_max_sharpe_point_is_near_tangency() {
    let request = EfficientFrontierRequest::new(common::symbols(5))
        .with_num_points(40)
        .with_shrinkage(false);
    let traced = engine().efficient_frontier(&request).unwrap();

    let cov = common::target_covariance();
    let tangency = common::tangency_weights(&common::target_mean(), &cov);
    let best = traced
        .points
        .iter()
        .max_by(|a, b| (a.return_value / a.volatility).total_cmp(&(b.return_value / b.volatility)))
        .unwrap();
    assert_relative_eq!(best.volatility, common::volatility(&tangency, &cov), max_relative = 0.05);
}

#[test]
fn test_rejects_too_few_points() {
    let request = EfficientFrontierRequest::new(common::symbols(5)).with_num_points(1);
    let err = engine().efficient_frontier(&request).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { parameter, .. } if parameter == "num_points"));
}
