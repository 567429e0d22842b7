//! Historical return series and the market data boundary.
//!
//! A [`ReturnSeries`] is a `T x N` matrix: rows are time periods (oldest
//! first), columns are assets. The engine never fetches data itself; it asks
//! a [`MarketData`] collaborator for a series and an optional sector map.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};

use crate::error::{PortfolioError, Result};

/// How to turn prices into returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    /// `p_t / p_{t-1} - 1`
    #[default]
    Simple,
    /// `ln(p_t / p_{t-1})`
    Log,
}

/// Per-asset return observations ordered by time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSeries {
    symbols: Vec<String>,
    data: DMatrix<f64>,
}

impl ReturnSeries {
    /// Create a series from a `T x N` matrix.
    ///
    /// Symbols must be unique and non-empty, one per column, and every value
    /// must be finite.
    pub fn new(symbols: Vec<String>, data: DMatrix<f64>) -> Result<Self> {
        if symbols.is_empty() {
            return Err(PortfolioError::invalid("symbols", "at least one symbol is required"));
        }
        if symbols.len() != data.ncols() {
            return Err(PortfolioError::shape(
                format!("{} columns", symbols.len()),
                format!("{} columns", data.ncols()),
            ));
        }
        check_unique(&symbols)?;
        if let Some(idx) = data.iter().position(|v| !v.is_finite()) {
            let (row, col) = (idx % data.nrows(), idx / data.nrows());
            return Err(PortfolioError::invalid(
                "returns",
                format!("non-finite value at period {} for {}", row, symbols[col]),
            ));
        }
        Ok(ReturnSeries { symbols, data })
    }

    /// Create a series from rows of observations (one `Vec` per period).
    pub fn from_rows(symbols: Vec<String>, rows: &[Vec<f64>]) -> Result<Self> {
        let n = symbols.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != n) {
            return Err(PortfolioError::shape(
                format!("{} values per row", n),
                format!("{} values", bad.len()),
            ));
        }
        let data = DMatrix::from_row_iterator(rows.len(), n, rows.iter().flatten().copied());
        Self::new(symbols, data)
    }

    /// Build returns from a `(T + 1) x N` price matrix.
    pub fn from_prices(symbols: Vec<String>, prices: &DMatrix<f64>, kind: ReturnKind) -> Result<Self> {
        if prices.nrows() < 2 {
            return Err(PortfolioError::InsufficientData {
                estimator: "returns from prices",
                required: 2,
                actual: prices.nrows(),
            });
        }
        if prices.iter().any(|p| !(*p > 0.0) || !p.is_finite()) {
            return Err(PortfolioError::invalid("prices", "prices must be finite and positive"));
        }
        let data = DMatrix::from_fn(prices.nrows() - 1, prices.ncols(), |t, j| {
            let ratio = prices[(t + 1, j)] / prices[(t, j)];
            match kind {
                ReturnKind::Simple => ratio - 1.0,
                ReturnKind::Log => ratio.ln(),
            }
        });
        Self::new(symbols, data)
    }

    /// Asset symbols in column order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// The raw `T x N` matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Number of time periods.
    pub fn num_observations(&self) -> usize {
        self.data.nrows()
    }

    /// Number of assets.
    pub fn num_assets(&self) -> usize {
        self.data.ncols()
    }

    /// Keep only the most recent `lookback` periods.
    pub fn tail(&self, lookback: usize) -> ReturnSeries {
        let t = self.data.nrows();
        let keep = lookback.min(t);
        ReturnSeries {
            symbols: self.symbols.clone(),
            data: self.data.rows(t - keep, keep).into_owned(),
        }
    }

    /// Reorder/subset the columns to match `symbols`.
    pub fn select(&self, symbols: &[String]) -> Result<ReturnSeries> {
        check_unique(symbols)?;
        let columns = symbols
            .iter()
            .map(|s| {
                self.symbols
                    .iter()
                    .position(|own| own == s)
                    .ok_or_else(|| PortfolioError::UnknownSymbol(s.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let data = DMatrix::from_fn(self.data.nrows(), columns.len(), |t, j| {
            self.data[(t, columns[j])]
        });
        Ok(ReturnSeries {
            symbols: symbols.to_vec(),
            data,
        })
    }

    /// Mean return of each asset.
    pub fn mean(&self) -> DVector<f64> {
        let t = self.data.nrows().max(1) as f64;
        DVector::from_iterator(
            self.data.ncols(),
            self.data.column_iter().map(|c| c.sum() / t),
        )
    }

    /// Portfolio return in every period, `r_t' w`.
    pub fn portfolio_returns(&self, weights: &DVector<f64>) -> Result<DVector<f64>> {
        if weights.len() != self.num_assets() {
            return Err(PortfolioError::shape(
                format!("{} weights", self.num_assets()),
                format!("{} weights", weights.len()),
            ));
        }
        Ok(&self.data * weights)
    }
}

fn check_unique(symbols: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for s in symbols {
        if s.trim().is_empty() {
            return Err(PortfolioError::invalid("symbols", "symbols must be non-empty"));
        }
        if !seen.insert(s.as_str()) {
            return Err(PortfolioError::invalid("symbols", format!("duplicate symbol {}", s)));
        }
    }
    Ok(())
}

/// The upstream data collaborator.
///
/// Implementations do the I/O (HTTP, database, cache); the engine only sees
/// the values they return.
pub trait MarketData {
    /// Returns for `symbols` over the last `lookback` periods.
    fn fetch_returns(&self, symbols: &[String], lookback: usize) -> Result<ReturnSeries>;

    /// Sector of each symbol. Symbols without a sector may be left out.
    fn fetch_sector_map(&self, _symbols: &[String]) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// A [`MarketData`] source backed by a preloaded series.
#[derive(Debug, Clone)]
pub struct InMemoryMarketData {
    returns: ReturnSeries,
    sectors: HashMap<String, String>,
}

impl InMemoryMarketData {
    /// Serve `returns` with no sector information.
    pub fn new(returns: ReturnSeries) -> Self {
        InMemoryMarketData {
            returns,
            sectors: HashMap::new(),
        }
    }

    /// Attach a symbol → sector map.
    pub fn with_sectors(mut self, sectors: HashMap<String, String>) -> Self {
        self.sectors = sectors;
        self
    }
}

impl MarketData for InMemoryMarketData {
    fn fetch_returns(&self, symbols: &[String], lookback: usize) -> Result<ReturnSeries> {
        if self.returns.num_observations() == 0 {
            return Err(PortfolioError::DataSource(format!(
                "no return history loaded for {}",
                symbols.join(", ")
            )));
        }
        Ok(self.returns.select(symbols)?.tail(lookback))
    }

    fn fetch_sector_map(&self, symbols: &[String]) -> Result<HashMap<String, String>> {
        Ok(symbols
            .iter()
            .filter_map(|s| self.sectors.get(s).map(|sector| (s.clone(), sector.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> ReturnSeries {
        ReturnSeries::from_rows(
            symbols(&["A", "B"]),
            &[vec![0.01, 0.02], vec![0.03, -0.02], vec![-0.01, 0.03]],
        )
        .unwrap()
    }

    #[test]
    fn test_from_rows_layout() {
        let r = sample();
        assert_eq!(r.num_observations(), 3);
        assert_eq!(r.num_assets(), 2);
        assert_eq!(r.matrix()[(1, 0)], 0.03);
        assert_eq!(r.matrix()[(1, 1)], -0.02);
    }

    #[test]
    fn test_mean() {
        let m = sample().mean();
        assert_relative_eq!(m[0], 0.01, epsilon = 1e-15);
        assert_relative_eq!(m[1], 0.01, epsilon = 1e-15);
    }

    #[test]
    fn test_tail_keeps_latest() {
        let r = sample().tail(2);
        assert_eq!(r.num_observations(), 2);
        assert_eq!(r.matrix()[(0, 0)], 0.03);
        assert_eq!(sample().tail(10).num_observations(), 3);
    }

    #[test]
    fn test_select_reorders() {
        let r = sample().select(&symbols(&["B", "A"])).unwrap();
        assert_eq!(r.symbols(), &symbols(&["B", "A"])[..]);
        assert_eq!(r.matrix()[(0, 0)], 0.02);
        assert!(matches!(
            sample().select(&symbols(&["C"])),
            Err(PortfolioError::UnknownSymbol(s)) if s == "C"
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_nan() {
        assert!(ReturnSeries::from_rows(symbols(&["A", "A"]), &[vec![0.0, 0.0]]).is_err());
        assert!(ReturnSeries::from_rows(symbols(&["A"]), &[vec![f64::NAN]]).is_err());
        assert!(ReturnSeries::from_rows(symbols(&["A", "B"]), &[vec![0.0]]).is_err());
    }

    #[test]
    fn test_from_prices() {
        let prices = DMatrix::from_row_slice(3, 1, &[100.0, 110.0, 99.0]);
        let simple = ReturnSeries::from_prices(symbols(&["A"]), &prices, ReturnKind::Simple).unwrap();
        assert_relative_eq!(simple.matrix()[(0, 0)], 0.10, epsilon = 1e-12);
        assert_relative_eq!(simple.matrix()[(1, 0)], -0.10, epsilon = 1e-12);

        let log = ReturnSeries::from_prices(symbols(&["A"]), &prices, ReturnKind::Log).unwrap();
        assert_relative_eq!(log.matrix()[(0, 0)], 1.1_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_portfolio_returns() {
        let w = DVector::from_vec(vec![0.5, 0.5]);
        let p = sample().portfolio_returns(&w).unwrap();
        assert_relative_eq!(p[0], 0.015, epsilon = 1e-15);
        assert_relative_eq!(p[1], 0.005, epsilon = 1e-15);
    }

    #[test]
    fn test_in_memory_source() {
        let mut sectors = HashMap::new();
        sectors.insert("A".to_string(), "Banks".to_string());
        let source = InMemoryMarketData::new(sample()).with_sectors(sectors);
        let r = source.fetch_returns(&symbols(&["B"]), 2).unwrap();
        assert_eq!(r.num_observations(), 2);
        let map = source.fetch_sector_map(&symbols(&["A", "B"])).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["A"], "Banks");
    }

    #[test]
    fn test_in_memory_source_without_history() {
        let empty = ReturnSeries::new(symbols(&["A", "B"]), DMatrix::zeros(0, 2)).unwrap();
        let err = InMemoryMarketData::new(empty)
            .fetch_returns(&symbols(&["A"]), 252)
            .unwrap_err();
        assert!(matches!(err, PortfolioError::DataSource(ref msg) if msg.contains("A")));
    }
}
