//! Validated portfolio constraints.
//!
//! A [`ConstraintSet`] can only be obtained through
//! [`ConstraintSetBuilder::build`], which range-checks every parameter and
//! rejects constraint sets whose feasible region is empty by construction
//! (bounds or sector caps that make the budget unreachable). Solvers never
//! see an unvalidated constraint.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DVector;
use tracing::debug;

use crate::error::{PortfolioError, Result};
use crate::solver::{AffineRow, ConicProgram, VarBlock};

/// Slack allowed in the analytic feasibility checks.
const FEASIBILITY_TOL: f64 = 1e-12;

/// Aggregate weight cap on the assets of one sector.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorCap {
    /// Sector name.
    pub sector: String,
    /// Maximum aggregate weight.
    pub cap: f64,
    /// Asset indices belonging to the sector.
    pub members: Vec<usize>,
}

/// Budget, bounds, sector caps and risk caps for one optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintSet {
    long_only: bool,
    lower: Vec<f64>,
    upper: Vec<f64>,
    sectors: Vec<SectorCap>,
    hhi_max: Option<f64>,
    cvar_max: Option<f64>,
    volatility_max: Option<f64>,
}

impl ConstraintSet {
    /// Start building constraints for `num_assets` assets.
    ///
    /// Defaults: long-only, bounds `[0, 1]`, no sector or risk caps.
    pub fn builder(num_assets: usize) -> ConstraintSetBuilder {
        ConstraintSetBuilder {
            num_assets,
            long_only: true,
            min_weight: vec![0.0; num_assets],
            max_weight: vec![1.0; num_assets],
            sector_caps: BTreeMap::new(),
            assignments: vec![None; num_assets],
            hhi_max: None,
            cvar_max: None,
            volatility_max: None,
            unknown_asset: None,
        }
    }

    /// Number of assets.
    pub fn num_assets(&self) -> usize {
        self.lower.len()
    }

    /// Whether short positions are disallowed.
    pub fn is_long_only(&self) -> bool {
        self.long_only
    }

    /// Per-asset lower bounds.
    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    /// Per-asset upper bounds.
    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Sector caps with at least one member.
    pub fn sectors(&self) -> &[SectorCap] {
        &self.sectors
    }

    /// Maximum Herfindahl–Hirschman index `Σ wᵢ²`.
    pub fn hhi_max(&self) -> Option<f64> {
        self.hhi_max
    }

    /// Maximum CVaR.
    pub fn cvar_max(&self) -> Option<f64> {
        self.cvar_max
    }

    /// Maximum volatility.
    pub fn volatility_max(&self) -> Option<f64> {
        self.volatility_max
    }

    /// Add budget, bound, sector and HHI constraints on `w` to `program`.
    ///
    /// Risk caps that need market data (volatility, CVaR) are added by the
    /// optimizers.
    pub fn apply(&self, program: &mut ConicProgram, w: VarBlock) {
        debug_assert_eq!(w.len, self.num_assets());

        program.equal_zero(AffineRow::new().terms(w.columns().map(|c| (c, 1.0))).plus(-1.0));

        for i in 0..w.len {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            if hi - lo <= FEASIBILITY_TOL {
                program.equal_zero(AffineRow::new().term(w.at(i), 1.0).plus(-lo));
                continue;
            }
            program.nonneg(AffineRow::new().term(w.at(i), 1.0).plus(-lo));
            program.nonneg(AffineRow::constant(hi).term(w.at(i), -1.0));
        }

        for sector in &self.sectors {
            program.nonneg(
                AffineRow::constant(sector.cap).terms(sector.members.iter().map(|&i| (w.at(i), -1.0))),
            );
        }

        if let Some(hhi) = self.hhi_max {
            let mut rows = vec![AffineRow::constant(hhi.sqrt())];
            rows.extend(w.columns().map(|c| AffineRow::new().term(c, 1.0)));
            program.second_order(rows);
        }
    }

    /// Snap solver output onto the bounds and restore the budget exactly.
    ///
    /// Interior-point solutions sit within the solver tolerance of the
    /// feasible set; this removes that residue. The budget residual only
    /// goes to assets with room under their bound and their sector cap, and
    /// is spread so that `Σ wᵢ²` grows as little as possible.
    pub fn project(&self, weights: &DVector<f64>) -> DVector<f64> {
        let mut w = DVector::from_fn(weights.len(), |i, _| {
            weights[i].clamp(self.lower[i], self.upper[i])
        });

        let residual = 1.0 - w.sum();
        if residual != 0.0 {
            let room = self.budget_room(&w, residual > 0.0);
            level_fill(&mut w, residual, &room);
        }
        w
    }

    /// How far each weight may move toward the budget.
    fn budget_room(&self, w: &DVector<f64>, adding: bool) -> Vec<f64> {
        let n = w.len();
        if !adding {
            return (0..n).map(|i| (w[i] - self.lower[i]).max(0.0)).collect();
        }
        let mut room: Vec<f64> = (0..n).map(|i| (self.upper[i] - w[i]).max(0.0)).collect();
        for sector in &self.sectors {
            let used: f64 = sector.members.iter().map(|&i| w[i]).sum();
            let free: f64 = sector.members.iter().map(|&i| room[i]).sum();
            let headroom = (sector.cap - used).max(0.0);
            if free > headroom {
                let scale = headroom / free;
                for &i in &sector.members {
                    room[i] *= scale;
                }
            }
        }
        room
    }

    /// Check `weights` against the budget, bounds, sector and HHI caps.
    pub fn is_satisfied_by(&self, weights: &DVector<f64>, tol: f64) -> bool {
        if weights.len() != self.num_assets() || (weights.sum() - 1.0).abs() > tol {
            return false;
        }
        let within_bounds = weights
            .iter()
            .enumerate()
            .all(|(i, &w)| w >= self.lower[i] - tol && w <= self.upper[i] + tol);
        let within_sectors = self
            .sectors
            .iter()
            .all(|s| s.members.iter().map(|&i| weights[i]).sum::<f64>() <= s.cap + tol);
        let within_hhi = self
            .hhi_max
            .map_or(true, |h| weights.norm_squared() <= h + tol);
        within_bounds && within_sectors && within_hhi
    }
}

/// Move `w` by `residual` in total and by at most `room[i]` per asset.
///
/// Weights are raised (or, for a negative residual, lowered) toward a common
/// level, which is the move of least `Σ wᵢ²`.
fn level_fill(w: &mut DVector<f64>, residual: f64, room: &[f64]) {
    let total: f64 = room.iter().sum();
    if !(total > 0.0) {
        return;
    }
    let amount = residual.abs().min(total);
    let sign = residual.signum();
    // Lowering w is raising -w.
    let start: Vec<f64> = w.iter().map(|&x| sign * x).collect();
    let moved = |level: f64| -> f64 {
        start.iter().zip(room).map(|(&x, &r)| (level - x).clamp(0.0, r)).sum()
    };

    let mut lo = start.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = start.iter().zip(room).map(|(&x, &r)| x + r).fold(f64::NEG_INFINITY, f64::max);
    for _ in 0..128 {
        let mid = 0.5 * (lo + hi);
        if moved(mid) < amount {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    for (i, (&x, &r)) in start.iter().zip(room).enumerate() {
        w[i] = sign * (x + (hi - x).clamp(0.0, r));
    }
}

/// Builder for [`ConstraintSet`].
#[derive(Debug, Clone)]
pub struct ConstraintSetBuilder {
    num_assets: usize,
    long_only: bool,
    min_weight: Vec<f64>,
    max_weight: Vec<f64>,
    sector_caps: BTreeMap<String, f64>,
    assignments: Vec<Option<String>>,
    hhi_max: Option<f64>,
    cvar_max: Option<f64>,
    volatility_max: Option<f64>,
    unknown_asset: Option<usize>,
}

impl ConstraintSetBuilder {
    /// Allow or disallow short positions.
    pub fn long_only(mut self, long_only: bool) -> Self {
        self.long_only = long_only;
        self
    }

    /// The same `[min, max]` bounds for every asset.
    pub fn weight_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_weight = vec![min; self.num_assets];
        self.max_weight = vec![max; self.num_assets];
        self
    }

    /// Bounds for a single asset. An index past the asset count makes
    /// [`build`](Self::build) fail.
    pub fn asset_bounds(mut self, asset: usize, min: f64, max: f64) -> Self {
        if asset < self.num_assets {
            self.min_weight[asset] = min;
            self.max_weight[asset] = max;
        } else {
            self.unknown_asset.get_or_insert(asset);
        }
        self
    }

    /// Sector caps plus the sector of each asset (in asset order).
    pub fn sector_caps(mut self, caps: HashMap<String, f64>, assignments: Vec<Option<String>>) -> Self {
        self.sector_caps = caps.into_iter().collect();
        self.assignments = assignments;
        self
    }

    /// Cap on `Σ wᵢ²`.
    pub fn hhi_max(mut self, hhi: f64) -> Self {
        self.hhi_max = Some(hhi);
        self
    }

    /// Cap on portfolio CVaR.
    pub fn cvar_max(mut self, cvar: f64) -> Self {
        self.cvar_max = Some(cvar);
        self
    }

    /// Cap on portfolio volatility.
    pub fn volatility_max(mut self, vol: f64) -> Self {
        self.volatility_max = Some(vol);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ConstraintSet> {
        let n = self.num_assets;
        if n == 0 {
            return Err(PortfolioError::invalid("symbols", "at least one asset is required"));
        }
        if let Some(asset) = self.unknown_asset {
            return Err(PortfolioError::shape(
                format!("asset index below {}", n),
                format!("asset index {}", asset),
            ));
        }
        if self.assignments.len() != n {
            return Err(PortfolioError::shape(
                format!("{} sector assignments", n),
                format!("{}", self.assignments.len()),
            ));
        }

        for i in 0..n {
            let (lo, hi) = (self.min_weight[i], self.max_weight[i]);
            if !lo.is_finite() {
                return Err(PortfolioError::invalid("min_weight", format!("asset {}: must be finite", i)));
            }
            if !hi.is_finite() {
                return Err(PortfolioError::invalid("max_weight", format!("asset {}: must be finite", i)));
            }
            if lo > hi {
                return Err(PortfolioError::invalid(
                    "min_weight",
                    format!("asset {}: min_weight {} exceeds max_weight {}", i, lo, hi),
                ));
            }
            if self.long_only && lo < 0.0 {
                return Err(PortfolioError::invalid(
                    "min_weight",
                    format!("asset {}: negative minimum {} with long-only", i, lo),
                ));
            }
            if self.long_only && hi < 0.0 {
                return Err(PortfolioError::invalid(
                    "max_weight",
                    format!("asset {}: negative maximum {} with long-only", i, hi),
                ));
            }
        }

        let lower = self.min_weight;
        let upper = self.max_weight;
        let sum_lower: f64 = lower.iter().sum();
        let sum_upper: f64 = upper.iter().sum();
        if sum_lower > 1.0 + FEASIBILITY_TOL {
            return Err(PortfolioError::infeasible(
                "min_weight",
                format!("minimum weights sum to {} > 1", sum_lower),
            ));
        }
        if sum_upper < 1.0 - FEASIBILITY_TOL {
            return Err(PortfolioError::infeasible(
                "max_weight",
                format!("maximum weights sum to {} < 1", sum_upper),
            ));
        }

        let mut sectors = Vec::new();
        for (sector, cap) in self.sector_caps {
            if !cap.is_finite() || cap < 0.0 {
                return Err(PortfolioError::invalid(
                    "sector_constraints",
                    format!("cap for {} must be a finite value >= 0, got {}", sector, cap),
                ));
            }
            let members: Vec<usize> = self
                .assignments
                .iter()
                .enumerate()
                .filter(|(_, s)| s.as_deref() == Some(sector.as_str()))
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                debug!(sector = %sector, "sector cap has no member assets; ignoring");
                continue;
            }
            let floor: f64 = members.iter().map(|&i| lower[i]).sum();
            if floor > cap + FEASIBILITY_TOL {
                return Err(PortfolioError::infeasible(
                    "sector_constraints",
                    format!("minimum weights in {} sum to {} > cap {}", sector, floor, cap),
                ));
            }
            sectors.push(SectorCap { sector, cap, members });
        }

        // Each asset has at most one sector, so the largest reachable total
        // is every capped sector at min(cap, Σ max) plus every other asset at
        // its max.
        let mut capped = vec![false; n];
        let mut reachable = 0.0;
        for s in &sectors {
            let ceiling: f64 = s.members.iter().map(|&i| upper[i]).sum();
            reachable += ceiling.min(s.cap);
            for &i in &s.members {
                capped[i] = true;
            }
        }
        reachable += (0..n).filter(|&i| !capped[i]).map(|i| upper[i]).sum::<f64>();
        if reachable < 1.0 - FEASIBILITY_TOL {
            return Err(PortfolioError::infeasible(
                "sector_constraints",
                format!("sector caps limit the total weight to {} < 1", reachable),
            ));
        }

        if let Some(hhi) = self.hhi_max {
            if !hhi.is_finite() || hhi <= 0.0 {
                return Err(PortfolioError::invalid("hhi_max", format!("must be > 0, got {}", hhi)));
            }
            // Σw = 1 forces Σw² >= 1/N.
            if hhi < 1.0 / n as f64 - FEASIBILITY_TOL {
                return Err(PortfolioError::infeasible(
                    "hhi_max",
                    format!("{} is below the minimum attainable HHI 1/{}", hhi, n),
                ));
            }
        }
        if let Some(cvar) = self.cvar_max {
            if !cvar.is_finite() {
                return Err(PortfolioError::invalid("cvar_max", "must be finite"));
            }
        }
        if let Some(vol) = self.volatility_max {
            if !vol.is_finite() || vol <= 0.0 {
                return Err(PortfolioError::invalid(
                    "volatility_max",
                    format!("must be > 0, got {}", vol),
                ));
            }
        }

        Ok(ConstraintSet {
            long_only: self.long_only,
            lower,
            upper,
            sectors,
            hhi_max: self.hhi_max,
            cvar_max: self.cvar_max,
            volatility_max: self.volatility_max,
        })
    }
}
