//! Solver interface for cvxfolio.
//!
//! This module provides:
//! - Conic program assembly (variable blocks, affine rows, cones)
//! - Clarabel solver integration

pub mod clarabel;
pub mod program;

pub use self::clarabel::{solve, Settings, Solution, SolveStatus};
pub use program::{AffineRow, ConeDims, ConicProgram, StuffedProblem, VarBlock};
