//! Hierarchical iterative constraint solver for robot configuration
//! spaces.
//!
//! This crate finds configurations satisfying a prioritized stack of
//! nonlinear equality and inequality constraints on a configuration
//! space with rotational components:
//!
//! - [`HierarchicalSolver`] - the engine: stacked pseudo-inverse descent
//!   with nullspace projection between priority levels
//! - [`ConfigSpace`] - configuration-space arithmetic (ℝⁿ, SO(3),
//!   products)
//! - [`ImplicitConstraint`] / [`DifferentiableFunction`] - the constraint
//!   seam
//! - [`Saturation`] - variable-bound policies, including robot joint
//!   limits
//! - [`LineSearch`] - pluggable step-size rules
//! - [`BlockIndices`] / [`Segment`] - the interval algebra addressing
//!   reduced sub-blocks of vectors and matrices
//!
//! # Layer 0 Crate
//!
//! No engine or GUI dependencies: usable from CLI tools, servers, test
//! rigs and language bindings.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use sim_ik::{
//!     AffineFunction, ComparisonType, ConfigSpace, Constant, HierarchicalSolver,
//!     ImplicitConstraint, Status,
//! };
//! use std::sync::Arc;
//!
//! // Find q in R^3 with q0 = 1 and q1 = 2.
//! let mut solver = HierarchicalSolver::new(ConfigSpace::vector(3));
//! solver.set_squared_error_threshold(1e-8);
//! solver.set_max_iterations(10);
//!
//! let f = AffineFunction::new(
//!     "goal",
//!     DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
//!     DVector::from_vec(vec![1.0, 2.0]),
//! );
//! let constraint = ImplicitConstraint::with_comparison(
//!     Arc::new(f),
//!     vec![ComparisonType::Equality; 2],
//! );
//! solver.add(constraint, 0).expect("fresh constraint");
//!
//! let mut q = DVector::zeros(3);
//! let status = solver.solve(&mut q, &mut Constant::default());
//! assert_eq!(status, Status::Success);
//! assert!((q[0] - 1.0).abs() < 1e-4 && (q[1] - 2.0).abs() < 1e-4);
//! ```
//!
//! # Priorities and nullspace projection
//!
//! Constraints are grouped into priority levels. Each iteration solves
//! the levels in order: the step of level `k` is computed through the
//! pseudo-inverse of its reduced Jacobian projected onto the nullspace
//! of every level above it, so lower priorities can never degrade higher
//! ones. Saturated variables are excluded from the step when they push
//! against an active bound, and a pluggable line search controls the
//! update magnitude.
//!
//! # Snapshots
//!
//! With the `serde` feature, `snapshot::SolverSnapshot` captures the
//! solver's declarative configuration (not its runtime state) and
//! rebuilds it through an explicit function registry.

// Safety: Deny unwrap/expect in library code. Tests may use them.
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blocks;
pub mod constraint;
mod data;
pub mod error;
pub mod function;
pub mod line_search;
pub mod saturation;
pub mod segment;
#[cfg(feature = "serde")]
pub mod snapshot;
pub mod solver;
pub mod space;

// Re-export core types
pub use blocks::{BlockIndices, MatrixBlocks};
pub use constraint::{ComparisonType, ImplicitConstraint, RhsFunction};
pub use error::SolverError;
#[cfg(feature = "serde")]
pub use error::SnapshotError;
pub use function::{AffineFunction, DifferentiableFunction, FunctionSpec, SpaceIdentity};
pub use line_search::{Backtracking, Constant, ErrorNormBased, FixedSequence, LineSearch};
pub use saturation::{DeviceLimits, Saturation};
pub use segment::Segment;
#[cfg(feature = "serde")]
pub use snapshot::{FunctionRegistry, SolverSnapshot};
pub use solver::{HierarchicalSolver, Status, SVD_THRESHOLD};
pub use space::ConfigSpace;

// Re-export nalgebra types for convenience
pub use nalgebra::{DMatrix, DVector};
