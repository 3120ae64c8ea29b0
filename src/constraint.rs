//! Implicit constraints: a differentiable function plus comparison
//! semantics.
//!
//! An [`ImplicitConstraint`] turns a function `f` into the statement
//! `f(q) ⊖ rhs ∼ 0`, where `∼` is chosen per output-derivative row by a
//! [`ComparisonType`]. Rows can be excluded from participation through an
//! `active_rows` selection, and equality rows may carry a
//! time-parameterized right-hand side.

use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;

use crate::blocks::BlockIndices;
use crate::function::DifferentiableFunction;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How one output-derivative row of a constraint is compared against its
/// right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ComparisonType {
    /// `f(q) = rhs`, with a parameterizable right-hand side.
    Equality,
    /// `f(q) = 0`; the right-hand side is pinned to zero.
    EqualToZero,
    /// `f(q) ≥ 0` is feasible.
    Superior,
    /// `f(q) ≤ 0` is feasible.
    Inferior,
}

impl ComparisonType {
    /// Whether this row is an inequality (Superior or Inferior).
    #[must_use]
    pub const fn is_inequality(self) -> bool {
        matches!(self, Self::Superior | Self::Inferior)
    }
}

/// A time-parameterized right-hand side, evaluated by
/// [`crate::HierarchicalSolver::right_hand_side_at`].
pub trait RhsFunction: Send + Sync {
    /// Evaluate the right-hand side at parameter `s` into `out`
    /// (ambient output size of the constraint function).
    fn value_at(&self, s: f64, out: &mut DVector<f64>);
}

impl<F> RhsFunction for F
where
    F: Fn(f64, &mut DVector<f64>) + Send + Sync,
{
    fn value_at(&self, s: f64, out: &mut DVector<f64>) {
        self(s, out);
    }
}

/// A differentiable function with per-row comparison semantics and an
/// active-row selection.
///
/// Constraints are immutable once built and shared by `Arc`: cloning a
/// solver clones the handles, never the math, which is what makes two
/// solver instances independently usable from different threads.
#[derive(Clone)]
pub struct ImplicitConstraint {
    function: Arc<dyn DifferentiableFunction>,
    comparison: Vec<ComparisonType>,
    active_rows: BlockIndices,
    rhs_function: Option<Arc<dyn RhsFunction>>,
}

impl fmt::Debug for ImplicitConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplicitConstraint")
            .field("function", &self.function.name())
            .field("comparison", &self.comparison)
            .field("active_rows", &self.active_rows)
            .field("has_rhs_function", &self.rhs_function.is_some())
            .finish()
    }
}

impl ImplicitConstraint {
    /// Wrap a function as an equal-to-zero constraint on all rows.
    #[must_use]
    pub fn new(function: Arc<dyn DifferentiableFunction>) -> Self {
        let nv = function.output_space().nv();
        Self {
            active_rows: BlockIndices::range(0, nv),
            comparison: vec![ComparisonType::EqualToZero; nv],
            function,
            rhs_function: None,
        }
    }

    /// Wrap a function with an explicit comparison vector (one entry per
    /// output-derivative row).
    #[must_use]
    pub fn with_comparison(
        function: Arc<dyn DifferentiableFunction>,
        comparison: Vec<ComparisonType>,
    ) -> Self {
        debug_assert_eq!(comparison.len(), function.output_space().nv());
        let nv = function.output_space().nv();
        Self {
            active_rows: BlockIndices::range(0, nv),
            comparison,
            function,
            rhs_function: None,
        }
    }

    /// Restrict which output-derivative rows participate.
    #[must_use]
    pub fn with_active_rows(mut self, active_rows: BlockIndices) -> Self {
        self.active_rows = active_rows;
        self
    }

    /// Attach a time-parameterized right-hand side.
    #[must_use]
    pub fn with_rhs_function(mut self, rhs: Arc<dyn RhsFunction>) -> Self {
        self.rhs_function = Some(rhs);
        self
    }

    /// The wrapped function.
    #[must_use]
    pub fn function(&self) -> &Arc<dyn DifferentiableFunction> {
        &self.function
    }

    /// Per-row comparison semantics.
    #[must_use]
    pub fn comparison(&self) -> &[ComparisonType] {
        &self.comparison
    }

    /// The participating output-derivative rows.
    #[must_use]
    pub fn active_rows(&self) -> &BlockIndices {
        &self.active_rows
    }

    /// The time-parameterized right-hand side, if any.
    #[must_use]
    pub fn rhs_function(&self) -> Option<&Arc<dyn RhsFunction>> {
        self.rhs_function.as_ref()
    }

    /// Dimension of the parameterizable part of the right-hand side: the
    /// number of equality rows.
    #[must_use]
    pub fn parameter_size(&self) -> usize {
        self.comparison
            .iter()
            .filter(|c| **c == ComparisonType::Equality)
            .count()
    }

    /// Content hash, inherited from the function.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.function.fingerprint()
    }

    /// Value equality: same mathematical function.
    #[must_use]
    pub fn same_function(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }

    /// Zero the rows of a tangent-sized vector that are not in
    /// `active_rows`.
    pub fn set_inactive_rows_to_zero(&self, v: &mut DVector<f64>) {
        let all = BlockIndices::range(0, self.function.output_space().nv());
        for s in all.difference(&self.active_rows).segments() {
            v.rows_mut(s.start, s.len).fill(0.0);
        }
    }

    /// Define a right-hand side from a configuration: `f(q)`, restricted
    /// to the equality rows (the logarithm is zeroed elsewhere and
    /// re-exponentiated). `out` must have the ambient output size.
    pub fn right_hand_side_from_config(&self, q: &DVector<f64>, out: &mut DVector<f64>) {
        let space = self.function.output_space();
        debug_assert_eq!(out.len(), space.nq());
        self.function.value(q, out);
        let neutral = space.neutral();
        let mut log = DVector::zeros(space.nv());
        space.difference(out, &neutral, &mut log);
        for (k, comp) in self.comparison.iter().enumerate() {
            if *comp != ComparisonType::Equality {
                log[k] = 0.0;
            }
        }
        space.integrate(&neutral, &log, out);
    }

    /// Whether `rhs` is admissible: its logarithm must vanish on every
    /// non-equality row.
    #[must_use]
    pub fn check_right_hand_side(&self, rhs: &DVector<f64>) -> bool {
        let space = self.function.output_space();
        if rhs.len() != space.nq() {
            return false;
        }
        let mut log = DVector::zeros(space.nv());
        space.difference(rhs, &space.neutral(), &mut log);
        self.comparison
            .iter()
            .enumerate()
            .all(|(k, c)| *c == ComparisonType::Equality || log[k].abs() < 1e-10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::AffineFunction;
    use nalgebra::DMatrix;

    fn affine(rows: usize, cols: usize) -> Arc<dyn DifferentiableFunction> {
        Arc::new(AffineFunction::new(
            "test",
            DMatrix::identity(rows, cols),
            DVector::zeros(rows),
        ))
    }

    #[test]
    fn default_comparison_is_equal_to_zero() {
        let c = ImplicitConstraint::new(affine(3, 3));
        assert_eq!(c.comparison(), &[ComparisonType::EqualToZero; 3]);
        assert_eq!(c.parameter_size(), 0);
        assert_eq!(c.active_rows().nb_indices(), 3);
    }

    #[test]
    fn parameter_size_counts_equality_rows() {
        let c = ImplicitConstraint::with_comparison(
            affine(3, 3),
            vec![
                ComparisonType::Equality,
                ComparisonType::Superior,
                ComparisonType::Equality,
            ],
        );
        assert_eq!(c.parameter_size(), 2);
        assert!(c.comparison()[1].is_inequality());
    }

    #[test]
    fn inactive_rows_are_zeroed() {
        let c = ImplicitConstraint::new(affine(4, 4))
            .with_active_rows(BlockIndices::from_segments(vec![
                crate::segment::Segment::new(1, 2),
            ]));
        let mut v = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        c.set_inactive_rows_to_zero(&mut v);
        assert_eq!(v, DVector::from_vec(vec![0.0, 2.0, 3.0, 0.0]));
    }

    #[test]
    fn rhs_check_requires_zero_on_non_equality_rows() {
        let c = ImplicitConstraint::with_comparison(
            affine(2, 2),
            vec![ComparisonType::Equality, ComparisonType::Superior],
        );
        assert!(c.check_right_hand_side(&DVector::from_vec(vec![5.0, 0.0])));
        assert!(!c.check_right_hand_side(&DVector::from_vec(vec![5.0, 1.0])));
        assert!(!c.check_right_hand_side(&DVector::from_vec(vec![5.0])));
    }
}
