//! Differentiable functions over configuration spaces.
//!
//! The solver only ever sees constraints through the
//! [`DifferentiableFunction`] trait: a value, a Jacobian expressed in the
//! output's tangent frame, size metadata and activity masks. Functions
//! compare by value through a content [`fingerprint`], never by pointer
//! identity, so the same mathematical constraint added twice is detected
//! regardless of how it was constructed.
//!
//! Two built-ins cover the common cases and seed the snapshot registry:
//! [`AffineFunction`] (`f(q) = A·q − b`) and [`SpaceIdentity`]
//! (`f(q) = q` on an arbitrary space, the shape of pose-goal
//! constraints).
//!
//! [`fingerprint`]: DifferentiableFunction::fingerprint

use std::fmt;
use std::hash::{Hash, Hasher};

use nalgebra::{DMatrix, DVector};

use crate::space::ConfigSpace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A differentiable map from a configuration space into a (possibly
/// Lie-group valued) output space.
pub trait DifferentiableFunction: fmt::Debug + Send + Sync {
    /// Human-readable name, used in error messages and pretty printing.
    fn name(&self) -> &str;

    /// Ambient size of the input configuration.
    fn input_size(&self) -> usize;

    /// Tangent dimension of the input configuration.
    fn input_derivative_size(&self) -> usize;

    /// The space the output lives on. Its `nq`/`nv` are the output size
    /// and output derivative size.
    fn output_space(&self) -> &ConfigSpace;

    /// Evaluate the function at `q` into `out` (length `output_size`).
    fn value(&self, q: &DVector<f64>, out: &mut DVector<f64>);

    /// Evaluate the Jacobian at `q` into `out`
    /// (`output_derivative_size × input_derivative_size`), expressed in
    /// the output's local tangent frame.
    fn jacobian(&self, q: &DVector<f64>, out: &mut DMatrix<f64>);

    /// Which ambient input coordinates the value depends on. Defaults to
    /// all of them.
    fn active_parameters(&self) -> Vec<bool> {
        vec![true; self.input_size()]
    }

    /// Which tangent input coordinates the Jacobian depends on. Defaults
    /// to all of them.
    fn active_derivative_parameters(&self) -> Vec<bool> {
        vec![true; self.input_derivative_size()]
    }

    /// Content hash: two functions describing the same mathematical map
    /// must return the same value. The solver indexes constraints by this
    /// hash.
    fn fingerprint(&self) -> u64;

    /// Declarative description for snapshots, or `None` when the function
    /// cannot be captured.
    fn spec(&self) -> Option<FunctionSpec> {
        None
    }
}

/// Output size in ambient coordinates (`nq` of the output space).
#[must_use]
pub fn output_size(f: &dyn DifferentiableFunction) -> usize {
    f.output_space().nq()
}

/// Output size in tangent coordinates (`nv` of the output space).
#[must_use]
pub fn output_derivative_size(f: &dyn DifferentiableFunction) -> usize {
    f.output_space().nv()
}

/// Declarative description of a function, rebuilt through a tag-string
/// factory registry.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunctionSpec {
    /// Registry tag naming the concrete function type.
    pub tag: String,
    /// Function name, restored verbatim. Not part of the fingerprint:
    /// equality is mathematical content, not labeling.
    pub name: String,
    /// Output space of the function.
    pub space: ConfigSpace,
    /// Integer shape parameters, meaning defined per tag.
    pub dims: Vec<usize>,
    /// Flat numeric parameters, meaning defined per tag.
    pub params: Vec<f64>,
}

impl FunctionSpec {
    /// Content hash of the description. The default implementation of
    /// function fingerprints for snapshottable functions.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.tag.hash(&mut h);
        self.dims.hash(&mut h);
        self.space.nq().hash(&mut h);
        self.space.nv().hash(&mut h);
        for p in &self.params {
            p.to_bits().hash(&mut h);
        }
        h.finish()
    }
}

/// The affine map `f(q) = A·q − b` on a vector input space.
#[derive(Debug, Clone)]
pub struct AffineFunction {
    name: String,
    a: DMatrix<f64>,
    b: DVector<f64>,
    space: ConfigSpace,
}

impl AffineFunction {
    /// Registry tag of this function type.
    pub const TAG: &'static str = "affine";

    /// Build `f(q) = A·q − b`. The output space is ℝ^rows.
    #[must_use]
    pub fn new(name: impl Into<String>, a: DMatrix<f64>, b: DVector<f64>) -> Self {
        debug_assert_eq!(a.nrows(), b.len());
        let space = ConfigSpace::vector(a.nrows());
        Self { name: name.into(), a, b, space }
    }
}

impl DifferentiableFunction for AffineFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_size(&self) -> usize {
        self.a.ncols()
    }

    fn input_derivative_size(&self) -> usize {
        self.a.ncols()
    }

    fn output_space(&self) -> &ConfigSpace {
        &self.space
    }

    fn value(&self, q: &DVector<f64>, out: &mut DVector<f64>) {
        out.copy_from(&(&self.a * q - &self.b));
    }

    fn jacobian(&self, _q: &DVector<f64>, out: &mut DMatrix<f64>) {
        out.copy_from(&self.a);
    }

    fn active_derivative_parameters(&self) -> Vec<bool> {
        // A column of zeros cannot influence the value.
        (0..self.a.ncols())
            .map(|c| self.a.column(c).iter().any(|&x| x != 0.0))
            .collect()
    }

    fn fingerprint(&self) -> u64 {
        self.spec().map_or(0, |s| s.fingerprint())
    }

    fn spec(&self) -> Option<FunctionSpec> {
        let mut params = Vec::with_capacity(self.a.len() + self.b.len());
        for r in 0..self.a.nrows() {
            for c in 0..self.a.ncols() {
                params.push(self.a[(r, c)]);
            }
        }
        params.extend(self.b.iter());
        Some(FunctionSpec {
            tag: Self::TAG.to_owned(),
            name: self.name.clone(),
            space: self.space.clone(),
            dims: vec![self.a.nrows(), self.a.ncols()],
            params,
        })
    }
}

/// The identity map `f(q) = q` on an arbitrary space.
///
/// Together with a Lie-group right-hand side this expresses "reach this
/// configuration / orientation" goals: the error is `q ⊖ rhs`.
#[derive(Debug, Clone)]
pub struct SpaceIdentity {
    name: String,
    space: ConfigSpace,
}

impl SpaceIdentity {
    /// Registry tag of this function type.
    pub const TAG: &'static str = "identity";

    /// Identity on the given space.
    #[must_use]
    pub fn new(name: impl Into<String>, space: ConfigSpace) -> Self {
        Self { name: name.into(), space }
    }
}

impl DifferentiableFunction for SpaceIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_size(&self) -> usize {
        self.space.nq()
    }

    fn input_derivative_size(&self) -> usize {
        self.space.nv()
    }

    fn output_space(&self) -> &ConfigSpace {
        &self.space
    }

    fn value(&self, q: &DVector<f64>, out: &mut DVector<f64>) {
        out.copy_from(q);
    }

    fn jacobian(&self, _q: &DVector<f64>, out: &mut DMatrix<f64>) {
        out.fill(0.0);
        out.fill_diagonal(1.0);
    }

    fn fingerprint(&self) -> u64 {
        self.spec().map_or(0, |s| s.fingerprint())
    }

    fn spec(&self) -> Option<FunctionSpec> {
        Some(FunctionSpec {
            tag: Self::TAG.to_owned(),
            name: self.name.clone(),
            space: self.space.clone(),
            dims: Vec::new(),
            params: Vec::new(),
        })
    }
}
