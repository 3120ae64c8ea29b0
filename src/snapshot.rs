//! Declarative snapshots of a solver's configuration.
//!
//! A [`SolverSnapshot`] captures everything needed to rebuild a solver:
//! thresholds, iteration cap, configuration-space identity, flags, the
//! saturation policy and the ordered constraint stack with its
//! priorities. It does **not** capture right-hand-side values — those
//! are transient, runtime state — nor the per-level workspace, which is
//! rebuilt on restore.
//!
//! Functions are captured through their [`FunctionSpec`] and rebuilt by
//! a [`FunctionRegistry`]: an explicit tag-string → factory map. The
//! registry replaces any global registration scheme; callers hold and
//! extend their own.
//!
//! The format is versioned and declarative, not bit-exact across
//! versions: always round-trip through this facade.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::blocks::BlockIndices;
use crate::constraint::{ComparisonType, ImplicitConstraint};
use crate::error::SnapshotError;
use crate::function::{AffineFunction, DifferentiableFunction, FunctionSpec, SpaceIdentity};
use crate::saturation::{DeviceLimits, Saturation};
use crate::segment::Segment;
use crate::solver::HierarchicalSolver;
use crate::space::ConfigSpace;

use nalgebra::{DMatrix, DVector};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A factory rebuilding a function from its declarative description.
pub type FunctionFactory =
    Box<dyn Fn(&FunctionSpec) -> Result<Arc<dyn DifferentiableFunction>, SnapshotError> + Send + Sync>;

/// Tag-string → factory map used to rebuild functions on restore.
#[derive(Default)]
pub struct FunctionRegistry {
    factories: HashMap<String, FunctionFactory>,
}

impl FunctionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the built-in function types.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(AffineFunction::TAG, Box::new(build_affine));
        registry.register(SpaceIdentity::TAG, Box::new(build_identity));
        registry
    }

    /// Register (or replace) the factory for a tag.
    pub fn register(&mut self, tag: impl Into<String>, factory: FunctionFactory) {
        self.factories.insert(tag.into(), factory);
    }

    /// Rebuild a function from its description.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::UnknownTag`] when no factory matches,
    /// [`SnapshotError::BadSpec`] when the factory rejects the payload.
    pub fn build(
        &self,
        spec: &FunctionSpec,
    ) -> Result<Arc<dyn DifferentiableFunction>, SnapshotError> {
        let factory = self
            .factories
            .get(&spec.tag)
            .ok_or_else(|| SnapshotError::UnknownTag(spec.tag.clone()))?;
        factory(spec)
    }
}

fn build_affine(spec: &FunctionSpec) -> Result<Arc<dyn DifferentiableFunction>, SnapshotError> {
    let (rows, cols) = match spec.dims[..] {
        [rows, cols] => (rows, cols),
        _ => return Err(SnapshotError::BadSpec("affine functions need dims [rows, cols]")),
    };
    if spec.params.len() != rows * cols + rows {
        return Err(SnapshotError::BadSpec("affine parameter count does not match dims"));
    }
    let a = DMatrix::from_row_slice(rows, cols, &spec.params[..rows * cols]);
    let b = DVector::from_row_slice(&spec.params[rows * cols..]);
    Ok(Arc::new(AffineFunction::new(spec.name.clone(), a, b)))
}

fn build_identity(spec: &FunctionSpec) -> Result<Arc<dyn DifferentiableFunction>, SnapshotError> {
    Ok(Arc::new(SpaceIdentity::new(spec.name.clone(), spec.space.clone())))
}

/// Serializable description of a saturation policy. User callables
/// cannot be captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SaturationSpec {
    /// No bounds.
    None,
    /// Box bounds.
    Bounds {
        /// Lower bounds.
        lower: Vec<f64>,
        /// Upper bounds.
        upper: Vec<f64>,
    },
    /// Robot-model joint limits.
    Device(DeviceLimits),
}

impl SaturationSpec {
    fn capture(saturation: &Saturation) -> Result<Self, SnapshotError> {
        match saturation {
            Saturation::None => Ok(Self::None),
            Saturation::Bounds { lower, upper } => Ok(Self::Bounds {
                lower: lower.iter().copied().collect(),
                upper: upper.iter().copied().collect(),
            }),
            Saturation::Device(limits) => Ok(Self::Device(limits.clone())),
            Saturation::Custom(_) => Err(SnapshotError::UnsupportedSaturation),
        }
    }

    fn restore(&self) -> Saturation {
        match self {
            Self::None => Saturation::None,
            Self::Bounds { lower, upper } => Saturation::Bounds {
                lower: DVector::from_row_slice(lower),
                upper: DVector::from_row_slice(upper),
            },
            Self::Device(limits) => Saturation::Device(limits.clone()),
        }
    }
}

/// Serializable description of one constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSpec {
    /// The wrapped function.
    pub function: FunctionSpec,
    /// Per-row comparison semantics.
    pub comparison: Vec<ComparisonType>,
    /// Participating output-derivative rows.
    pub active_rows: Vec<Segment>,
}

/// Declarative snapshot of a solver's configuration.
///
/// Right-hand-side values are transient state and are not persisted:
/// restore them from a configuration or a time parameter after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Squared error threshold.
    pub squared_error_threshold: f64,
    /// Inequality activation margin.
    pub inequality_threshold: f64,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Whether the last level is excluded from the error aggregation.
    pub last_is_optional: bool,
    /// Whether descent stops at the first unsatisfied level.
    pub solve_level_by_level: bool,
    /// The configuration space.
    pub config_space: ConfigSpace,
    /// The saturation policy.
    pub saturation: SaturationSpec,
    /// Constraints in insertion order.
    pub constraints: Vec<ConstraintSpec>,
    /// Priority of each constraint, parallel to `constraints`.
    pub priorities: Vec<usize>,
}

impl SolverSnapshot {
    /// Capture a solver's configuration.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::UnsupportedFunction`] when a constraint's
    /// function has no declarative description,
    /// [`SnapshotError::UnsupportedSaturation`] for user saturation
    /// callables.
    pub fn capture(solver: &HierarchicalSolver) -> Result<Self, SnapshotError> {
        let mut constraints = Vec::new();
        let mut priorities = Vec::new();
        for (c, priority) in solver.constraints() {
            let function = c.function().spec().ok_or_else(|| {
                SnapshotError::UnsupportedFunction(c.function().name().to_owned())
            })?;
            constraints.push(ConstraintSpec {
                function,
                comparison: c.comparison().to_vec(),
                active_rows: c.active_rows().segments().to_vec(),
            });
            priorities.push(priority);
        }
        Ok(Self {
            version: SNAPSHOT_VERSION,
            squared_error_threshold: solver.squared_error_threshold(),
            inequality_threshold: solver.inequality_threshold(),
            max_iterations: solver.max_iterations(),
            last_is_optional: solver.last_is_optional(),
            solve_level_by_level: solver.solve_level_by_level(),
            config_space: solver.config_space().clone(),
            saturation: SaturationSpec::capture(solver.saturation())?,
            constraints,
            priorities,
        })
    }

    /// Rebuild a solver: scratch is resized from the configuration
    /// space, free variables start at `[0, nv)`, and the constraints are
    /// re-added in order.
    ///
    /// # Errors
    ///
    /// Any [`SnapshotError`] raised while rebuilding functions or
    /// re-adding constraints.
    pub fn restore(&self, registry: &FunctionRegistry) -> Result<HierarchicalSolver, SnapshotError> {
        let mut solver = HierarchicalSolver::new(self.config_space.clone());
        solver.set_squared_error_threshold(self.squared_error_threshold);
        solver.set_inequality_threshold(self.inequality_threshold);
        solver.set_max_iterations(self.max_iterations);
        solver.set_last_is_optional(self.last_is_optional);
        solver.set_solve_level_by_level(self.solve_level_by_level);
        solver.set_saturation(self.saturation.restore());
        for (spec, &priority) in self.constraints.iter().zip(&self.priorities) {
            let function = registry.build(&spec.function)?;
            let constraint =
                ImplicitConstraint::with_comparison(function, spec.comparison.clone())
                    .with_active_rows(BlockIndices::from_segments(spec.active_rows.clone()));
            solver.add(constraint, priority)?;
        }
        Ok(solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_solver() -> HierarchicalSolver {
        let mut solver = HierarchicalSolver::new(ConfigSpace::vector(3));
        solver.set_squared_error_threshold(1e-8);
        solver.set_inequality_threshold(0.01);
        solver.set_max_iterations(42);
        solver.set_last_is_optional(true);
        solver.set_saturation(Saturation::Bounds {
            lower: DVector::from_vec(vec![-1.0; 3]),
            upper: DVector::from_vec(vec![1.0; 3]),
        });
        let c0 = ImplicitConstraint::with_comparison(
            Arc::new(AffineFunction::new(
                "plane",
                DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 0.0]),
                DVector::from_vec(vec![0.5]),
            )),
            vec![ComparisonType::Equality],
        );
        let c1 = ImplicitConstraint::with_comparison(
            Arc::new(AffineFunction::new(
                "margin",
                DMatrix::from_row_slice(1, 3, &[0.0, 0.0, 1.0]),
                DVector::from_vec(vec![0.0]),
            )),
            vec![ComparisonType::Superior],
        );
        solver.add(c0, 0).ok();
        solver.add(c1, 1).ok();
        solver
    }

    #[test]
    fn round_trip_through_json() {
        let solver = sample_solver();
        let snapshot = SolverSnapshot::capture(&solver).expect("capture");
        let json = serde_json::to_string(&snapshot).expect("serialize");
        let parsed: SolverSnapshot = serde_json::from_str(&json).expect("parse");
        let registry = FunctionRegistry::with_builtins();
        let restored = parsed.restore(&registry).expect("restore");

        assert_eq!(restored.dimension(), solver.dimension());
        assert_eq!(restored.max_iterations(), 42);
        assert!(restored.last_is_optional());
        assert_eq!(restored.constraints().count(), 2);
        let priorities: Vec<usize> = restored.constraints().map(|(_, p)| p).collect();
        assert_eq!(priorities, vec![0, 1]);
        // Same constraints: each solver defines a submanifold of the other.
        assert!(restored.defines_submanifold_of(&solver));
        assert!(solver.defines_submanifold_of(&restored));
    }

    #[test]
    fn custom_saturation_is_refused() {
        let mut solver = HierarchicalSolver::new(ConfigSpace::vector(1));
        solver.set_saturation(Saturation::Custom(Arc::new(
            |q: &DVector<f64>, q_sat: &mut DVector<f64>, sign: &mut [i8]| {
                q_sat.copy_from(q);
                sign.fill(0);
                false
            },
        )));
        assert!(matches!(
            SolverSnapshot::capture(&solver),
            Err(SnapshotError::UnsupportedSaturation)
        ));
    }

    #[test]
    fn unknown_tags_are_reported() {
        let spec = FunctionSpec {
            tag: "no-such-function".to_owned(),
            name: "f".to_owned(),
            space: ConfigSpace::vector(1),
            dims: Vec::new(),
            params: Vec::new(),
        };
        let registry = FunctionRegistry::with_builtins();
        assert!(matches!(
            registry.build(&spec),
            Err(SnapshotError::UnknownTag(_))
        ));
    }
}
