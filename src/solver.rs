//! The hierarchical iterative solver.
//!
//! [`HierarchicalSolver`] finds a configuration satisfying a prioritized
//! stack of nonlinear constraints on a [`ConfigSpace`]. Each iteration
//! evaluates the constraints, assembles the stacked Jacobians in reduced
//! (free-variable) coordinates, computes a Newton-like descent direction
//! by recursive pseudo-inverse projection through the nullspaces of the
//! higher-priority levels, line-searches the step and integrates it back
//! onto the space under the saturation policy.
//!
//! # Priorities
//!
//! Constraints at priority 0 dominate: lower-priority levels are only
//! optimized inside the nullspace of everything above them. Within one
//! level, constraints are stacked and solved jointly in the least-squares
//! sense.

use std::fmt;

use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::blocks::{BlockIndices, MatrixBlocks};
use crate::constraint::{ComparisonType, ImplicitConstraint};
use crate::data::LevelData;
use crate::error::SolverError;
use crate::line_search::LineSearch;
use crate::saturation::Saturation;
use crate::space::ConfigSpace;

/// Relative threshold under which singular values are treated as zero.
pub const SVD_THRESHOLD: f64 = 1e-8;

/// Squared step norm under which the solver reports infeasibility.
const MIN_SQUARED_STEP: f64 = 1e-12;

/// Consecutive non-decreasing iterations tolerated before giving up.
const ERROR_INCREASE_STRIKES: usize = 3;

/// Termination status of [`HierarchicalSolver::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The squared error fell below the threshold.
    Success,
    /// The iteration cap was reached with the error still above the
    /// threshold.
    MaxIterationReached,
    /// The descent direction vanished while the error was non-zero: a
    /// local minimum, an empty reduced problem, or every useful column
    /// clipped by saturation.
    Infeasible,
    /// The error failed to decrease over several consecutive iterations.
    ErrorIncreased,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::MaxIterationReached => write!(f, "MaxIterationReached"),
            Self::Infeasible => write!(f, "Infeasible"),
            Self::ErrorIncreased => write!(f, "ErrorIncreased"),
        }
    }
}

/// Ledger entry of one added constraint.
#[derive(Debug, Clone)]
struct ConstraintEntry {
    constraint: ImplicitConstraint,
    priority: usize,
    /// Offset of the constraint's output inside its level (ambient).
    iq: usize,
    /// Offset of the constraint's output inside its level (tangent).
    iv: usize,
    fingerprint: u64,
}

#[derive(Debug, Clone)]
struct Level {
    constraints: Vec<ImplicitConstraint>,
    data: LevelData,
}

impl Level {
    fn empty() -> Self {
        Self {
            constraints: Vec::new(),
            data: LevelData::empty(),
        }
    }
}

/// Hierarchical iterative constraint solver on a configuration space.
#[derive(Debug, Clone)]
pub struct HierarchicalSolver {
    squared_error_threshold: f64,
    inequality_threshold: f64,
    max_iterations: usize,
    last_is_optional: bool,
    solve_level_by_level: bool,
    config_space: ConfigSpace,
    free_variables: BlockIndices,
    saturate: Saturation,
    levels: Vec<Level>,
    entries: Vec<ConstraintEntry>,
    dimension: usize,
    reduced_dimension: usize,
    sigma: f64,
    squared_norm: f64,
    dq: DVector<f64>,
    dq_small: DVector<f64>,
    q_sat: DVector<f64>,
    saturation_sign: Vec<i8>,
    reduced_sign: Vec<i8>,
}

impl HierarchicalSolver {
    /// Create a solver over `config_space` with all variables free, no
    /// bounds, zero thresholds and a zero iteration cap.
    #[must_use]
    pub fn new(config_space: ConfigSpace) -> Self {
        let nq = config_space.nq();
        let nv = config_space.nv();
        Self {
            squared_error_threshold: 0.0,
            inequality_threshold: 0.0,
            max_iterations: 0,
            last_is_optional: false,
            solve_level_by_level: false,
            free_variables: BlockIndices::range(0, nv),
            saturate: Saturation::None,
            config_space,
            levels: Vec::new(),
            entries: Vec::new(),
            dimension: 0,
            reduced_dimension: 0,
            sigma: f64::INFINITY,
            squared_norm: 0.0,
            dq: DVector::zeros(nv),
            dq_small: DVector::zeros(nv),
            q_sat: DVector::zeros(nq),
            saturation_sign: vec![0; nv],
            reduced_sign: vec![0; nv],
        }
    }

    // ====================================================================
    // Stack construction
    // ====================================================================

    /// Add a constraint at the given priority level (0 = highest).
    ///
    /// # Errors
    ///
    /// [`SolverError::DuplicateConstraint`] when a constraint with the
    /// same mathematical function is already present at any priority;
    /// [`SolverError::ShapeMismatch`] when the constraint's input sizes
    /// do not match the configuration space.
    pub fn add(
        &mut self,
        constraint: ImplicitConstraint,
        priority: usize,
    ) -> Result<(), SolverError> {
        let fingerprint = constraint.fingerprint();
        if self.entries.iter().any(|e| e.fingerprint == fingerprint) {
            return Err(SolverError::DuplicateConstraint {
                name: constraint.function().name().to_owned(),
            });
        }
        if constraint.function().input_size() != self.config_space.nq() {
            return Err(SolverError::ShapeMismatch {
                what: "constraint input size",
                expected: self.config_space.nq(),
                actual: constraint.function().input_size(),
            });
        }
        if constraint.function().input_derivative_size() != self.config_space.nv() {
            return Err(SolverError::ShapeMismatch {
                what: "constraint input derivative size",
                expected: self.config_space.nv(),
                actual: constraint.function().input_derivative_size(),
            });
        }

        while self.levels.len() <= priority {
            self.levels.push(Level::empty());
        }
        let level = &mut self.levels[priority];
        let iq = level
            .constraints
            .iter()
            .map(|c| c.function().output_space().nq())
            .sum();
        let iv = level
            .constraints
            .iter()
            .map(|c| c.function().output_space().nv())
            .sum();
        level.constraints.push(constraint.clone());
        self.entries.push(ConstraintEntry {
            constraint,
            priority,
            iq,
            iv,
            fingerprint,
        });
        self.update();
        Ok(())
    }

    /// Whether a constraint with the same mathematical function is
    /// present.
    #[must_use]
    pub fn contains(&self, constraint: &ImplicitConstraint) -> bool {
        let fp = constraint.fingerprint();
        self.entries.iter().any(|e| e.fingerprint == fp)
    }

    /// Add every constraint of `other` not already present, preserving
    /// its priority.
    pub fn merge(&mut self, other: &Self) {
        for entry in &other.entries {
            if !self.contains(&entry.constraint) {
                // Cannot collide: containment was just checked.
                self.add(entry.constraint.clone(), entry.priority).ok();
            }
        }
    }

    /// The constraints in insertion order, with their priorities.
    pub fn constraints(&self) -> impl Iterator<Item = (&ImplicitConstraint, usize)> + '_ {
        self.entries.iter().map(|e| (&e.constraint, e.priority))
    }

    /// Whether the solution set of this solver is included in the one of
    /// `other`, i.e. this solver carries every constraint of `other`.
    #[must_use]
    pub fn defines_submanifold_of(&self, other: &Self) -> bool {
        other.entries.iter().all(|e| self.contains(&e.constraint))
    }

    // ====================================================================
    // Settings
    // ====================================================================

    /// Squared error below which `solve` succeeds.
    #[must_use]
    pub fn squared_error_threshold(&self) -> f64 {
        self.squared_error_threshold
    }

    /// Set the squared error threshold.
    pub fn set_squared_error_threshold(&mut self, threshold: f64) {
        self.squared_error_threshold = threshold;
    }

    /// Set the (non-squared) error threshold.
    pub fn set_error_threshold(&mut self, threshold: f64) {
        self.squared_error_threshold = threshold * threshold;
    }

    /// Margin inside which an inequality row is considered violated.
    #[must_use]
    pub fn inequality_threshold(&self) -> f64 {
        self.inequality_threshold
    }

    /// Set the inequality activation margin.
    pub fn set_inequality_threshold(&mut self, threshold: f64) {
        self.inequality_threshold = threshold;
    }

    /// Iteration cap of `solve`.
    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Set the iteration cap of `solve`.
    pub fn set_max_iterations(&mut self, iterations: usize) {
        self.max_iterations = iterations;
    }

    /// Whether the last priority level is excluded from the error
    /// aggregation (it still shapes the step).
    #[must_use]
    pub fn last_is_optional(&self) -> bool {
        self.last_is_optional
    }

    /// Exclude (or include) the last priority level from the error
    /// aggregation.
    pub fn set_last_is_optional(&mut self, optional: bool) {
        self.last_is_optional = optional;
    }

    /// Whether descent stops at the first level whose residual exceeds
    /// the error threshold.
    #[must_use]
    pub fn solve_level_by_level(&self) -> bool {
        self.solve_level_by_level
    }

    /// Enable or disable level-by-level descent.
    pub fn set_solve_level_by_level(&mut self, enabled: bool) {
        self.solve_level_by_level = enabled;
    }

    /// The saturation policy.
    #[must_use]
    pub fn saturation(&self) -> &Saturation {
        &self.saturate
    }

    /// Set the saturation policy.
    pub fn set_saturation(&mut self, saturation: Saturation) {
        self.saturate = saturation;
    }

    /// The free-variable selection over `[0, nv)`.
    #[must_use]
    pub fn free_variables(&self) -> &BlockIndices {
        &self.free_variables
    }

    /// Restrict the solver to the given free variables; the step is zero
    /// everywhere else.
    pub fn set_free_variables(&mut self, free_variables: BlockIndices) {
        debug_assert!(
            free_variables
                .segments()
                .last()
                .map_or(true, |s| s.end() <= self.config_space.nv()),
            "free variables must select indices inside [0, nv)"
        );
        self.free_variables = free_variables;
        self.update();
    }

    /// The configuration space the solver operates on.
    #[must_use]
    pub fn config_space(&self) -> &ConfigSpace {
        &self.config_space
    }

    // ====================================================================
    // Introspection
    // ====================================================================

    /// Total tangent dimension of the stacked constraint outputs.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of active rows across all levels (free variables taken
    /// into account).
    #[must_use]
    pub fn reduced_dimension(&self) -> usize {
        self.reduced_dimension
    }

    /// Smallest singular value observed at any level, at its historical
    /// maximum rank, over the lifetime of the current `solve`.
    #[must_use]
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// The squared error of the last evaluation (L∞ over constraints of
    /// the per-constraint squared L2 norms).
    #[must_use]
    pub fn squared_norm(&self) -> f64 {
        self.squared_norm
    }

    /// The descent direction of the last
    /// [`compute_descent_direction`](Self::compute_descent_direction)
    /// (full tangent size; zero outside the free variables).
    #[must_use]
    pub fn descent_direction(&self) -> &DVector<f64> {
        &self.dq
    }

    /// Concatenated constraint errors (size [`dimension`](Self::dimension)).
    pub fn residual_error(&self, out: &mut DVector<f64>) {
        debug_assert_eq!(out.len(), self.dimension);
        let mut row = 0;
        for level in &self.levels {
            let e = &level.data.error;
            out.rows_mut(row, e.len()).copy_from(e);
            row += e.len();
        }
    }

    /// Concatenated constraint outputs, ambient coordinates (size
    /// [`right_hand_side_size`](Self::right_hand_side_size)).
    pub fn get_value(&self, out: &mut DVector<f64>) {
        debug_assert_eq!(out.len(), self.right_hand_side_size());
        let mut row = 0;
        for level in &self.levels {
            let o = &level.data.output;
            out.rows_mut(row, o.len()).copy_from(o);
            row += o.len();
        }
    }

    /// Stacked reduced Jacobian
    /// ([`reduced_dimension`](Self::reduced_dimension) rows × free
    /// columns).
    pub fn get_reduced_jacobian(&self, out: &mut DMatrix<f64>) {
        debug_assert_eq!(out.nrows(), self.reduced_dimension);
        debug_assert_eq!(out.ncols(), self.free_variables.nb_indices());
        let mut row = 0;
        for level in &self.levels {
            let j = &level.data.reduced_jacobian;
            out.rows_mut(row, j.nrows()).copy_from(j);
            row += j.nrows();
        }
    }

    /// Ambient input coordinates any constraint depends on.
    #[must_use]
    pub fn active_parameters(&self) -> Vec<bool> {
        let mut mask = vec![false; self.config_space.nq()];
        for entry in &self.entries {
            for (i, a) in entry.constraint.function().active_parameters().iter().enumerate() {
                mask[i] |= *a;
            }
        }
        mask
    }

    /// Tangent input coordinates any constraint depends on.
    #[must_use]
    pub fn active_derivative_parameters(&self) -> Vec<bool> {
        let mut mask = vec![false; self.config_space.nv()];
        for entry in &self.entries {
            let adp = entry.constraint.function().active_derivative_parameters();
            for (i, a) in adp.iter().enumerate() {
                mask[i] |= *a;
            }
        }
        mask
    }

    // ====================================================================
    // Right-hand side
    // ====================================================================

    /// Total ambient size of the stacked right-hand sides.
    #[must_use]
    pub fn right_hand_side_size(&self) -> usize {
        self.levels
            .iter()
            .map(|l| l.data.right_hand_side.len())
            .sum()
    }

    /// Set the right-hand side of one constraint.
    ///
    /// The value is normalized through the equality rows: non-equality
    /// rows of its logarithm are coerced to zero (they are asserted zero
    /// in debug builds) and the result is re-exponentiated from the
    /// neutral element. Returns `false`, without mutating state, when the
    /// constraint is unknown or `rhs` has the wrong size.
    pub fn set_right_hand_side(
        &mut self,
        constraint: &ImplicitConstraint,
        rhs: &DVector<f64>,
    ) -> bool {
        let Some(entry) = self.find_entry(constraint) else {
            return false;
        };
        let (priority, iq) = (entry.priority, entry.iq);
        let space = constraint.function().output_space().clone();
        if rhs.len() != space.nq() {
            debug_assert!(false, "right-hand side has size {}, expected {}", rhs.len(), space.nq());
            tracing::error!(
                expected = space.nq(),
                actual = rhs.len(),
                "right-hand side size mismatch"
            );
            return false;
        }
        let normalized = normalize_rhs(&space, rhs, constraint.comparison());
        self.levels[priority]
            .data
            .right_hand_side
            .rows_mut(iq, space.nq())
            .copy_from(&normalized);
        true
    }

    /// Read back the right-hand side of one constraint.
    #[must_use]
    pub fn right_hand_side_of(&self, constraint: &ImplicitConstraint) -> Option<DVector<f64>> {
        let entry = self.find_entry(constraint)?;
        let nq = constraint.function().output_space().nq();
        Some(
            self.levels[entry.priority]
                .data
                .right_hand_side
                .rows(entry.iq, nq)
                .clone_owned(),
        )
    }

    /// Set every level's right-hand side from one stacked vector of size
    /// [`right_hand_side_size`](Self::right_hand_side_size). Returns
    /// `false` on a size mismatch, without mutating state.
    pub fn set_right_hand_side_vector(&mut self, rhs: &DVector<f64>) -> bool {
        if rhs.len() != self.right_hand_side_size() {
            debug_assert!(false, "stacked right-hand side has the wrong size");
            tracing::error!(
                expected = self.right_hand_side_size(),
                actual = rhs.len(),
                "stacked right-hand side size mismatch"
            );
            return false;
        }
        let mut iq = 0;
        for level in &mut self.levels {
            let d = &mut level.data;
            let nq = d.right_hand_side.len();
            let block = rhs.rows(iq, nq).clone_owned();
            let normalized = normalize_rhs(&d.space, &block, &d.comparison);
            d.right_hand_side.copy_from(&normalized);
            iq += nq;
        }
        true
    }

    /// The stacked right-hand side of all levels.
    #[must_use]
    pub fn right_hand_side_vector(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.right_hand_side_size());
        let mut iq = 0;
        for level in &self.levels {
            let r = &level.data.right_hand_side;
            out.rows_mut(iq, r.len()).copy_from(r);
            iq += r.len();
        }
        out
    }

    /// Define every constraint's right-hand side from a configuration:
    /// `rhs ← f(q)`, restricted to equality rows. Returns the stacked
    /// right-hand side.
    pub fn right_hand_side_from_config(&mut self, q: &DVector<f64>) -> DVector<f64> {
        for i in 0..self.entries.len() {
            let constraint = self.entries[i].constraint.clone();
            self.right_hand_side_from_config_of(&constraint, q);
        }
        self.right_hand_side_vector()
    }

    /// Define one constraint's right-hand side from a configuration.
    /// Returns `false` when the constraint is unknown.
    pub fn right_hand_side_from_config_of(
        &mut self,
        constraint: &ImplicitConstraint,
        q: &DVector<f64>,
    ) -> bool {
        if self.find_entry(constraint).is_none() {
            return false;
        }
        let space = constraint.function().output_space();
        let mut value = DVector::zeros(space.nq());
        constraint.right_hand_side_from_config(q, &mut value);
        self.set_right_hand_side(constraint, &value)
    }

    /// Evaluate every time-parameterized right-hand side at `s` and
    /// store it.
    pub fn right_hand_side_at(&mut self, s: f64) {
        for i in 0..self.entries.len() {
            let constraint = self.entries[i].constraint.clone();
            if constraint.parameter_size() == 0 {
                continue;
            }
            let Some(rhs_fn) = constraint.rhs_function().cloned() else {
                continue;
            };
            let mut rhs = DVector::zeros(constraint.function().output_space().nq());
            rhs_fn.value_at(s, &mut rhs);
            self.set_right_hand_side(&constraint, &rhs);
        }
    }

    /// Evaluate one constraint at `q` against its stored right-hand
    /// side. `error` receives the constraint's tangent error. Returns
    /// `None` when the constraint is unknown, otherwise whether the
    /// squared error is below the threshold.
    #[must_use]
    pub fn is_constraint_satisfied(
        &self,
        constraint: &ImplicitConstraint,
        q: &DVector<f64>,
        error: &mut DVector<f64>,
    ) -> Option<bool> {
        let entry = self.find_entry(constraint)?;
        let space = constraint.function().output_space();
        debug_assert_eq!(error.len(), space.nv());
        let mut output = DVector::zeros(space.nq());
        constraint.function().value(q, &mut output);
        let rhs = self.levels[entry.priority]
            .data
            .right_hand_side
            .rows(entry.iq, space.nq())
            .clone_owned();
        space.difference(&output, &rhs, error);
        constraint.set_inactive_rows_to_zero(error);
        Some(error.norm_squared() < self.squared_error_threshold)
    }

    // ====================================================================
    // Evaluation
    // ====================================================================

    /// Evaluate every constraint at `q`: outputs, errors (comparison
    /// applied) and, when requested, Jacobians in tangent-of-error
    /// coordinates together with their reduced gather.
    pub fn compute_value(&mut self, q: &DVector<f64>, with_jacobian: bool) {
        debug_assert_eq!(q.len(), self.config_space.nq());
        debug_assert!(self.config_space.is_normalized(q));
        let inequality_threshold = self.inequality_threshold;
        for level in &mut self.levels {
            let d = &mut level.data;
            let (mut iq, mut iv) = (0, 0);
            for (ci, c) in level.constraints.iter().enumerate() {
                let f = c.function();
                let nq_c = f.output_space().nq();
                let nv_c = f.output_space().nv();
                let buf = &mut d.value_scratch[ci];
                f.value(q, buf);
                d.output.rows_mut(iq, nq_c).copy_from(buf);
                if with_jacobian {
                    let jbuf = &mut d.jacobian_scratch[ci];
                    f.jacobian(q, jbuf);
                    d.jacobian.rows_mut(iv, nv_c).copy_from(jbuf);
                }
                iq += nq_c;
                iv += nv_c;
            }
            debug_assert!(d.space.is_normalized(&d.output));

            d.space
                .difference(&d.output, &d.right_hand_side, &mut d.error);
            for s in d.inactive_rows.segments() {
                d.error.rows_mut(s.start, s.len).fill(0.0);
            }
            if with_jacobian {
                d.space
                    .transform_jacobian(&d.right_hand_side, &d.output, &mut d.jacobian);
            }
            apply_comparison(
                &d.comparison,
                &d.inequality_indices,
                &mut d.error,
                &mut d.jacobian,
                inequality_threshold,
                with_jacobian,
            );
            if with_jacobian {
                d.active_rows.keep_into(&d.jacobian, &mut d.reduced_jacobian);
            }
        }
    }

    /// Evaluate the saturation policy at `q` and zero every reduced
    /// Jacobian column that pushes against an active bound, i.e. where
    /// `sign[j] · (Jrᵀ e)[j] < 0`.
    pub fn compute_saturation(&mut self, q: &DVector<f64>) {
        let clipped = self
            .saturate
            .saturate(q, &mut self.q_sat, &mut self.saturation_sign);
        if !clipped {
            return;
        }
        for (r, idx) in self.free_variables.iter().enumerate() {
            self.reduced_sign[r] = self.saturation_sign[idx];
        }
        debug_assert!(self.reduced_sign.iter().all(|s| (-1..=1).contains(s)));

        let reduced_sign = &self.reduced_sign;
        for level in &mut self.levels {
            let d = &mut level.data;
            d.active_rows
                .rows
                .keep_vector_into(&d.error, &mut d.reduced_error);
            for j in 0..d.reduced_jacobian.ncols() {
                let sign = reduced_sign[j];
                if sign == 0 {
                    continue;
                }
                let dot = d.reduced_jacobian.column(j).dot(&d.reduced_error);
                if f64::from(sign) * dot < 0.0 {
                    d.reduced_jacobian.column_mut(j).fill(0.0);
                }
            }
        }
    }

    /// Aggregate the squared error: the maximum over non-optional levels
    /// and over constraints within a level of the per-constraint squared
    /// L2 norm.
    pub fn compute_error(&mut self) {
        let end = if self.last_is_optional && !self.levels.is_empty() {
            self.levels.len() - 1
        } else {
            self.levels.len()
        };
        self.squared_norm = 0.0;
        for level in &self.levels[..end] {
            let mut iv = 0;
            for c in &level.constraints {
                let nv_c = c.function().output_space().nv();
                let sq = level.data.error.rows(iv, nv_c).norm_squared();
                self.squared_norm = self.squared_norm.max(sq);
                iv += nv_c;
            }
        }
    }

    /// Directional derivative of the squared error along the current
    /// descent direction, `Σ_k (Jr_k · dq)·e_k` over active rows.
    #[must_use]
    pub fn local_slope(&self) -> f64 {
        let mut slope = 0.0;
        for level in &self.levels {
            let d = &level.data;
            let mut r = 0;
            for s in d.active_rows.rows.segments() {
                for row in s.start..s.end() {
                    let jd: f64 = (0..d.reduced_jacobian.ncols())
                        .map(|c| d.reduced_jacobian[(r, c)] * self.dq_small[c])
                        .sum();
                    slope += jd * d.error[row];
                    r += 1;
                }
            }
        }
        slope
    }

    // ====================================================================
    // Descent direction
    // ====================================================================

    /// Compute the descent direction from the current reduced Jacobians
    /// and errors, by stacked pseudo-inverse with nullspace projection
    /// between the priority levels.
    pub fn compute_descent_direction(&mut self) {
        let reduced = self.free_variables.nb_indices();
        self.dq.fill(0.0);
        if self.levels.is_empty() || reduced == 0 {
            return;
        }
        self.dq_small.fill(0.0);

        if self.levels.len() == 1 {
            let d = &mut self.levels[0].data;
            if d.reduced_jacobian.nrows() > 0 {
                d.active_rows
                    .rows
                    .keep_vector_into(&d.error, &mut d.reduced_error);
                d.reduced_error.neg_mut();
                let svd = SVD::new(d.reduced_jacobian.clone(), true, true);
                let (rank, eps) = svd_rank(&svd);
                if let Ok(solution) = svd.solve(&d.reduced_error, eps) {
                    self.dq_small.copy_from(&solution);
                }
                d.max_rank = d.max_rank.max(rank);
                if d.max_rank > 0 {
                    self.sigma = self.sigma.min(svd.singular_values[d.max_rank - 1]);
                }
            }
        } else {
            let mut projector: Option<DMatrix<f64>> = None;
            let n_levels = self.levels.len();
            for i in 0..n_levels {
                let last = i == n_levels - 1;
                let d = &mut self.levels[i].data;
                if d.reduced_jacobian.nrows() == 0 {
                    continue;
                }
                // Residual of this level under the step accumulated so
                // far (no-op on the first contributing level).
                d.active_rows
                    .rows
                    .keep_vector_into(&d.error, &mut d.reduced_error);
                d.reduced_error.neg_mut();
                d.reduced_error
                    .gemv(-1.0, &d.reduced_jacobian, &self.dq_small, 1.0);

                let svd = match projector.as_ref() {
                    None => SVD::new(d.reduced_jacobian.clone(), true, true),
                    Some(p) => SVD::new(&d.reduced_jacobian * p, true, true),
                };
                let (rank, eps) = svd_rank(&svd);
                if let Ok(solution) = svd.solve(&d.reduced_error, eps) {
                    match projector.as_ref() {
                        None => self.dq_small += solution,
                        Some(p) => self.dq_small.gemv(1.0, p, &solution, 1.0),
                    }
                }
                d.max_rank = d.max_rank.max(rank);
                if d.max_rank > 0 {
                    self.sigma = self.sigma.min(svd.singular_values[d.max_rank - 1]);
                }
                if self.solve_level_by_level
                    && d.reduced_error.norm_squared() > self.squared_error_threshold
                {
                    break;
                }
                if last {
                    break;
                }
                if rank == reduced {
                    // The kernel is {0}: nothing is left for the lower
                    // priorities.
                    break;
                }
                // Kernel projector of this level, K = I − Vrᵀ·Vr, chained
                // onto the accumulated projector.
                let Some(v_t) = svd.v_t.as_ref() else {
                    break;
                };
                let vr = v_t.rows(0, rank);
                let mut kernel = DMatrix::identity(reduced, reduced);
                kernel.gemm(-1.0, &vr.transpose(), &vr, 1.0);
                let next = match projector.as_ref() {
                    None => kernel,
                    Some(p) => p * kernel,
                };
                d.projector.copy_from(&next);
                projector = Some(next);
            }
        }
        self.expand_dq_small();
    }

    fn expand_dq_small(&mut self) {
        self.free_variables
            .scatter_vector(&self.dq_small, &mut self.dq);
    }

    /// `out = from ⊕ velocity`, clamped into bounds by the saturation
    /// policy. Returns whether any coordinate was clipped.
    pub fn integrate(
        &mut self,
        from: &DVector<f64>,
        velocity: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> bool {
        debug_assert_eq!(from.len(), self.config_space.nq());
        debug_assert_eq!(velocity.len(), self.config_space.nv());
        debug_assert_eq!(out.len(), self.config_space.nq());
        self.config_space.integrate(from, velocity, out);
        let clipped = self
            .saturate
            .saturate(out, &mut self.q_sat, &mut self.saturation_sign);
        out.copy_from(&self.q_sat);
        clipped
    }

    // ====================================================================
    // Solve
    // ====================================================================

    /// Iterate from `arg` until every non-optional constraint is
    /// satisfied, the iteration cap is hit, or progress stops. `arg` is
    /// updated in place; the line-search policy keeps its state across
    /// iterations.
    pub fn solve<L: LineSearch + ?Sized>(
        &mut self,
        arg: &mut DVector<f64>,
        line_search: &mut L,
    ) -> Status {
        if arg.len() != self.config_space.nq() {
            debug_assert!(
                false,
                "configuration has size {}, expected {}",
                arg.len(),
                self.config_space.nq()
            );
            tracing::error!(
                expected = self.config_space.nq(),
                actual = arg.len(),
                "configuration size mismatch in solve"
            );
            return Status::Infeasible;
        }
        self.sigma = f64::INFINITY;
        self.compute_value(arg, true);
        self.compute_error();
        tracing::debug!(squared_norm = self.squared_norm, "initial error");

        let mut previous = f64::INFINITY;
        let mut strikes = ERROR_INCREASE_STRIKES;
        let mut iteration = 0;
        loop {
            if self.squared_norm <= self.squared_error_threshold {
                return Status::Success;
            }
            if iteration >= self.max_iterations {
                return Status::MaxIterationReached;
            }
            self.compute_saturation(arg);
            self.compute_descent_direction();
            if self.dq.norm_squared() < MIN_SQUARED_STEP {
                // Saturation deadlock or local minimum: no direction left.
                return Status::Infeasible;
            }
            let progressed = line_search.search(self, arg);
            self.compute_value(arg, true);
            self.compute_error();
            if !progressed {
                tracing::debug!("line search hit its floor without sufficient decrease");
            }
            if self.squared_norm < previous {
                strikes = ERROR_INCREASE_STRIKES;
            } else {
                strikes -= 1;
                if strikes == 0 {
                    return Status::ErrorIncreased;
                }
            }
            previous = self.squared_norm;
            iteration += 1;
            tracing::debug!(
                iteration,
                squared_norm = self.squared_norm,
                sigma = self.sigma,
                "iteration"
            );
        }
    }

    // ====================================================================
    // Internals
    // ====================================================================

    fn find_entry(&self, constraint: &ImplicitConstraint) -> Option<&ConstraintEntry> {
        let fp = constraint.fingerprint();
        self.entries.iter().find(|e| e.fingerprint == fp)
    }

    /// Rebuild every level's storage. This is the only place the solver
    /// allocates (besides the SVD's internals during `solve`).
    fn update(&mut self) {
        let nv_total = self.config_space.nv();
        let reduced = self.free_variables.nb_indices();
        self.dimension = 0;
        self.reduced_dimension = 0;

        for level in &mut self.levels {
            let factors: Vec<ConfigSpace> = level
                .constraints
                .iter()
                .map(|c| c.function().output_space().clone())
                .collect();
            let space = ConfigSpace::product(factors);
            let nq_i = space.nq();
            let nv_i = space.nv();

            // Active rows of J: per constraint, its active rows shifted by
            // the cumulative tangent offset, kept only when some free
            // variable is active for the constraint.
            let mut rows = BlockIndices::new();
            let mut active_union = BlockIndices::new();
            let mut offset = 0;
            for c in &level.constraints {
                let adp = c.function().active_derivative_parameters();
                let any_active = self
                    .free_variables
                    .iter()
                    .any(|idx| adp.get(idx).copied().unwrap_or(false));
                for s in c.active_rows().segments() {
                    if any_active {
                        rows.add_range(offset + s.start, s.len);
                    }
                    active_union.add_range(offset + s.start, s.len);
                }
                offset += c.function().output_space().nv();
            }

            let d = &mut level.data;
            d.active_rows = MatrixBlocks::new(rows, self.free_variables.clone());
            d.inactive_rows = BlockIndices::range(0, nv_i).difference(&active_union);

            d.comparison.clear();
            d.inequality_indices.clear();
            d.equality_indices = BlockIndices::new();
            let mut iv = 0;
            for c in &level.constraints {
                for (k, comp) in c.comparison().iter().enumerate() {
                    match comp {
                        ComparisonType::Superior | ComparisonType::Inferior => {
                            d.inequality_indices.push(iv + k);
                        }
                        ComparisonType::Equality => d.equality_indices.add_range(iv + k, 1),
                        ComparisonType::EqualToZero => {}
                    }
                    d.comparison.push(*comp);
                }
                iv += c.function().output_space().nv();
            }
            debug_assert_eq!(d.comparison.len(), nv_i);

            d.output = DVector::zeros(nq_i);
            d.right_hand_side = space.neutral();
            d.error = DVector::zeros(nv_i);
            d.jacobian = DMatrix::zeros(nv_i, nv_total);
            let active = d.active_rows.rows.nb_indices();
            d.reduced_jacobian = DMatrix::zeros(active, reduced);
            d.reduced_error = DVector::zeros(active);
            d.projector = DMatrix::zeros(reduced, reduced);
            d.max_rank = 0;
            d.value_scratch = level
                .constraints
                .iter()
                .map(|c| DVector::zeros(c.function().output_space().nq()))
                .collect();
            d.jacobian_scratch = level
                .constraints
                .iter()
                .map(|c| DMatrix::zeros(c.function().output_space().nv(), nv_total))
                .collect();
            d.space = space;

            self.dimension += nv_i;
            self.reduced_dimension += active;
        }

        self.dq = DVector::zeros(nv_total);
        self.dq_small = DVector::zeros(reduced);
        self.reduced_sign = vec![0; reduced];
    }
}

impl fmt::Display for HierarchicalSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HierarchicalSolver, {} levels", self.levels.len())?;
        writeln!(
            f,
            "  max iterations: {}, squared error threshold: {}",
            self.max_iterations, self.squared_error_threshold
        )?;
        writeln!(
            f,
            "  dimension: {}, reduced dimension: {}",
            self.dimension, self.reduced_dimension
        )?;
        writeln!(f, "  free variables: {:?}", self.free_variables.segments())?;
        for (i, level) in self.levels.iter().enumerate() {
            write!(f, "  level {i}")?;
            if self.last_is_optional && i + 1 == self.levels.len() {
                write!(f, " (optional)")?;
            }
            writeln!(f, ": stack of {} functions", level.constraints.len())?;
            let mut iv = 0;
            for c in &level.constraints {
                let nv_c = c.function().output_space().nv();
                writeln!(
                    f,
                    "    [{iv}, {nv_c}] {} (active rows: {:?})",
                    c.function().name(),
                    c.active_rows().segments()
                )?;
                iv += nv_c;
            }
        }
        Ok(())
    }
}

/// Apply the inequality comparison rule to one level's error and
/// Jacobian.
///
/// Superior rows with `v ≥ thr` (resp. Inferior with `v ≤ −thr`) are
/// satisfied with margin: the row is deactivated (value and Jacobian row
/// zeroed). Otherwise the violation is penalized by shifting the value by
/// the threshold. Equality and EqualToZero rows pass through.
fn apply_comparison(
    comparison: &[ComparisonType],
    inequality_indices: &[usize],
    error: &mut DVector<f64>,
    jacobian: &mut DMatrix<f64>,
    threshold: f64,
    with_jacobian: bool,
) {
    for &j in inequality_indices {
        let superior = comparison[j] == ComparisonType::Superior;
        let v = error[j];
        let violated = if superior { v < threshold } else { -threshold < v };
        if violated {
            error[j] = if superior { v - threshold } else { v + threshold };
        } else {
            error[j] = 0.0;
            if with_jacobian {
                jacobian.row_mut(j).fill(0.0);
            }
        }
    }
}

/// Normalize a right-hand side through its equality rows: zero the
/// logarithm on non-equality rows (asserted zero in debug builds) and
/// re-exponentiate from the neutral element.
fn normalize_rhs(space: &ConfigSpace, rhs: &DVector<f64>, comparison: &[ComparisonType]) -> DVector<f64> {
    let neutral = space.neutral();
    let mut log = DVector::zeros(space.nv());
    space.difference(rhs, &neutral, &mut log);
    for (k, comp) in comparison.iter().enumerate() {
        if *comp != ComparisonType::Equality {
            debug_assert!(
                log[k].abs() < 1e-10,
                "non-equality row {k} of the right-hand side is not zero"
            );
            log[k] = 0.0;
        }
    }
    let mut out = DVector::zeros(space.nq());
    space.integrate(&neutral, &log, &mut out);
    out
}

/// Rank of a factorization under the relative [`SVD_THRESHOLD`], plus the
/// absolute cutoff used.
fn svd_rank(svd: &SVD<f64, Dyn, Dyn>) -> (usize, f64) {
    let sigma_max = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let eps = SVD_THRESHOLD * sigma_max;
    (svd.rank(eps), eps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ImplicitConstraint;
    use crate::function::AffineFunction;
    use crate::line_search::Constant;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn affine(
        name: &str,
        rows: &[&[f64]],
        b: &[f64],
    ) -> ImplicitConstraint {
        let nrows = rows.len();
        let ncols = rows[0].len();
        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        ImplicitConstraint::with_comparison(
            Arc::new(AffineFunction::new(
                name,
                DMatrix::from_row_slice(nrows, ncols, &flat),
                DVector::from_vec(b.to_vec()),
            )),
            vec![ComparisonType::Equality; nrows],
        )
    }

    fn basic_solver(dim: usize) -> HierarchicalSolver {
        let mut solver = HierarchicalSolver::new(ConfigSpace::vector(dim));
        solver.set_squared_error_threshold(1e-8);
        solver.set_max_iterations(20);
        solver
    }

    #[test]
    fn duplicate_constraints_are_rejected() {
        let mut solver = basic_solver(2);
        let c = affine("c", &[&[1.0, 0.0]], &[1.0]);
        solver.add(c.clone(), 0).ok();
        assert!(solver.contains(&c));
        let again = affine("same math", &[&[1.0, 0.0]], &[1.0]);
        assert!(matches!(
            solver.add(again, 1),
            Err(SolverError::DuplicateConstraint { .. })
        ));
    }

    #[test]
    fn dimensions_track_the_stack() {
        let mut solver = basic_solver(3);
        solver.add(affine("a", &[&[1.0, 0.0, 0.0]], &[0.0]), 0).ok();
        solver
            .add(affine("b", &[&[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0]], &[0.0, 0.0]), 1)
            .ok();
        assert_eq!(solver.dimension(), 3);
        assert_eq!(solver.reduced_dimension(), 3);

        solver.set_free_variables(BlockIndices::range(0, 1));
        // Constraint "b" no longer touches any free variable.
        assert_eq!(solver.reduced_dimension(), 1);
    }

    #[test]
    fn merge_preserves_priorities_and_skips_duplicates() {
        let mut a = basic_solver(2);
        a.add(affine("one", &[&[1.0, 0.0]], &[0.0]), 0).ok();

        let mut b = basic_solver(2);
        b.add(affine("one", &[&[1.0, 0.0]], &[0.0]), 0).ok();
        b.add(affine("two", &[&[0.0, 1.0]], &[0.0]), 2).ok();

        a.merge(&b);
        let priorities: Vec<usize> = a.constraints().map(|(_, p)| p).collect();
        assert_eq!(priorities, vec![0, 2]);
        assert!(a.defines_submanifold_of(&b));
    }

    #[test]
    fn priority_dominance_and_nullspace_step() {
        // Level 0 fixes q0 = 1, level 1 wants q = 0 entirely; level 1 can
        // only win on q1.
        let mut solver = basic_solver(2);
        solver.add(affine("dominant", &[&[1.0, 0.0]], &[1.0]), 0).ok();
        solver
            .add(affine("secondary", &[&[1.0, 0.0], &[0.0, 1.0]], &[0.0, 0.0]), 1)
            .ok();

        let q = DVector::from_vec(vec![0.5, 0.5]);
        solver.compute_value(&q, true);
        solver.compute_error();
        solver.compute_descent_direction();
        let dq = solver.descent_direction().clone_owned();

        // Level-0 is solved exactly: J0·dq + e0 == 0.
        assert_relative_eq!(dq[0], 0.5, epsilon = 1e-10);
        // Level-1's contribution stays in ker(J0) = span(e1).
        assert_relative_eq!(dq[1], -0.5, epsilon = 1e-10);
    }

    #[test]
    fn max_rank_is_monotone_and_sigma_bounded() {
        let mut solver = basic_solver(2);
        solver
            .add(affine("rows", &[&[2.0, 0.0], &[0.0, 0.5]], &[1.0, 1.0]), 0)
            .ok();
        let mut q = DVector::from_vec(vec![0.0, 0.0]);
        let status = solver.solve(&mut q, &mut Constant::default());
        assert_eq!(status, Status::Success);
        // Singular values are 2.0 and 0.5; sigma reports the smallest at
        // the historical max rank.
        assert_relative_eq!(solver.sigma(), 0.5, epsilon = 1e-10);
    }

    #[test]
    fn comparison_rule_zeroes_satisfied_inequalities() {
        let comparison = vec![ComparisonType::Superior, ComparisonType::Inferior];
        let indices = vec![0, 1];
        let mut error = DVector::from_vec(vec![4.0, -4.0]);
        let mut jac = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        apply_comparison(&comparison, &indices, &mut error, &mut jac, 0.01, true);
        assert_relative_eq!(error[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(error[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(1, 0)], 0.0, epsilon = 1e-12);

        // Violated rows are shifted by the threshold and keep their row.
        let mut error = DVector::from_vec(vec![-0.5, 0.5]);
        let mut jac = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        apply_comparison(&comparison, &indices, &mut error, &mut jac, 0.01, true);
        assert_relative_eq!(error[0], -0.51, epsilon = 1e-12);
        assert_relative_eq!(error[1], 0.51, epsilon = 1e-12);
        assert_relative_eq!(jac[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn level_comparison_is_rebuilt_by_update() {
        let mut solver = basic_solver(2);
        solver.set_inequality_threshold(0.01);
        let margin = ImplicitConstraint::with_comparison(
            Arc::new(AffineFunction::new(
                "margin",
                DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                DVector::from_vec(vec![1.0]),
            )),
            vec![ComparisonType::Superior],
        );
        solver.add(margin, 0).ok();

        // Satisfied with margin: the row is deactivated through the
        // level-frame comparison vector.
        let q = DVector::from_vec(vec![5.0, 0.0]);
        solver.compute_value(&q, true);
        solver.compute_error();
        assert_relative_eq!(solver.squared_norm(), 0.0, epsilon = 1e-12);

        // Violated: the row is kept and shifted by the threshold.
        let q = DVector::from_vec(vec![0.5, 0.0]);
        solver.compute_value(&q, true);
        solver.compute_error();
        assert_relative_eq!(solver.squared_norm(), 0.51 * 0.51, epsilon = 1e-12);
    }

    #[test]
    fn rhs_round_trip() {
        let mut solver = basic_solver(2);
        let c = affine("goal", &[&[1.0, 0.0]], &[0.0]);
        solver.add(c.clone(), 0).ok();
        let rhs = DVector::from_vec(vec![0.25]);
        assert!(solver.set_right_hand_side(&c, &rhs));
        assert_eq!(solver.right_hand_side_of(&c), Some(rhs.clone()));

        // Unknown constraints are reported without mutation.
        let unknown = affine("unknown", &[&[0.0, 1.0]], &[0.0]);
        assert!(!solver.set_right_hand_side(&unknown, &rhs));

        // Bulk round trip over a level mixing equality and inequality
        // rows: the equality row is kept, the inequality row stays at
        // the neutral element.
        let mixed = ImplicitConstraint::with_comparison(
            Arc::new(AffineFunction::new(
                "mixed",
                DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 1.0]),
                DVector::zeros(2),
            )),
            vec![ComparisonType::Equality, ComparisonType::Inferior],
        );
        solver.add(mixed, 0).ok();
        let stacked = DVector::from_vec(vec![0.25, 0.7, 0.0]);
        assert!(solver.set_right_hand_side_vector(&stacked));
        assert_eq!(solver.right_hand_side_vector(), stacked);
    }

    #[test]
    fn level_by_level_stops_at_the_first_unsatisfied_level() {
        let mut solver = basic_solver(2);
        solver.set_solve_level_by_level(true);
        solver.add(affine("first", &[&[1.0, 0.0]], &[1.0]), 0).ok();
        solver.add(affine("second", &[&[0.0, 1.0]], &[5.0]), 1).ok();

        let q = DVector::from_vec(vec![0.0, 0.0]);
        solver.compute_value(&q, true);
        solver.compute_error();
        solver.compute_descent_direction();
        let dq = solver.descent_direction();
        // Level 0's residual is above the threshold, so descent never
        // reaches level 1.
        assert_relative_eq!(dq[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(dq[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn introspection_buffers_have_the_advertised_shapes() {
        let mut solver = basic_solver(3);
        solver.add(affine("a", &[&[1.0, 0.0, 0.0]], &[0.5]), 0).ok();
        solver
            .add(affine("b", &[&[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0]], &[0.0, 0.0]), 1)
            .ok();
        let q = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        solver.compute_value(&q, true);

        let mut residual = DVector::zeros(solver.dimension());
        solver.residual_error(&mut residual);
        assert_relative_eq!(residual[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(residual[1], 2.0, epsilon = 1e-12);

        let mut value = DVector::zeros(solver.right_hand_side_size());
        solver.get_value(&mut value);
        assert_relative_eq!(value[0], 0.5, epsilon = 1e-12);

        let mut jr = DMatrix::zeros(
            solver.reduced_dimension(),
            solver.free_variables().nb_indices(),
        );
        solver.get_reduced_jacobian(&mut jr);
        assert_relative_eq!(jr[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(jr[(1, 1)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(jr[(2, 2)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn solve_reports_max_iterations() {
        let mut solver = basic_solver(1);
        solver.set_max_iterations(0);
        solver.add(affine("c", &[&[1.0]], &[1.0]), 0).ok();
        let mut q = DVector::from_vec(vec![0.0]);
        assert_eq!(
            solver.solve(&mut q, &mut Constant::default()),
            Status::MaxIterationReached
        );
    }
}
