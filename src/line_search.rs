//! Line-search policies controlling the magnitude of each solver step.
//!
//! A policy receives the solver (whose descent direction was just
//! computed) and the current configuration, applies a scaled step through
//! [`HierarchicalSolver::integrate`] and reports whether the step
//! satisfied its acceptance rule. Policies are value-typed and stateful:
//! they carry their own step-size state and scratch buffers across
//! iterations and are passed by mutable reference into
//! [`HierarchicalSolver::solve`].
//!
//! Any `FnMut(&mut HierarchicalSolver, &mut DVector<f64>) -> bool`
//! closure is also a valid policy.

use nalgebra::DVector;

use crate::solver::HierarchicalSolver;

/// A step-size rule applied once per solver iteration.
pub trait LineSearch {
    /// Apply one step along the solver's descent direction, updating
    /// `arg` in place. Returns `true` when the step satisfied the
    /// policy's acceptance rule.
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool;
}

impl<F> LineSearch for F
where
    F: FnMut(&mut HierarchicalSolver, &mut DVector<f64>) -> bool,
{
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool {
        self(solver, arg)
    }
}

/// Scratch buffers shared by the built-in policies.
#[derive(Debug, Clone)]
struct StepBuffers {
    step: DVector<f64>,
    q_next: DVector<f64>,
}

impl Default for StepBuffers {
    fn default() -> Self {
        Self {
            step: DVector::zeros(0),
            q_next: DVector::zeros(0),
        }
    }
}

impl StepBuffers {
    /// `arg ← arg ⊕ alpha·dq`.
    fn apply(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>, alpha: f64) {
        self.trial(solver, arg, alpha);
        arg.copy_from(&self.q_next);
    }

    /// Compute `q_next = arg ⊕ alpha·dq` without committing it.
    fn trial(&mut self, solver: &mut HierarchicalSolver, arg: &DVector<f64>, alpha: f64) {
        let dq = solver.descent_direction();
        if self.step.len() != dq.len() {
            self.step = DVector::zeros(dq.len());
        }
        if self.q_next.len() != arg.len() {
            self.q_next = DVector::zeros(arg.len());
        }
        self.step.copy_from(dq);
        self.step *= alpha;
        solver.integrate(arg, &self.step, &mut self.q_next);
    }
}

/// Unit step: `arg ← arg ⊕ dq`.
#[derive(Debug, Clone, Default)]
pub struct Constant {
    buffers: StepBuffers,
}

impl LineSearch for Constant {
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool {
        self.buffers.apply(solver, arg, 1.0);
        true
    }
}

/// Armijo backtracking on the squared error.
///
/// Starting from α = 1, the step is shrunk by `tau` until
/// `‖e(q ⊕ α·dq)‖² − ‖e(q)‖² ≤ 2·c·α·slope`, where `slope` is the local
/// directional derivative `Σ (J·dq)·e`. If α falls to `small_alpha` the
/// floored step is taken anyway and the search reports failure.
#[derive(Debug, Clone)]
pub struct Backtracking {
    /// Sufficient-decrease coefficient.
    pub c: f64,
    /// Step shrink factor.
    pub tau: f64,
    /// Smallest step the rule will take.
    pub small_alpha: f64,
    buffers: StepBuffers,
}

impl Default for Backtracking {
    fn default() -> Self {
        Self {
            c: 0.001,
            tau: 0.7,
            small_alpha: 0.2,
            buffers: StepBuffers::default(),
        }
    }
}

impl LineSearch for Backtracking {
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool {
        let slope = solver.local_slope();
        let t = 2.0 * self.c * slope;
        let f0 = solver.squared_norm();

        let mut alpha = 1.0;
        while alpha > self.small_alpha {
            self.buffers.trial(solver, arg, alpha);
            solver.compute_value(&self.buffers.q_next, false);
            solver.compute_error();
            if solver.squared_norm() - f0 <= alpha * t {
                arg.copy_from(&self.buffers.q_next);
                return true;
            }
            alpha *= self.tau;
        }
        self.buffers.apply(solver, arg, self.small_alpha);
        false
    }
}

/// A fixed sequence of step sizes approaching `alpha_max` geometrically.
#[derive(Debug, Clone)]
pub struct FixedSequence {
    /// Step size used by the next call.
    pub alpha: f64,
    /// Asymptotic step size.
    pub alpha_max: f64,
    /// Geometric rate: `alpha ← alpha_max − k·(alpha_max − alpha)`.
    pub k: f64,
    buffers: StepBuffers,
}

impl Default for FixedSequence {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            alpha_max: 0.95,
            k: 0.8,
            buffers: StepBuffers::default(),
        }
    }
}

impl FixedSequence {
    /// The step size for this call, advancing the sequence.
    fn advance(&mut self) -> f64 {
        let current = self.alpha;
        self.alpha = self.alpha_max - self.k * (self.alpha_max - self.alpha);
        current
    }
}

impl LineSearch for FixedSequence {
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool {
        let alpha = self.advance();
        self.buffers.apply(solver, arg, alpha);
        true
    }
}

/// Step size driven by the current squared error:
/// `α = C − K·tanh(a·r + b)`, smoothly interpolating between a full step
/// near the solution and `alpha_min` far from it.
#[derive(Debug, Clone)]
pub struct ErrorNormBased {
    c: f64,
    k: f64,
    a: f64,
    b: f64,
    buffers: StepBuffers,
}

impl ErrorNormBased {
    /// Offset of the step size at unit squared error: `α(1) = 1 − δ`.
    const DELTA: f64 = 0.02;
    /// Squared error at which the step size reaches the midpoint.
    const R_HALF: f64 = 1e6;

    /// Build the rule from its minimum step size; the curve parameters
    /// are derived so that `α(1) = 1 − δ` and `α(∞) = alpha_min`.
    #[must_use]
    pub fn new(alpha_min: f64) -> Self {
        let c = 0.5 + alpha_min / 2.0;
        let k = (1.0 - alpha_min) / 2.0;
        let a = f64::atanh((Self::DELTA - 1.0 + c) / k) / (1.0 - Self::R_HALF);
        let b = -Self::R_HALF * a;
        Self::with_coefficients(alpha_min, a, b)
    }

    /// Build the rule with explicit curve coefficients.
    #[must_use]
    pub fn with_coefficients(alpha_min: f64, a: f64, b: f64) -> Self {
        Self {
            c: 0.5 + alpha_min / 2.0,
            k: (1.0 - alpha_min) / 2.0,
            a,
            b,
            buffers: StepBuffers::default(),
        }
    }

    /// The step size the rule picks at squared error `r`.
    #[must_use]
    pub fn alpha_for(&self, r: f64) -> f64 {
        self.c - self.k * f64::tanh(self.a * r + self.b)
    }
}

impl Default for ErrorNormBased {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl LineSearch for ErrorNormBased {
    fn search(&mut self, solver: &mut HierarchicalSolver, arg: &mut DVector<f64>) -> bool {
        let alpha = self.alpha_for(solver.squared_norm());
        self.buffers.apply(solver, arg, alpha);
        true
    }
}
