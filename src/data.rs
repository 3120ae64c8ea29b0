//! Per-priority-level storage of the hierarchical solver.

use nalgebra::{DMatrix, DVector};

use crate::blocks::{BlockIndices, MatrixBlocks};
use crate::constraint::ComparisonType;
use crate::space::ConfigSpace;

/// Workspace of one priority level.
///
/// Everything here is rebuilt by the solver's `update()` — the designated
/// reallocation point — whenever the constraint stack or the
/// free-variable set changes. During `solve`, the buffers are only
/// written in place.
#[derive(Debug, Clone)]
pub(crate) struct LevelData {
    /// Product of the constraint output spaces of this level.
    pub space: ConfigSpace,
    /// Stacked constraint outputs, ambient coordinates (`nq_i`).
    pub output: DVector<f64>,
    /// Stacked right-hand sides, ambient coordinates (`nq_i`).
    /// Neutral after `update()`.
    pub right_hand_side: DVector<f64>,
    /// `output ⊖ right_hand_side`, with comparison applied (`nv_i`).
    pub error: DVector<f64>,
    /// Stacked Jacobian in tangent-of-error coordinates
    /// (`nv_i × nv_total`).
    pub jacobian: DMatrix<f64>,
    /// Jacobian restricted to active rows × free columns.
    pub reduced_jacobian: DMatrix<f64>,
    /// Gathered error over active rows; holds the descent residual
    /// during direction computation.
    pub reduced_error: DVector<f64>,
    /// Accumulated nullspace projector of the levels up to this one
    /// (free × free).
    pub projector: DMatrix<f64>,
    /// Active rows of the Jacobian × free variables.
    pub active_rows: MatrixBlocks,
    /// Rows excluded by the constraints' `active_rows` selections, in
    /// level frame (always zeroed in `error`).
    pub inactive_rows: BlockIndices,
    /// Rows carrying a parameterizable (Equality) right-hand side.
    pub equality_indices: BlockIndices,
    /// Rows with Superior/Inferior comparison, in level frame.
    pub inequality_indices: Vec<usize>,
    /// Comparison type of every row of the level.
    pub comparison: Vec<ComparisonType>,
    /// High-water mark of the SVD rank across the iterations of one
    /// solve; keeps the reported smallest singular value from jumping on
    /// transient rank drops.
    pub max_rank: usize,
    /// Per-constraint output scratch, sized at `update()`.
    pub value_scratch: Vec<DVector<f64>>,
    /// Per-constraint Jacobian scratch, sized at `update()`.
    pub jacobian_scratch: Vec<DMatrix<f64>>,
}

impl LevelData {
    /// An empty level; populated by `update()`.
    pub fn empty() -> Self {
        Self {
            space: ConfigSpace::vector(0),
            output: DVector::zeros(0),
            right_hand_side: DVector::zeros(0),
            error: DVector::zeros(0),
            jacobian: DMatrix::zeros(0, 0),
            reduced_jacobian: DMatrix::zeros(0, 0),
            reduced_error: DVector::zeros(0),
            projector: DMatrix::zeros(0, 0),
            active_rows: MatrixBlocks::default(),
            inactive_rows: BlockIndices::new(),
            equality_indices: BlockIndices::new(),
            inequality_indices: Vec::new(),
            comparison: Vec::new(),
            max_rank: 0,
            value_scratch: Vec::new(),
            jacobian_scratch: Vec::new(),
        }
    }
}
