//! Error types of the solver.

/// Errors reported by the solver's mutating entry points.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SolverError {
    /// A constraint with the same mathematical function is already in the
    /// solver, at any priority.
    #[error("constraint \"{name}\" already in solver")]
    DuplicateConstraint {
        /// Name of the offending function.
        name: String,
    },

    /// An input had the wrong dimension for the operation.
    #[error("{what}: expected size {expected}, got {actual}")]
    ShapeMismatch {
        /// What was being checked.
        what: &'static str,
        /// The required size.
        expected: usize,
        /// The size that was provided.
        actual: usize,
    },
}

/// Errors reported by snapshot capture and restore.
#[cfg(feature = "serde")]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// No factory is registered for a function tag.
    #[error("no factory registered for function tag \"{0}\"")]
    UnknownTag(String),

    /// A function in the solver cannot be described declaratively.
    #[error("function \"{0}\" has no declarative description")]
    UnsupportedFunction(String),

    /// The saturation policy is a user callable and cannot be captured.
    #[error("custom saturation policies cannot be captured in a snapshot")]
    UnsupportedSaturation,

    /// A function description was rejected by its factory.
    #[error("bad function description: {0}")]
    BadSpec(&'static str),

    /// Restoring a constraint failed.
    #[error(transparent)]
    Solver(#[from] SolverError),
}
