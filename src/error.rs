//! Error taxonomy for the reversible engine.
//!
//! Every failure is fatal for the call that raised it: reversible
//! reconstruction is exact-or-nothing, so nothing is retried internally.

use thiserror::Error;

/// Which half of a coupling block an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    F,
    G,
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Branch::F => write!(f, "F"),
            Branch::G => write!(f, "G"),
        }
    }
}

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Two coupling halves (or a tensor and its expected shape) disagree.
    #[error("shape mismatch in {context}: {left:?} vs {right:?}")]
    ShapeMismatch {
        context: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// Argument routing failed before any block executed.
    #[error("route spec mismatch for `{key}`: {reason}")]
    RouteSpecMismatch { key: String, reason: String },

    /// Backward reconstruction asked to replay randomness that was never recorded.
    #[error("block {block} branch {branch}: replay requested but no randomness was recorded")]
    RandomnessReplayFailure { block: usize, branch: Branch },

    /// Two layers produced the same state field with different shapes.
    #[error("state field `{field}` has shape {found:?}, expected {expected:?}")]
    StateShapeMismatch {
        field: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn shape(context: impl Into<String>, left: &[usize], right: &[usize]) -> Self {
        EngineError::ShapeMismatch {
            context: context.into(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }

    pub(crate) fn route(key: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::RouteSpecMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
