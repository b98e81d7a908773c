//! Error types for tensor and tape operations.

use thiserror::Error;

/// Errors raised while recording or differentiating a computation.
///
/// Shape errors carry both shapes so callers can attach the name of the
/// variable that produced them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiffError {
    /// Operand shapes cannot be combined.
    #[error("Shape mismatch in {op}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Wrong number of operands for an operation.
    #[error("{op} takes {expected} inputs, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Operand values are outside the operation's domain.
    #[error("Invalid value in {op}: {reason}")]
    InvalidValue { op: &'static str, reason: String },

    /// Gradients can only be seeded from a single-element output.
    #[error("Cannot differentiate a non-scalar output of shape {shape:?}")]
    NonScalarOutput { shape: Vec<usize> },

    /// A node index that does not belong to this tape.
    #[error("Node {index} is not part of this tape")]
    UnknownNode { index: usize },
}
