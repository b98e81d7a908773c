//! Error types for model construction, sampling and inference.

use stochgraph_diff::DiffError;
use thiserror::Error;

/// Errors that can occur while building, sampling or fitting a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// A value's shape is incompatible with what a variable requires.
    #[error("Shape mismatch at '{variable}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        variable: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A variable refers to a parent that does not exist.
    #[error("Variable '{variable}' depends on unknown variable '{missing}'")]
    UnresolvedDependency { variable: String, missing: String },

    /// The dependency graph has a cycle through this variable.
    #[error("Dependency cycle through variable '{variable}'")]
    CyclicGraph { variable: String },

    /// Two variables were defined with the same name.
    #[error("Variable '{name}' is already defined")]
    DuplicateVariable { name: String },

    /// Posterior sampling before any posterior was fitted.
    #[error("No posterior has been fitted for roots {roots:?}")]
    NoPosteriorDefined { roots: Vec<String> },

    /// The loss became NaN or infinite during inference.
    #[error("Loss became non-finite ({value}) at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, value: f32 },

    /// Invalid settings or an unsupported model structure.
    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },

    /// Saving or loading parameters failed.
    #[error("Persistence error: {reason}")]
    Persistence { reason: String },
}

impl ModelError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ModelError::ConfigurationError {
            reason: reason.into(),
        }
    }

    /// Attach a variable name to a backend error. Shape conflicts keep their
    /// shapes; anything else is a configuration problem at that variable.
    pub(crate) fn backend(variable: &str, err: DiffError) -> Self {
        match err {
            DiffError::ShapeMismatch { expected, got, .. } => ModelError::ShapeMismatch {
                variable: variable.to_string(),
                expected,
                got,
            },
            other => ModelError::config(format!("'{}': {}", variable, other)),
        }
    }
}

/// Extension for lifting backend results with a variable name attached.
pub(crate) trait AtVariable<T> {
    fn at(self, variable: &str) -> Result<T, ModelError>;
}

impl<T> AtVariable<T> for Result<T, DiffError> {
    fn at(self, variable: &str) -> Result<T, ModelError> {
        self.map_err(|e| ModelError::backend(variable, e))
    }
}
