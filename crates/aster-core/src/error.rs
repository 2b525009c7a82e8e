//! Error types for the Core IR model.

use thiserror::Error;

/// Result type alias for Core IR operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Main error type for the Core IR model.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The input was not valid module JSON.
    #[error("Failed to parse module: {0}")]
    Parse(String),

    /// Two declarations share a name.
    #[error("Duplicate declaration: {0}")]
    DuplicateDecl(String),

    /// A workflow step references an unknown sibling step.
    #[error("Workflow step {step} depends on unknown step {dependency}")]
    UnknownStep { step: String, dependency: String },

    /// Two workflow steps share a name.
    #[error("Duplicate workflow step: {0}")]
    DuplicateStep(String),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}
