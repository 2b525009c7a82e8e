//! Error types for the event log.

use thiserror::Error;

/// Result type alias for event log operations.
pub type EventResult<T> = Result<T, EventError>;

/// Main error type for the event log.
#[derive(Error, Debug, Clone)]
pub enum EventError {
    /// No stream exists for the workflow id.
    #[error("Event stream not found: {0}")]
    StreamNotFound(String),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend failure in a persistent store implementation.
    #[error("Event store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
