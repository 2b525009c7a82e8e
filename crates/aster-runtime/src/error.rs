//! Error types for the Aster workflow runtime.

use aster_core::CoreError;
use aster_events::EventError;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Main error type for the workflow runtime.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// Registering a task id already present.
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    /// Registering a workflow step name already present.
    #[error("Duplicate step: {0}")]
    DuplicateStep(String),

    /// A step references a name that is not registered.
    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    /// Registration would create a dependency cycle.
    #[error("Dependency cycle detected: {0}")]
    Cycle(String),

    /// First terminal task failure, carrying the original error.
    #[error("Task {task_id} failed: {source}")]
    TaskFailure {
        task_id: String,
        #[source]
        source: Box<RuntimeError>,
    },

    /// Retry policy exhausted.
    #[error("Task {task_id} failed after {max_attempts} attempts: {source}")]
    MaxRetriesExceeded {
        task_id: String,
        max_attempts: u32,
        #[source]
        source: Box<RuntimeError>,
    },

    /// Per-task deadline expired.
    #[error("Task {0} timed out")]
    Timeout(String),

    /// Outer workflow deadline expired.
    #[error("Workflow timed out after {0}ms")]
    WorkflowTimeout(u64),

    /// Ready set empty with non-terminal tasks and no runnable progress.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Replay consumed a record that does not match the current call site.
    #[error("Replay divergence: {0}")]
    ReplayDivergence(String),

    /// A task body reported a failure.
    #[error("Task execution failed: {task_id}, reason: {reason}")]
    TaskExecutionFailed { task_id: String, reason: String },

    /// A task was explicitly aborted.
    #[error("Task {0} was cancelled")]
    Cancelled(String),

    /// Event log failure.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventError),

    /// Invalid Core IR input.
    #[error("Invalid module: {0}")]
    Module(#[from] CoreError),

    /// Internal runtime defect.
    #[error("Internal workflow runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Returns true if the error may be absorbed by a retry policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RuntimeError::Cancelled(_)
                | RuntimeError::ReplayDivergence(_)
                | RuntimeError::Deadlock(_)
                | RuntimeError::WorkflowTimeout(_)
                | RuntimeError::DuplicateTask(_)
                | RuntimeError::DuplicateStep(_)
                | RuntimeError::UnknownDependency { .. }
                | RuntimeError::Cycle(_)
        )
    }

    /// Returns true for errors that already carry task failure context and
    /// are surfaced as-is rather than wrapped in `TaskFailure`.
    pub fn carries_task_context(&self) -> bool {
        matches!(
            self,
            RuntimeError::Timeout(_)
                | RuntimeError::MaxRetriesExceeded { .. }
                | RuntimeError::TaskFailure { .. }
        )
    }
}
