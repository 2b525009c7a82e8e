//! Workflow event model.

use serde::{Deserialize, Serialize};

/// Workflow event type. Wire tags are SCREAMING_SNAKE_CASE.
///
/// The workflow runtime itself persists only `RetryScheduled`; the remaining
/// types are appended by collaborators sharing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A failed attempt was scheduled for retry after a backoff delay.
    RetryScheduled,

    /// A workflow began executing.
    WorkflowStarted,

    /// A workflow reached a successful terminal outcome.
    WorkflowCompleted,

    /// A workflow reached a failed terminal outcome.
    WorkflowFailed,

    /// A task completed successfully.
    TaskCompleted,

    /// A task failed terminally.
    TaskFailed,

    /// A compensation callback ran.
    CompensationExecuted,
}

/// One event in a workflow's append-only stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Position in the workflow's stream, starting at 1.
    pub sequence: u64,

    /// Owning workflow id.
    pub workflow_id: String,

    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Type-specific payload.
    pub payload: serde_json::Value,

    /// Epoch milliseconds at append time.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,

    /// Upcoming attempt number, for retry events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,

    /// Backoff delay in milliseconds, for retry events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay_ms: Option<u64>,

    /// Human-readable failure reason, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl WorkflowEvent {
    /// Reads the `taskId` field of the payload, if present.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("taskId").and_then(|v| v.as_str())
    }
}

/// An event before the store assigns its sequence number.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Event type tag.
    pub event_type: EventType,

    /// Type-specific payload.
    pub payload: serde_json::Value,

    /// Epoch milliseconds supplied by the caller's clock.
    pub timestamp_ms: i64,

    /// Upcoming attempt number, for retry events.
    pub attempt_number: Option<u32>,

    /// Backoff delay in milliseconds, for retry events.
    pub backoff_delay_ms: Option<u64>,

    /// Human-readable failure reason, where applicable.
    pub failure_reason: Option<String>,
}

impl EventDraft {
    /// Creates a draft with no retry metadata.
    pub fn new(event_type: EventType, payload: serde_json::Value, timestamp_ms: i64) -> Self {
        Self {
            event_type,
            payload,
            timestamp_ms,
            attempt_number: None,
            backoff_delay_ms: None,
            failure_reason: None,
        }
    }

    /// Creates a `RETRY_SCHEDULED` draft. The payload carries the task id;
    /// `attempt_number` is the upcoming attempt.
    pub fn retry_scheduled(
        task_id: &str,
        attempt_number: u32,
        backoff_delay_ms: u64,
        reason: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            event_type: EventType::RetryScheduled,
            payload: serde_json::json!({ "taskId": task_id }),
            timestamp_ms,
            attempt_number: Some(attempt_number),
            backoff_delay_ms: Some(backoff_delay_ms),
            failure_reason: Some(reason.into()),
        }
    }

    /// Finalises the draft into a stored event at the given sequence.
    pub fn into_event(self, workflow_id: &str, sequence: u64) -> WorkflowEvent {
        WorkflowEvent {
            sequence,
            workflow_id: workflow_id.to_string(),
            event_type: self.event_type,
            payload: self.payload,
            timestamp_ms: self.timestamp_ms,
            attempt_number: self.attempt_number,
            backoff_delay_ms: self.backoff_delay_ms,
            failure_reason: self.failure_reason,
        }
    }
}
