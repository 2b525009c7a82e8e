//! Event store with append-only stream semantics, one stream per workflow.

use crate::error::EventResult;
use crate::event::{EventDraft, WorkflowEvent};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Trait for event store implementations.
///
/// Streams are keyed by workflow id; sequence numbers start at 1 and are
/// assigned by the store at append time.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event to the workflow's stream and returns its sequence.
    async fn append(&self, workflow_id: &str, draft: EventDraft) -> EventResult<u64>;

    /// Reads events at or after `from_seq`, in stream order. An unknown
    /// workflow id reads as an empty stream.
    async fn events(&self, workflow_id: &str, from_seq: u64) -> EventResult<Vec<WorkflowEvent>>;

    /// Removes the workflow's stream entirely (workflow teardown).
    async fn remove_stream(&self, workflow_id: &str) -> EventResult<()>;

    /// Lists workflow ids with a non-empty stream.
    async fn list_workflows(&self) -> EventResult<Vec<String>>;
}

/// In-memory event store (the default for tests and single-process runs).
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<String, Vec<WorkflowEvent>>>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a full stream, for capture-and-replay flows.
    pub fn stream_snapshot(&self, workflow_id: &str) -> Vec<WorkflowEvent> {
        self.streams
            .read()
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pre-loads a captured stream, replacing any existing one. Used to seed
    /// a replay run with the record run's log.
    pub fn load_stream(&self, workflow_id: &str, events: Vec<WorkflowEvent>) {
        self.streams
            .write()
            .insert(workflow_id.to_string(), events);
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, workflow_id: &str, draft: EventDraft) -> EventResult<u64> {
        let mut streams = self.streams.write();
        let stream = streams.entry(workflow_id.to_string()).or_default();
        let sequence = stream.len() as u64 + 1;
        let event = draft.into_event(workflow_id, sequence);
        debug!(
            workflow_id,
            sequence,
            event_type = ?event.event_type,
            "appended workflow event"
        );
        stream.push(event);
        Ok(sequence)
    }

    async fn events(&self, workflow_id: &str, from_seq: u64) -> EventResult<Vec<WorkflowEvent>> {
        let streams = self.streams.read();
        Ok(streams
            .get(workflow_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_stream(&self, workflow_id: &str) -> EventResult<()> {
        self.streams.write().remove(workflow_id);
        Ok(())
    }

    async fn list_workflows(&self) -> EventResult<Vec<String>> {
        let streams = self.streams.read();
        Ok(streams
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[tokio::test]
    async fn test_append_assigns_sequences() {
        let store = InMemoryEventStore::new();

        for i in 0..3 {
            let seq = store
                .append(
                    "wf-1",
                    EventDraft::new(EventType::TaskCompleted, serde_json::json!({}), i),
                )
                .await
                .unwrap();
            assert_eq!(seq, i as u64 + 1);
        }

        let events = store.events("wf-1", 1).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].sequence, 3);
    }

    #[tokio::test]
    async fn test_read_from_sequence() {
        let store = InMemoryEventStore::new();
        for i in 0..5 {
            store
                .append(
                    "wf-1",
                    EventDraft::new(EventType::TaskCompleted, serde_json::json!({}), i),
                )
                .await
                .unwrap();
        }

        let tail = store.events("wf-1", 4).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 4);
    }

    #[tokio::test]
    async fn test_unknown_stream_reads_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.events("ghost", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let store = InMemoryEventStore::new();
        store
            .append(
                "wf-a",
                EventDraft::retry_scheduled("t", 2, 10, "boom", 0),
            )
            .await
            .unwrap();
        store
            .append(
                "wf-b",
                EventDraft::new(EventType::WorkflowStarted, serde_json::json!({}), 0),
            )
            .await
            .unwrap();

        assert_eq!(store.events("wf-a", 1).await.unwrap().len(), 1);
        assert_eq!(store.events("wf-b", 1).await.unwrap().len(), 1);

        store.remove_stream("wf-a").await.unwrap();
        assert!(store.events("wf-a", 1).await.unwrap().is_empty());
        assert_eq!(store.events("wf-b", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_load() {
        let store = InMemoryEventStore::new();
        store
            .append(
                "wf-a",
                EventDraft::retry_scheduled("t", 2, 10, "boom", 0),
            )
            .await
            .unwrap();

        let captured = store.stream_snapshot("wf-a");
        assert_eq!(captured.len(), 1);

        let replay_store = InMemoryEventStore::new();
        replay_store.load_stream("wf-a", captured);
        let events = replay_store.events("wf-a", 1).await.unwrap();
        assert_eq!(events[0].task_id(), Some("t"));
    }
}
