//! Record/replay harness.
//!
//! A recording session wires a registry with a logged clock, a seeded and
//! logged RNG and a capturable event store. After the run, [`RecordingSession::capture`]
//! produces a serialisable [`ReplayBundle`]; [`replay_registry`] builds a
//! registry that reproduces the recorded run's scheduling decisions from
//! that bundle alone, never consulting the wall clock or a real RNG.

use crate::clock::{DeterministicRandom, RecordedValues, RecordingClock, RecordingSnapshot, ReplayClock};
use crate::config::RuntimeConfig;
use crate::registry::TaskRegistry;
use aster_events::{InMemoryEventStore, WorkflowEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything a replay run needs: the workflow's event stream plus the
/// recorded time and randomness sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayBundle {
    /// Workflow id the bundle was captured for.
    pub workflow_id: String,

    /// The workflow's full event stream from the record run.
    pub events: Vec<WorkflowEvent>,

    /// Recorded clock readings and RNG draws, by call-site tag.
    pub recording: RecordingSnapshot,
}

/// A record-mode registry plus handles to its logs, so the run can be
/// captured afterwards.
pub struct RecordingSession {
    registry: TaskRegistry,
    store: Arc<InMemoryEventStore>,
    log: Arc<RecordedValues>,
}

impl RecordingSession {
    /// Builds a record-mode registry seeded with `seed`.
    pub fn new(config: RuntimeConfig, seed: u64) -> Self {
        let log = Arc::new(RecordedValues::new());
        let store = Arc::new(InMemoryEventStore::new());
        let registry = TaskRegistry::builder(config.with_replay(false))
            .with_event_store(store.clone())
            .with_clock(Arc::new(RecordingClock::new(log.clone())))
            .with_random(Arc::new(DeterministicRandom::recording(seed, log.clone())))
            .build();
        Self {
            registry,
            store,
            log,
        }
    }

    /// The registry to register and run tasks against.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Captures the run's evidence for one workflow id.
    pub fn capture(&self, workflow_id: &str) -> ReplayBundle {
        ReplayBundle {
            workflow_id: workflow_id.to_string(),
            events: self.store.stream_snapshot(workflow_id),
            recording: self.log.snapshot(),
        }
    }
}

/// Builds a replay-mode registry from a captured bundle. Backoffs come from
/// the bundle's `RETRY_SCHEDULED` events; clock readings and RNG draws come
/// from its recording.
pub fn replay_registry(config: RuntimeConfig, bundle: &ReplayBundle) -> TaskRegistry {
    let log = Arc::new(RecordedValues::from_snapshot(bundle.recording.clone()));
    let store = Arc::new(InMemoryEventStore::new());
    store.load_stream(&bundle.workflow_id, bundle.events.clone());

    TaskRegistry::builder(config.with_replay(true))
        .with_event_store(store)
        .with_clock(Arc::new(ReplayClock::new(log.clone())))
        .with_random(Arc::new(DeterministicRandom::replaying(log)))
        .build()
}
