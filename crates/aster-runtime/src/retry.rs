//! Retry engine: backoff computation, retry-evidence events and the delayed
//! re-arm queue.
//!
//! On a recorded run the backoff is computed from the policy plus jitter
//! drawn through the deterministic RNG, and a `RETRY_SCHEDULED` event is
//! appended as evidence. On a replayed run the backoff is **not**
//! recomputed; it is read from the stored event for the same task and
//! upcoming attempt, and any divergence fails loudly.

use crate::clock::{Clock, DeterministicRandom, BACKOFF_TAG};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{TaskId, WorkflowId};
use aster_events::{EventDraft, EventStore, EventType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Backoff strategy for a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// `delay = base * attempt + jitter`
    Linear,

    /// `delay = base * 2^(attempt-1) + jitter`
    Exponential,
}

/// Retry policy for a task. The attempt counter starts at 1 on the first
/// try, so `max_attempts = 1` means any failure is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, at least 1.
    pub max_attempts: u32,

    /// Backoff strategy.
    pub strategy: BackoffStrategy,

    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// Creates a linear-backoff policy.
    pub fn linear(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: BackoffStrategy::Linear,
            base_delay_ms,
        }
    }

    /// Creates an exponential-backoff policy.
    pub fn exponential(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: BackoffStrategy::Exponential,
            base_delay_ms,
        }
    }
}

/// A delayed re-arm entry awaiting its trigger time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DelayedRetry {
    trigger_at: Instant,
    /// Task to re-arm.
    pub task_id: TaskId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Upcoming attempt number.
    pub attempt: u32,
}

impl DelayedRetry {
    fn new(task_id: &str, workflow_id: &str, attempt: u32, trigger_at: Instant) -> Self {
        Self {
            trigger_at,
            task_id: task_id.to_string(),
            workflow_id: workflow_id.to_string(),
            attempt,
        }
    }

    /// The same entry pushed out by an extra delay from now.
    fn deferred(mut self, extra: Duration) -> Self {
        self.trigger_at = Instant::now() + extra;
        self
    }
}

/// Min-heap of delayed retries keyed on trigger time, guarded by its own
/// lock; the poller acquires the lock only around peek/pop/push.
#[derive(Debug, Default)]
struct DelayQueue {
    heap: Mutex<BinaryHeap<Reverse<DelayedRetry>>>,
}

impl DelayQueue {
    fn push(&self, retry: DelayedRetry) {
        self.heap.lock().push(Reverse(retry));
    }

    fn pop_due(&self, now: Instant) -> Vec<DelayedRetry> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse(head)) = heap.peek() {
            if head.trigger_at > now {
                break;
            }
            if let Some(Reverse(retry)) = heap.pop() {
                due.push(retry);
            }
        }
        due
    }

    fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Computes backoffs, records retry evidence and holds the delayed re-arm
/// queue. The registry's background poller drains the queue.
pub struct RetryEngine {
    replay: bool,
    random: Arc<DeterministicRandom>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventStore>,
    queue: DelayQueue,
}

impl RetryEngine {
    /// Creates an engine. `replay` switches backoff resolution from
    /// computation to the recorded event log.
    pub fn new(
        replay: bool,
        random: Arc<DeterministicRandom>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            replay,
            random,
            clock,
            events,
            queue: DelayQueue::default(),
        }
    }

    /// Computes the backoff delay for the given failed attempt.
    ///
    /// Jitter is `floor_mod(rng, base/2)`; a zero-width window draws nothing
    /// from the RNG, keeping record and replay draw counts identical.
    pub fn compute_backoff(&self, attempt: u32, policy: &RetryPolicy) -> RuntimeResult<u64> {
        let attempt = attempt.max(1);
        let base = policy.base_delay_ms;
        let raw = match policy.strategy {
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };

        let window = base / 2;
        let jitter = if window == 0 {
            0
        } else {
            self.random.next_long(BACKOFF_TAG)?.rem_euclid(window as i64) as u64
        };
        Ok(raw.saturating_add(jitter))
    }

    /// Resolves the delay for the retry following `failed_attempt`.
    ///
    /// Replay mode reads the stored `RETRY_SCHEDULED` event for
    /// `(workflow, task, failed_attempt + 1)` and fails with
    /// `ReplayDivergence` when it is missing.
    pub async fn next_delay(
        &self,
        workflow_id: &str,
        task_id: &str,
        failed_attempt: u32,
        policy: &RetryPolicy,
    ) -> RuntimeResult<u64> {
        if !self.replay {
            return self.compute_backoff(failed_attempt, policy);
        }

        let upcoming = failed_attempt + 1;
        let events = self.events.events(workflow_id, 1).await?;
        events
            .iter()
            .find(|e| {
                e.event_type == EventType::RetryScheduled
                    && e.task_id() == Some(task_id)
                    && e.attempt_number == Some(upcoming)
            })
            .and_then(|e| e.backoff_delay_ms)
            .ok_or_else(|| {
                RuntimeError::ReplayDivergence(format!(
                    "no RETRY_SCHEDULED event recorded for task {task_id} \
                     attempt {upcoming} of workflow {workflow_id}"
                ))
            })
    }

    /// Appends the `RETRY_SCHEDULED` evidence event. A replayed run already
    /// has the event in its log and appends nothing.
    pub async fn record_scheduled(
        &self,
        workflow_id: &str,
        task_id: &str,
        upcoming_attempt: u32,
        delay_ms: u64,
        reason: &str,
    ) -> RuntimeResult<()> {
        if self.replay {
            return Ok(());
        }
        let draft = EventDraft::retry_scheduled(
            task_id,
            upcoming_attempt,
            delay_ms,
            reason,
            self.clock.now_ms(),
        );
        self.events.append(workflow_id, draft).await?;
        Ok(())
    }

    /// Enqueues a delayed re-arm for the task.
    pub fn schedule(&self, task_id: &str, workflow_id: &str, delay_ms: u64, attempt: u32) {
        debug!(task_id, workflow_id, delay_ms, attempt, "retry enqueued");
        self.queue.push(DelayedRetry::new(
            task_id,
            workflow_id,
            attempt,
            Instant::now() + Duration::from_millis(delay_ms),
        ));
    }

    /// Re-enqueues an entry that could not be re-armed yet.
    pub fn reschedule(&self, retry: DelayedRetry, extra: Duration) {
        self.queue.push(retry.deferred(extra));
    }

    /// Pops every entry whose trigger time has passed.
    pub fn pop_due(&self, now: Instant) -> Vec<DelayedRetry> {
        self.queue.pop_due(now)
    }

    /// Returns true if no delayed retries are pending.
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of pending delayed retries.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
