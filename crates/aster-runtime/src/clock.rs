//! Time and randomness sources with record/replay support.
//!
//! All scheduling decisions that depend on time or randomness go through
//! these wrappers. In record mode every produced value is appended to a
//! per-tag log; in replay mode each call pops the next recorded value for
//! the same tag and fails loudly when the sequence diverges. Tags are stable
//! domain strings (`"async-task-backoff"`), never source positions.

use crate::error::{RuntimeError, RuntimeResult};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Tag under which clock readings are recorded.
pub const CLOCK_TAG: &str = "clock.now";

/// Tag used for retry backoff jitter draws.
pub const BACKOFF_TAG: &str = "async-task-backoff";

/// Monotonic epoch-milliseconds time source.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time source.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Per-tag FIFO log of recorded values, shared by the recording clock and
/// the deterministic RNG.
#[derive(Debug, Default)]
pub struct RecordedValues {
    values: Mutex<HashMap<String, VecDeque<i64>>>,
}

/// Serializable capture of a [`RecordedValues`] log, persisted next to the
/// event log so a later run can replay it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingSnapshot {
    /// Recorded values per tag, in draw order.
    pub values: HashMap<String, Vec<i64>>,
}

impl RecordedValues {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a log from a captured snapshot.
    pub fn from_snapshot(snapshot: RecordingSnapshot) -> Self {
        let values = snapshot
            .values
            .into_iter()
            .map(|(tag, seq)| (tag, VecDeque::from(seq)))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }

    /// Appends a value under a tag.
    pub fn record(&self, tag: &str, value: i64) {
        self.values
            .lock()
            .entry(tag.to_string())
            .or_default()
            .push_back(value);
    }

    /// Pops the next value recorded under a tag.
    pub fn next(&self, tag: &str) -> Option<i64> {
        self.values.lock().get_mut(tag)?.pop_front()
    }

    /// Captures the remaining log as a snapshot, leaving the log intact.
    pub fn snapshot(&self) -> RecordingSnapshot {
        let values = self
            .values
            .lock()
            .iter()
            .map(|(tag, seq)| (tag.clone(), seq.iter().copied().collect()))
            .collect();
        RecordingSnapshot { values }
    }
}

/// Clock that records every reading for later replay.
pub struct RecordingClock {
    inner: SystemClock,
    log: Arc<RecordedValues>,
}

impl RecordingClock {
    /// Creates a recording clock appending to the shared log.
    pub fn new(log: Arc<RecordedValues>) -> Self {
        Self {
            inner: SystemClock,
            log,
        }
    }
}

impl Clock for RecordingClock {
    fn now_ms(&self) -> i64 {
        let now = self.inner.now_ms();
        self.log.record(CLOCK_TAG, now);
        now
    }
}

/// Clock that replays recorded readings and never consults the wall clock.
/// When the recording is exhausted it continues monotonically from the last
/// replayed value.
pub struct ReplayClock {
    log: Arc<RecordedValues>,
    last: AtomicI64,
}

impl ReplayClock {
    /// Creates a replay clock popping from the shared log.
    pub fn new(log: Arc<RecordedValues>) -> Self {
        Self {
            log,
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for ReplayClock {
    fn now_ms(&self) -> i64 {
        match self.log.next(CLOCK_TAG) {
            Some(recorded) => {
                self.last.store(recorded, Ordering::SeqCst);
                recorded
            }
            None => self.last.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }
}

/// Record/replay mode of the runtime's randomness source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RandomMode {
    Record,
    Replay,
}

/// Seeded RNG whose draws are recorded by call-site tag, enabling per-site
/// replay.
pub struct DeterministicRandom {
    mode: RandomMode,
    rng: Mutex<StdRng>,
    log: Arc<RecordedValues>,
}

impl DeterministicRandom {
    /// Creates a recording RNG with the given seed, appending draws to the
    /// shared log.
    pub fn recording(seed: u64, log: Arc<RecordedValues>) -> Self {
        Self {
            mode: RandomMode::Record,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            log,
        }
    }

    /// Creates a replaying RNG popping draws from the shared log.
    pub fn replaying(log: Arc<RecordedValues>) -> Self {
        Self {
            mode: RandomMode::Replay,
            // The seed is irrelevant in replay mode; the rng is never drawn.
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            log,
        }
    }

    /// Produces the next value for a call-site tag.
    ///
    /// Record mode draws from the seeded RNG and appends to the log; replay
    /// mode pops the next recorded value for the same tag and returns
    /// [`RuntimeError::ReplayDivergence`] when the sequence diverges.
    pub fn next_long(&self, tag: &str) -> RuntimeResult<i64> {
        match self.mode {
            RandomMode::Record => {
                let value = self.rng.lock().gen::<i64>();
                self.log.record(tag, value);
                Ok(value)
            }
            RandomMode::Replay => self.log.next(tag).ok_or_else(|| {
                RuntimeError::ReplayDivergence(format!(
                    "no recorded random value remains for tag {tag}"
                ))
            }),
        }
    }
}
