//! Runtime configuration with environment overrides.
//!
//! Tests construct the struct directly; the `ASTER_*` environment variables
//! are applied only by [`RuntimeConfig::from_env`].

use std::thread;
use tracing::warn;

/// Environment override for the worker pool size.
pub const ENV_THREAD_POOL_SIZE: &str = "ASTER_THREAD_POOL_SIZE";

/// Environment override for the default per-task timeout.
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "ASTER_DEFAULT_TIMEOUT_MS";

/// Configuration for a workflow runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool size. `1` is the strictly-serial determinism baseline.
    pub thread_pool_size: usize,

    /// Default per-task timeout in milliseconds; `0` means no timeout.
    pub default_timeout_ms: u64,

    /// Replay mode: backoffs and RNG values come from the event log and the
    /// recorded sequences instead of the wall clock and a real RNG.
    pub replay: bool,

    /// Grace period for quiescence after cancellation, in milliseconds.
    pub grace_period_ms: u64,

    /// Delay-queue poller cadence in milliseconds (at most 100).
    pub poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_timeout_ms: 0,
            replay: false,
            grace_period_ms: 1_000,
            poll_interval_ms: 50,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the default configuration, then applies `ASTER_*` environment
    /// overrides. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_THREAD_POOL_SIZE) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.thread_pool_size = n,
                _ => warn!(value = %raw, "ignoring invalid {}", ENV_THREAD_POOL_SIZE),
            }
        }

        if let Ok(raw) = std::env::var(ENV_DEFAULT_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => config.default_timeout_ms = ms,
                Err(_) => warn!(value = %raw, "ignoring invalid {}", ENV_DEFAULT_TIMEOUT_MS),
            }
        }

        config
    }

    /// Sets the worker pool size (minimum 1).
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// Sets the default per-task timeout.
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Enables or disables replay mode.
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }

    /// Sets the cancellation grace period.
    pub fn with_grace_period_ms(mut self, grace_period_ms: u64) -> Self {
        self.grace_period_ms = grace_period_ms;
        self
    }

    /// Sets the delay-queue poller cadence, capped at 100ms.
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms.clamp(1, 100);
        self
    }
}
