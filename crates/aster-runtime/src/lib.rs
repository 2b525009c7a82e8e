//! # Aster Workflow Runtime
//!
//! Durable, deterministic, dependency-aware concurrent scheduling for the
//! workflow subprograms of Aster Core IR programs.
//!
//! ## Features
//!
//! - **Dependency-graph scheduling**: tasks run as soon as every dependency
//!   reaches a terminal state, ordered by priority with FIFO ties
//! - **Retry with backoff**: linear and exponential strategies with jitter,
//!   delayed re-arm through a background-polled queue
//! - **Compensation (Saga)**: per-workflow LIFO rollback on failure
//! - **Cancellation and timeouts**: per-task deadlines and outer workflow
//!   deadlines, cascading downstream cancellation
//! - **Deterministic replay**: recorded time, RNG draws and retry-schedule
//!   events reproduce a prior run's scheduling decisions
//! - **Deadlock detection**: a stalled graph fails with a diagnostic naming
//!   pending tasks, unmet dependencies and at least one cycle
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use aster_runtime::prelude::*;
//! use aster_core::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TaskRegistry::new(RuntimeConfig::default());
//!     let orchestrator = WorkflowOrchestrator::new(registry);
//!
//!     let plan = WorkflowPlan::new("greet")
//!         .step(WorkflowStep::new(
//!             "hello",
//!             body_fn(|_snapshot| async { Ok(Value::from("hello")) }),
//!         ))
//!         .step(
//!             WorkflowStep::new(
//!                 "world",
//!                 body_fn(|_snapshot| async { Ok(Value::from("world")) }),
//!             )
//!             .depends_on("hello"),
//!         );
//!
//!     let results = orchestrator.run(plan).await?;
//!     assert_eq!(results.len(), 2);
//!     orchestrator.registry().shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Clock & DeterministicRandom**: injected time and randomness, recorded
//!   per call-site tag for replay
//! - **DependencyGraph**: ready-set maintenance, priority ordering, cycle
//!   detection at insertion
//! - **TaskRegistry**: the task state machine and scheduling loop
//! - **RetryEngine**: backoff computation, retry evidence, delayed re-arm
//! - **CompensationStack**: per-workflow LIFO rollback callbacks
//! - **WorkflowOrchestrator**: per-workflow registration, outcome and
//!   teardown
//! - **Façades**: narrow seams to the evaluator, effect-capability plumbing
//!   and the event store

pub mod clock;
pub mod compensation;
pub mod config;
pub mod error;
pub mod facade;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod retry;

// Re-export commonly used types
pub use clock::{Clock, DeterministicRandom, RecordedValues, RecordingClock, RecordingSnapshot, ReplayClock, SystemClock};
pub use compensation::{compensation_fn, CompensationCallback, CompensationStack};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use facade::{body_fn, evaluator_body, CapabilitySet, EffectGuard, EffectPolicy, Evaluator, FrameSnapshot, TaskBody};
pub use graph::{DependencyGraph, TaskId, WorkflowId};
pub use orchestrator::{plan_from_ir, plan_from_ir_steps, WorkflowOrchestrator, WorkflowPlan, WorkflowStep};
pub use registry::{RegistryStats, TaskRegistry, TaskRegistryBuilder, TaskSpec, TaskState, TaskStateKind};
pub use replay::{replay_registry, RecordingSession, ReplayBundle};
pub use retry::{BackoffStrategy, RetryEngine, RetryPolicy};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, DeterministicRandom, RecordedValues, SystemClock};
    pub use crate::compensation::{compensation_fn, CompensationCallback};
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::facade::{body_fn, CapabilitySet, EffectPolicy, Evaluator, FrameSnapshot, TaskBody};
    pub use crate::orchestrator::{WorkflowOrchestrator, WorkflowPlan, WorkflowStep};
    pub use crate::registry::{TaskRegistry, TaskSpec, TaskState, TaskStateKind};
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
}

/// Current version of the workflow runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
