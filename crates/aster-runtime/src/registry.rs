//! Task registry: the scheduling heart of the runtime.
//!
//! Owns the task state machine, submits ready tasks to the worker pool,
//! enforces timeouts, absorbs retryable failures through the retry engine
//! and cascades failures as downstream cancellation. All cross-thread state
//! mutation goes through compare-and-set on each task's state cell; the
//! dependency graph is mutated only under the registry's single lock.

use crate::clock::{Clock, DeterministicRandom, RecordedValues, ReplayClock, SystemClock};
use crate::compensation::{CompensationCallback, CompensationStack};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::facade::{CapabilitySet, FrameSnapshot, TaskBody};
use crate::graph::{DependencyGraph, TaskId, WorkflowId};
use crate::retry::{DelayedRetry, RetryEngine, RetryPolicy};
use aster_core::Value;
use aster_events::{EventStore, InMemoryEventStore};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Execution state of a task. One per task, machine-wide.
#[derive(Debug, Clone)]
pub enum TaskState {
    /// Registered, not yet running.
    Pending,

    /// A worker has begun execution.
    Running,

    /// Terminal: result stored.
    Completed(Value),

    /// Terminal: error stored; triggers downstream cancellation.
    Failed(RuntimeError),

    /// Terminal: explicitly aborted.
    Cancelled,
}

impl TaskState {
    /// The state's discriminant.
    pub fn kind(&self) -> TaskStateKind {
        match self {
            TaskState::Pending => TaskStateKind::Pending,
            TaskState::Running => TaskStateKind::Running,
            TaskState::Completed(_) => TaskStateKind::Completed,
            TaskState::Failed(_) => TaskStateKind::Failed,
            TaskState::Cancelled => TaskStateKind::Cancelled,
        }
    }
}

/// Discriminant of [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStateKind {
    /// Registered, not yet running.
    Pending,
    /// A worker has begun execution.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Terminal abort.
    Cancelled,
}

impl TaskStateKind {
    /// Returns true for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStateKind::Completed | TaskStateKind::Failed | TaskStateKind::Cancelled
        )
    }
}

/// Single-writer state cell; every transition is a compare-and-set.
#[derive(Debug)]
struct StateCell(Mutex<TaskState>);

impl StateCell {
    fn new() -> Self {
        Self(Mutex::new(TaskState::Pending))
    }

    fn kind(&self) -> TaskStateKind {
        self.0.lock().kind()
    }

    fn snapshot(&self) -> TaskState {
        self.0.lock().clone()
    }

    /// Transitions to `to` iff the current discriminant is `from`.
    fn transition(&self, from: TaskStateKind, to: TaskState) -> bool {
        let mut state = self.0.lock();
        if state.kind() == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

/// Registration request for one task.
pub struct TaskSpec {
    /// Unique task id.
    pub id: TaskId,

    /// Owning workflow id (required; there is no registry-global workflow).
    pub workflow_id: WorkflowId,

    /// Dependency task ids.
    pub deps: Vec<TaskId>,

    /// Scheduling priority; lower runs earlier.
    pub priority: i32,

    /// Per-task timeout in milliseconds; `None` uses the configured default,
    /// and 0 means no timeout.
    pub timeout_ms: Option<u64>,

    /// Optional retry policy.
    pub retry: Option<RetryPolicy>,

    /// Optional rollback callback, pushed on successful completion.
    pub compensation: Option<CompensationCallback>,

    /// Effect capabilities the body runs under.
    pub capabilities: CapabilitySet,

    /// The task body.
    pub body: TaskBody,
}

impl TaskSpec {
    /// Creates a spec with no dependencies, default priority and no timeout
    /// override.
    pub fn new(id: impl Into<TaskId>, workflow_id: impl Into<WorkflowId>, body: TaskBody) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            deps: Vec::new(),
            priority: 0,
            timeout_ms: None,
            retry: None,
            compensation: None,
            capabilities: CapabilitySet::default(),
            body,
        }
    }

    /// Adds a dependency.
    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Replaces the dependency list.
    pub fn with_deps(mut self, deps: Vec<TaskId>) -> Self {
        self.deps = deps;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-task timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the compensation callback.
    pub fn with_compensation(mut self, callback: CompensationCallback) -> Self {
        self.compensation = Some(callback);
        self
    }

    /// Sets the capability set.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Registered task with its state machine and in-flight bookkeeping.
struct TaskEntry {
    id: TaskId,
    workflow_id: WorkflowId,
    timeout_ms: u64,
    retry: Option<RetryPolicy>,
    compensation: Option<CompensationCallback>,
    capabilities: CapabilitySet,
    body: TaskBody,
    state: StateCell,
    submitted: AtomicBool,
    attempt: AtomicU32,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Registry statistics snapshot.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Total registered tasks.
    pub total: usize,

    /// Tasks by state discriminant name.
    pub by_state: HashMap<String, usize>,

    /// Non-terminal task count.
    pub remaining: usize,

    /// Pending delayed retries.
    pub delayed_retries: usize,
}

struct RegistryInner {
    config: RuntimeConfig,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    graph: Mutex<DependencyGraph>,
    remaining: AtomicUsize,
    first_failure: Mutex<Option<(TaskId, RuntimeError)>>,
    last_failed_workflow: Mutex<Option<WorkflowId>>,
    compensation: Arc<CompensationStack>,
    retry_engine: Arc<RetryEngine>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    scheduler_notify: Notify,
    shutdown: CancellationToken,
    poller_started: AtomicBool,
    poller_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for a [`TaskRegistry`].
pub struct TaskRegistryBuilder {
    config: RuntimeConfig,
    events: Option<Arc<dyn EventStore>>,
    clock: Option<Arc<dyn Clock>>,
    random: Option<Arc<DeterministicRandom>>,
}

impl TaskRegistryBuilder {
    /// Starts a builder with the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            events: None,
            clock: None,
            random: None,
        }
    }

    /// Supplies the event store (defaults to an in-memory store).
    pub fn with_event_store(mut self, events: Arc<dyn EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    /// Supplies the clock (defaults to the system clock, or a replay clock
    /// over an empty recording in replay mode).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Supplies the randomness source (defaults to a freshly-seeded
    /// recording RNG, or a replaying RNG over an empty recording in replay
    /// mode).
    pub fn with_random(mut self, random: Arc<DeterministicRandom>) -> Self {
        self.random = Some(random);
        self
    }

    /// Builds the registry.
    pub fn build(self) -> TaskRegistry {
        let replay = self.config.replay;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let clock = self.clock.unwrap_or_else(|| {
            if replay {
                Arc::new(ReplayClock::new(Arc::new(RecordedValues::new()))) as Arc<dyn Clock>
            } else {
                Arc::new(SystemClock) as Arc<dyn Clock>
            }
        });
        let random = self.random.unwrap_or_else(|| {
            let log = Arc::new(RecordedValues::new());
            if replay {
                Arc::new(DeterministicRandom::replaying(log))
            } else {
                Arc::new(DeterministicRandom::recording(rand::random::<u64>(), log))
            }
        });

        let retry_engine = Arc::new(RetryEngine::new(
            replay,
            random,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));

        let pool_size = self.config.thread_pool_size.max(1);
        TaskRegistry {
            inner: Arc::new(RegistryInner {
                config: self.config,
                tasks: DashMap::new(),
                graph: Mutex::new(DependencyGraph::new()),
                remaining: AtomicUsize::new(0),
                first_failure: Mutex::new(None),
                last_failed_workflow: Mutex::new(None),
                compensation: Arc::new(CompensationStack::new()),
                retry_engine,
                events,
                clock,
                semaphore: Arc::new(Semaphore::new(pool_size)),
                scheduler_notify: Notify::new(),
                shutdown: CancellationToken::new(),
                poller_started: AtomicBool::new(false),
                poller_handle: Mutex::new(None),
            }),
        }
    }
}

/// Owns all task state for one workflow runtime instance. Cloning shares the
/// same instance.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    /// Creates a registry with default collaborators.
    pub fn new(config: RuntimeConfig) -> Self {
        TaskRegistryBuilder::new(config).build()
    }

    /// Returns a builder for customising collaborators.
    pub fn builder(config: RuntimeConfig) -> TaskRegistryBuilder {
        TaskRegistryBuilder::new(config)
    }

    /// Registers a new task. Fails with `DuplicateTask` if the id exists and
    /// `Cycle` if its dependencies would close a cycle.
    pub fn register(&self, spec: TaskSpec) -> RuntimeResult<()> {
        let timeout_ms = spec
            .timeout_ms
            .unwrap_or(self.inner.config.default_timeout_ms);

        self.inner
            .graph
            .lock()
            .add(&spec.id, &spec.deps, spec.priority)?;

        let entry = Arc::new(TaskEntry {
            id: spec.id.clone(),
            workflow_id: spec.workflow_id,
            timeout_ms,
            retry: spec.retry,
            compensation: spec.compensation,
            capabilities: spec.capabilities,
            body: spec.body,
            state: StateCell::new(),
            submitted: AtomicBool::new(false),
            attempt: AtomicU32::new(1),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        use dashmap::mapref::entry::Entry;
        match self.inner.tasks.entry(spec.id.clone()) {
            Entry::Occupied(_) => {
                self.inner.graph.lock().remove(&spec.id);
                return Err(RuntimeError::DuplicateTask(spec.id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        self.inner.remaining.fetch_add(1, Ordering::SeqCst);
        self.inner.scheduler_notify.notify_waiters();
        debug!(task_id = %spec.id, "task registered");
        Ok(())
    }

    /// Registers a new task with retry bookkeeping.
    pub fn register_with_retry(&self, spec: TaskSpec, policy: RetryPolicy) -> RuntimeResult<()> {
        self.register(spec.with_retry(policy))
    }

    /// Drives the scheduling loop until all registered tasks reach terminal
    /// states. Returns normally on all-success; otherwise cancels the
    /// remainder, runs compensation for the failing workflow and propagates
    /// the first terminal failure.
    pub async fn run_until_complete(&self) -> RuntimeResult<()> {
        self.ensure_poller();
        // A previous run's surfaced failure must not poison this one.
        *self.inner.first_failure.lock() = None;
        *self.inner.last_failed_workflow.lock() = None;
        loop {
            if self.first_failure_set() {
                return Err(self.fail_and_compensate().await);
            }
            if self.inner.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }

            let ready = self.inner.graph.lock().ready_snapshot();
            let mut submitted_any = false;
            for id in ready {
                if self.first_failure_set() {
                    break;
                }
                let Some(entry) = self.inner.tasks.get(&id).map(|e| Arc::clone(e.value())) else {
                    continue;
                };
                if entry.state.kind() != TaskStateKind::Pending
                    || entry.submitted.load(Ordering::SeqCst)
                {
                    continue;
                }

                let permit = match Arc::clone(&self.inner.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(RuntimeError::Internal("worker pool closed".to_string()))
                    }
                };
                if entry
                    .submitted
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    submitted_any = true;
                    self.spawn_worker(entry, permit);
                }
            }

            if submitted_any {
                continue;
            }

            if self.first_failure_set() {
                return Err(self.fail_and_compensate().await);
            }

            let in_flight = self.inner.tasks.iter().any(|e| {
                let kind = e.value().state.kind();
                kind == TaskStateKind::Running
                    || (kind == TaskStateKind::Pending
                        && e.value().submitted.load(Ordering::SeqCst))
            });
            if in_flight || !self.inner.retry_engine.queue_is_empty() {
                self.park(Duration::from_millis(10)).await;
                continue;
            }

            if self.inner.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }

            let diagnostic = self.deadlock_diagnostic();
            // A completion may have arrived while the diagnostic was built.
            if self.inner.remaining.load(Ordering::SeqCst) == 0 || self.first_failure_set() {
                continue;
            }
            error!(%diagnostic, "workflow runtime deadlocked");
            return Err(RuntimeError::Deadlock(diagnostic));
        }
    }

    /// Runs the scheduling loop under an outer deadline. On expiry every
    /// non-terminal task is cancelled, running tasks get a bounded grace
    /// period to observe the cancellation, and a `WorkflowTimeout` is
    /// reported.
    pub async fn run_with_timeout(&self, timeout_ms: u64) -> RuntimeResult<()> {
        match timeout(Duration::from_millis(timeout_ms), self.run_until_complete()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms, "workflow deadline expired; cancelling all tasks");
                self.cancel_all();
                self.await_quiescent(self.inner.config.grace_period_ms).await;
                Err(RuntimeError::WorkflowTimeout(timeout_ms))
            }
        }
    }

    /// Requests cancellation of one task and its transitive dependents.
    pub fn cancel(&self, id: &str) {
        RegistryInner::cancel_task(&self.inner, id);
    }

    /// Requests cancellation of every registered task.
    pub fn cancel_all(&self) {
        let ids: Vec<TaskId> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            RegistryInner::cancel_task(&self.inner, &id);
        }
    }

    /// Waits until every registered task is terminal. Returns false if the
    /// deadline passes first.
    pub async fn await_quiescent(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let active = self
                .inner
                .tasks
                .iter()
                .any(|e| !e.value().state.kind().is_terminal());
            if !active {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(10));
            tokio::select! {
                _ = self.inner.scheduler_notify.notified() => {}
                _ = sleep(slice) => {}
            }
        }
    }

    /// Stops the delay-queue poller and drains workers with a bounded join.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.cancel_all();
        self.await_quiescent(self.inner.config.grace_period_ms).await;
        let handle = self.inner.poller_handle.lock().take();
        if let Some(handle) = handle {
            let _ = timeout(
                Duration::from_millis(self.inner.config.grace_period_ms),
                handle,
            )
            .await;
        }
        info!("task registry shut down");
    }

    /// Removes a task and its graph node (workflow teardown). A non-terminal
    /// task is cancelled first.
    pub fn remove(&self, id: &str) {
        RegistryInner::cancel_task(&self.inner, id);
        self.inner.tasks.remove(id);
        self.inner.graph.lock().remove(id);
    }

    /// Current state discriminant of a task.
    pub fn state(&self, id: &str) -> Option<TaskStateKind> {
        self.inner.tasks.get(id).map(|e| e.value().state.kind())
    }

    /// Stored result of a completed task.
    pub fn result(&self, id: &str) -> Option<Value> {
        self.inner.tasks.get(id).and_then(|e| {
            match e.value().state.snapshot() {
                TaskState::Completed(value) => Some(value),
                _ => None,
            }
        })
    }

    /// Stored error of a failed task.
    pub fn task_error(&self, id: &str) -> Option<RuntimeError> {
        self.inner.tasks.get(id).and_then(|e| {
            match e.value().state.snapshot() {
                TaskState::Failed(err) => Some(err),
                _ => None,
            }
        })
    }

    /// Number of non-terminal tasks.
    pub fn remaining_tasks(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    /// The per-workflow compensation stacks.
    pub fn compensation(&self) -> &Arc<CompensationStack> {
        &self.inner.compensation
    }

    /// The event store shared with collaborators.
    pub fn events(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.inner.events)
    }

    /// The registry configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RegistryStats {
        let mut by_state: HashMap<String, usize> = HashMap::new();
        for entry in self.inner.tasks.iter() {
            let name = format!("{:?}", entry.value().state.kind());
            *by_state.entry(name).or_insert(0) += 1;
        }
        RegistryStats {
            total: self.inner.tasks.len(),
            by_state,
            remaining: self.inner.remaining.load(Ordering::SeqCst),
            delayed_retries: self.inner.retry_engine.queue_len(),
        }
    }

    fn spawn_worker(&self, entry: Arc<TaskEntry>, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(&self.inner);
        let task = Arc::clone(&entry);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            RegistryInner::run_worker(inner, task).await;
        });
        *entry.handle.lock() = Some(handle);
    }

    fn ensure_poller(&self) {
        if self.inner.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(inner.config.poll_interval_ms.clamp(1, 100));
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                for retry in inner.retry_engine.pop_due(Instant::now()) {
                    RegistryInner::re_arm(&inner, retry);
                }
            }
            debug!("delay-queue poller stopped");
        });
        *self.inner.poller_handle.lock() = Some(handle);
    }

    fn first_failure_set(&self) -> bool {
        self.inner.first_failure.lock().is_some()
    }

    async fn fail_and_compensate(&self) -> RuntimeError {
        let Some((task_id, cause)) = self.inner.first_failure.lock().clone() else {
            return RuntimeError::Internal(
                "failure path entered without a recorded failure".to_string(),
            );
        };

        self.cancel_all();
        self.await_quiescent(self.inner.config.grace_period_ms).await;

        let failed_workflow = self.inner.last_failed_workflow.lock().clone();
        if let Some(workflow_id) = failed_workflow {
            let compensated = self.inner.compensation.compensate(&workflow_id).await;
            if !compensated.is_empty() {
                info!(
                    workflow_id = %workflow_id,
                    count = compensated.len(),
                    "ran compensation callbacks"
                );
            }
        }

        if cause.carries_task_context() {
            cause
        } else {
            RuntimeError::TaskFailure {
                task_id,
                source: Box::new(cause),
            }
        }
    }

    async fn park(&self, max: Duration) {
        tokio::select! {
            _ = self.inner.scheduler_notify.notified() => {}
            _ = sleep(max) => {}
        }
    }

    fn deadlock_diagnostic(&self) -> String {
        let graph = self.inner.graph.lock();

        let mut running: Vec<TaskId> = self
            .inner
            .tasks
            .iter()
            .filter(|e| e.value().state.kind() == TaskStateKind::Running)
            .map(|e| e.key().clone())
            .collect();
        running.sort();

        let pending = graph
            .pending_with_unmet()
            .into_iter()
            .filter(|(id, _)| {
                self.state(id)
                    .map(|kind| kind == TaskStateKind::Pending)
                    .unwrap_or(false)
            })
            .map(|(id, unmet)| format!("{} waits on [{}]", id, unmet.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");

        let cycle = graph
            .find_cycle()
            .map(|path| path.join(" -> "))
            .unwrap_or_else(|| "none found".to_string());

        format!(
            "no runnable tasks remain; running: [{}]; pending: {}; cycle: {}",
            running.join(", "),
            if pending.is_empty() {
                "none".to_string()
            } else {
                pending
            },
            cycle
        )
    }

    /// Wires an undetectable cycle directly into the graph, bypassing the
    /// insertion check. Deadlock-diagnostic test hook.
    #[cfg(test)]
    pub(crate) fn inject_cycle_for_tests(&self, a: &str, b: &str) {
        use crate::facade::body_fn;
        for (id, dep) in [(a, b), (b, a)] {
            let entry = Arc::new(TaskEntry {
                id: id.to_string(),
                workflow_id: "wf-injected".to_string(),
                timeout_ms: 0,
                retry: None,
                compensation: None,
                capabilities: CapabilitySet::default(),
                body: body_fn(|_| async { Ok(Value::Unit) }),
                state: StateCell::new(),
                submitted: AtomicBool::new(false),
                attempt: AtomicU32::new(1),
                cancel: CancellationToken::new(),
                handle: Mutex::new(None),
            });
            self.inner.tasks.insert(id.to_string(), entry);
            self.inner
                .graph
                .lock()
                .add_unchecked(id, &[dep.to_string()], 0);
            self.inner.remaining.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl RegistryInner {
    async fn run_worker(inner: Arc<Self>, entry: Arc<TaskEntry>) {
        // A dependency may have failed between readiness and submission.
        if Self::any_dep_unrunnable(&inner, &entry) {
            if entry
                .state
                .transition(TaskStateKind::Pending, TaskState::Cancelled)
            {
                debug!(task_id = %entry.id, "cancelled before start: dependency failed");
                Self::finalize_terminal(&inner, &entry);
            }
            return;
        }

        if !entry
            .state
            .transition(TaskStateKind::Pending, TaskState::Running)
        {
            // Cancelled while queued; cancel() already finalised the state.
            return;
        }

        let attempt = entry.attempt.load(Ordering::SeqCst);
        debug!(task_id = %entry.id, attempt, "task body starting");
        let snapshot = FrameSnapshot::new(entry.workflow_id.clone(), entry.id.clone(), attempt)
            .with_capabilities(entry.capabilities.clone());

        let body = (entry.body)(snapshot);
        let result: RuntimeResult<Value> = if entry.timeout_ms > 0 {
            tokio::select! {
                _ = entry.cancel.cancelled() => Err(RuntimeError::Cancelled(entry.id.clone())),
                outcome = timeout(Duration::from_millis(entry.timeout_ms), body) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::Timeout(entry.id.clone())),
                },
            }
        } else {
            tokio::select! {
                _ = entry.cancel.cancelled() => Err(RuntimeError::Cancelled(entry.id.clone())),
                result = body => result,
            }
        };

        match result {
            Ok(value) => {
                if entry
                    .state
                    .transition(TaskStateKind::Running, TaskState::Completed(value))
                {
                    if let Some(callback) = entry.compensation.clone() {
                        inner
                            .compensation
                            .push(&entry.workflow_id, &entry.id, callback);
                    }
                    info!(task_id = %entry.id, attempt, "task completed");
                    Self::finalize_terminal(&inner, &entry);
                }
            }
            Err(RuntimeError::Cancelled(_)) => {
                if entry
                    .state
                    .transition(TaskStateKind::Running, TaskState::Cancelled)
                {
                    debug!(task_id = %entry.id, "task cancelled while running");
                    Self::finalize_terminal(&inner, &entry);
                }
            }
            Err(err) => {
                Self::handle_failure(&inner, &entry, attempt, err).await;
            }
        }
    }

    async fn handle_failure(
        inner: &Arc<Self>,
        entry: &Arc<TaskEntry>,
        attempt: u32,
        err: RuntimeError,
    ) {
        let mut terminal_err = err;
        if let Some(policy) = entry.retry.clone() {
            if terminal_err.is_retryable() && !entry.cancel.is_cancelled() {
                if attempt < policy.max_attempts {
                    match Self::schedule_retry(inner, entry, attempt, &policy, &terminal_err).await
                    {
                        Ok(delay_ms) => {
                            warn!(
                                task_id = %entry.id,
                                attempt,
                                delay_ms,
                                "task failed; retry scheduled"
                            );
                            return;
                        }
                        Err(replay_err) => {
                            // Divergence or event-store failure is terminal.
                            terminal_err = replay_err;
                        }
                    }
                } else {
                    terminal_err = RuntimeError::MaxRetriesExceeded {
                        task_id: entry.id.clone(),
                        max_attempts: policy.max_attempts,
                        source: Box::new(terminal_err),
                    };
                }
            }
        }

        if entry
            .state
            .transition(TaskStateKind::Running, TaskState::Failed(terminal_err.clone()))
        {
            error!(task_id = %entry.id, error = %terminal_err, "task failed terminally");
            {
                let mut first = inner.first_failure.lock();
                if first.is_none() {
                    *first = Some((entry.id.clone(), terminal_err));
                    *inner.last_failed_workflow.lock() = Some(entry.workflow_id.clone());
                }
            }
            Self::finalize_terminal(inner, entry);
            Self::cancel_downstream(inner, &entry.id);
        }
    }

    /// Books a retry: resolves the delay, records the evidence event, queues
    /// the delayed re-arm and re-opens the task state. The non-terminal
    /// counter is untouched; the eventual terminal attempt decrements it.
    async fn schedule_retry(
        inner: &Arc<Self>,
        entry: &Arc<TaskEntry>,
        failed_attempt: u32,
        policy: &RetryPolicy,
        cause: &RuntimeError,
    ) -> RuntimeResult<u64> {
        let delay_ms = inner
            .retry_engine
            .next_delay(&entry.workflow_id, &entry.id, failed_attempt, policy)
            .await?;
        inner
            .retry_engine
            .record_scheduled(
                &entry.workflow_id,
                &entry.id,
                failed_attempt + 1,
                delay_ms,
                &cause.to_string(),
            )
            .await?;

        // Queue first, then re-open the state, so the scheduler can never
        // observe a pending task with no pending retry.
        inner
            .retry_engine
            .schedule(&entry.id, &entry.workflow_id, delay_ms, failed_attempt + 1);
        entry.attempt.store(failed_attempt + 1, Ordering::SeqCst);
        entry
            .state
            .transition(TaskStateKind::Running, TaskState::Pending);
        inner.scheduler_notify.notify_waiters();
        Ok(delay_ms)
    }

    /// Re-arms a delayed retry whose trigger time has passed: re-checks
    /// dependencies, clears `submitted` and wakes the scheduler.
    fn re_arm(inner: &Arc<Self>, retry: DelayedRetry) {
        let Some(entry) = inner
            .tasks
            .get(retry.task_id.as_str())
            .map(|e| Arc::clone(e.value()))
        else {
            return;
        };

        match entry.state.kind() {
            TaskStateKind::Pending => {
                let deps_met = inner.graph.lock().deps_met(&entry.id);
                if deps_met {
                    entry.submitted.store(false, Ordering::SeqCst);
                    inner.scheduler_notify.notify_waiters();
                    debug!(task_id = %entry.id, attempt = retry.attempt, "delayed retry re-armed");
                } else {
                    inner.retry_engine.reschedule(
                        retry,
                        Duration::from_millis(inner.config.poll_interval_ms),
                    );
                }
            }
            TaskStateKind::Running => {
                // The failing attempt has not finished its bookkeeping yet.
                inner.retry_engine.reschedule(
                    retry,
                    Duration::from_millis(inner.config.poll_interval_ms),
                );
            }
            _ => {} // terminal; the retry is moot
        }
    }

    fn any_dep_unrunnable(inner: &Arc<Self>, entry: &TaskEntry) -> bool {
        let deps = inner.graph.lock().deps_of(&entry.id);
        deps.iter().any(|dep| {
            inner
                .tasks
                .get(dep.as_str())
                .map(|d| {
                    matches!(
                        d.value().state.kind(),
                        TaskStateKind::Failed | TaskStateKind::Cancelled
                    )
                })
                .unwrap_or(false)
        })
    }

    /// Marks the graph node completed and decrements the non-terminal
    /// counter. Callers gate on a successful terminal CAS, so this runs
    /// exactly once per attempt that terminates without a retry.
    fn finalize_terminal(inner: &Arc<Self>, entry: &TaskEntry) {
        {
            let mut graph = inner.graph.lock();
            // The node is gone if the task was removed mid-flight; marking it
            // would leave a stale completion behind.
            if graph.contains(&entry.id) {
                graph.mark_completed(&entry.id);
            }
        }
        let previous = inner.remaining.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "non-terminal counter underflow");
        inner.scheduler_notify.notify_waiters();
    }

    /// Cancellation discipline: a pending task is CAS'd to `Cancelled` here;
    /// a running task gets an interrupt request and its worker finaliser
    /// performs the terminal transition, so the counter decrements exactly
    /// once either way.
    fn cancel_task(inner: &Arc<Self>, id: &str) {
        let Some(entry) = inner.tasks.get(id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        loop {
            match entry.state.kind() {
                TaskStateKind::Pending => {
                    if entry
                        .state
                        .transition(TaskStateKind::Pending, TaskState::Cancelled)
                    {
                        debug!(task_id = %entry.id, "task cancelled");
                        Self::finalize_terminal(inner, &entry);
                        Self::cancel_downstream(inner, id);
                        break;
                    }
                    // Lost the CAS to a worker flipping to Running; re-check.
                }
                TaskStateKind::Running => {
                    if !entry.cancel.is_cancelled() {
                        entry.cancel.cancel();
                        Self::cancel_downstream(inner, id);
                    }
                    break;
                }
                _ => break,
            }
        }
    }

    /// Cancels all transitive dependents of a task.
    fn cancel_downstream(inner: &Arc<Self>, id: &str) {
        let dependents = inner.graph.lock().dependents_transitive(id);
        for dependent in dependents {
            Self::cancel_task(inner, &dependent);
        }
    }
}
