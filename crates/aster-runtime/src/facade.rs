//! Narrow interfaces to the runtime's collaborators.
//!
//! The runtime never inspects how task bodies execute: it consumes only
//! `Fn(snapshot) -> Result<Value>`. The evaluator, the effect-capability
//! plumbing and the event store stay behind the seams defined here.

use crate::error::RuntimeResult;
use crate::graph::{TaskId, WorkflowId};
use aster_core::{Expr, Value};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// A task body: an async closure from a frame snapshot to a value. Bodies
/// have no registry access, keeping scheduling invariants local.
pub type TaskBody =
    Arc<dyn Fn(FrameSnapshot) -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync>;

/// Wraps an async closure as a [`TaskBody`].
pub fn body_fn<F, Fut>(f: F) -> TaskBody
where
    F: Fn(FrameSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<Value>> + Send + 'static,
{
    Arc::new(move |snapshot| Box::pin(f(snapshot)))
}

/// The execution-frame snapshot handed to a task body for one attempt.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// Owning workflow id.
    pub workflow_id: WorkflowId,

    /// Executing task id.
    pub task_id: TaskId,

    /// Attempt number, starting at 1.
    pub attempt: u32,

    /// Effect capabilities the body runs under.
    pub capabilities: CapabilitySet,
}

impl FrameSnapshot {
    /// Creates a snapshot for one attempt of a task.
    pub fn new(workflow_id: impl Into<WorkflowId>, task_id: impl Into<TaskId>, attempt: u32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            attempt: 1.max(attempt),
            capabilities: CapabilitySet::default(),
        }
    }

    /// Creates a snapshot outside any scheduled attempt, used for
    /// compensation bodies.
    pub fn detached(task_id: impl Into<TaskId>) -> Self {
        Self::new(WorkflowId::new(), task_id, 1)
    }

    /// Sets the capability set.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A set of side-effect permissions an execution context is authorised for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    /// Creates an empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from capability names.
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Returns true if the capability is granted.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Grants a capability.
    pub fn grant(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    /// Iterates granted capability names.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of granted capabilities.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Tracks the currently-active capability set; task bodies re-enter the
/// workflow's snapshot scope before executing.
#[derive(Debug, Default)]
pub struct EffectPolicy {
    current: Mutex<CapabilitySet>,
}

impl EffectPolicy {
    /// Creates a policy with an empty active set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy with the given active set.
    pub fn with_capabilities(capabilities: CapabilitySet) -> Self {
        Self {
            current: Mutex::new(capabilities),
        }
    }

    /// Snapshot of the currently-active capability set.
    pub fn snapshot(&self) -> CapabilitySet {
        self.current.lock().clone()
    }

    /// Enters a capability scope. The previous set is restored when the
    /// returned guard drops.
    pub fn enter(&self, capabilities: CapabilitySet) -> EffectGuard<'_> {
        let previous = std::mem::replace(&mut *self.current.lock(), capabilities);
        EffectGuard {
            policy: self,
            previous: Some(previous),
        }
    }
}

/// Scope guard returned by [`EffectPolicy::enter`].
pub struct EffectGuard<'a> {
    policy: &'a EffectPolicy,
    previous: Option<CapabilitySet>,
}

impl Drop for EffectGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.policy.current.lock() = previous;
        }
    }
}

/// Evaluator collaborator: executes Core IR expressions on behalf of the
/// scheduler. The runtime never inspects the produced value's structure.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Runs an expression under the given frame snapshot.
    async fn run(&self, body: &Expr, snapshot: FrameSnapshot) -> RuntimeResult<Value>;
}

/// Adapts a Core IR expression plus an evaluator handle into a [`TaskBody`].
pub fn evaluator_body(evaluator: Arc<dyn Evaluator>, expr: Expr) -> TaskBody {
    Arc::new(move |snapshot| {
        let evaluator = Arc::clone(&evaluator);
        let expr = expr.clone();
        Box::pin(async move { evaluator.run(&expr, snapshot).await })
    })
}
