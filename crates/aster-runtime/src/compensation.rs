//! Per-workflow compensation stacks (Saga rollback).
//!
//! Every successful completion that carries a rollback callback pushes onto
//! its workflow's LIFO stack. On workflow failure the stack belonging to
//! that workflow id is drained, invoking callbacks in pop order. Stacks are
//! removed when a workflow terminates.

use crate::error::RuntimeResult;
use crate::graph::{TaskId, WorkflowId};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A rollback callback, invoked at most once, on workflow failure.
pub type CompensationCallback = Arc<dyn Fn() -> BoxFuture<'static, RuntimeResult<()>> + Send + Sync>;

/// Wraps an async closure as a [`CompensationCallback`].
pub fn compensation_fn<F, Fut>(f: F) -> CompensationCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Per-workflow LIFO stacks of `(task_id, callback)` pairs.
#[derive(Default)]
pub struct CompensationStack {
    stacks: DashMap<WorkflowId, Vec<(TaskId, CompensationCallback)>>,
}

impl CompensationStack {
    /// Creates an empty stack set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a completed task's rollback callback onto its workflow stack.
    pub fn push(&self, workflow_id: &str, task_id: &str, callback: CompensationCallback) {
        debug!(workflow_id, task_id, "pushed compensation callback");
        self.stacks
            .entry(workflow_id.to_string())
            .or_default()
            .push((task_id.to_string(), callback));
    }

    /// Drains the stack belonging to the workflow id, invoking callbacks in
    /// reverse completion order. A failing callback is logged and does not
    /// stop the remaining callbacks. Returns the task ids compensated, in
    /// execution order. Draining removes the stack, so callbacks run at most
    /// once per workflow.
    pub async fn compensate(&self, workflow_id: &str) -> Vec<TaskId> {
        let Some((_, mut stack)) = self.stacks.remove(workflow_id) else {
            return Vec::new();
        };

        let mut executed = Vec::with_capacity(stack.len());
        while let Some((task_id, callback)) = stack.pop() {
            debug!(workflow_id, task_id = %task_id, "running compensation callback");
            if let Err(err) = callback().await {
                warn!(
                    workflow_id,
                    task_id = %task_id,
                    error = %err,
                    "compensation callback failed; continuing"
                );
            }
            executed.push(task_id);
        }
        executed
    }

    /// Removes the workflow's stack without running callbacks (workflow
    /// success or teardown).
    pub fn clear(&self, workflow_id: &str) {
        self.stacks.remove(workflow_id);
    }

    /// Number of callbacks currently stacked for a workflow.
    pub fn depth(&self, workflow_id: &str) -> usize {
        self.stacks
            .get(workflow_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
