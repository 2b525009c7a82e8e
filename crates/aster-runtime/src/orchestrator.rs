//! Workflow orchestrator: registers a workflow's steps with the registry,
//! drives it to a terminal outcome, triggers compensation for outer
//! failures and always tears the workflow's state back down.

use crate::compensation::{compensation_fn, CompensationCallback};
use crate::error::{RuntimeError, RuntimeResult};
use crate::facade::{evaluator_body, CapabilitySet, EffectPolicy, Evaluator, FrameSnapshot, TaskBody};
use crate::graph::WorkflowId;
use crate::registry::{TaskRegistry, TaskSpec};
use crate::retry::RetryPolicy;
use aster_core::expr::validate_workflow_steps;
use aster_core::{CoreError, Expr, Value, WorkflowStepIr};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A user-named step of a workflow.
pub struct WorkflowStep {
    /// Step name, unique within the workflow.
    pub name: String,

    /// The step body.
    pub body: TaskBody,

    /// Names of sibling steps that must complete first.
    pub deps: Vec<String>,

    /// Optional rollback callback.
    pub compensation: Option<CompensationCallback>,

    /// Optional retry policy.
    pub retry: Option<RetryPolicy>,

    /// Optional per-step timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Scheduling priority; lower runs earlier.
    pub priority: i32,
}

impl WorkflowStep {
    /// Creates a step with no dependencies.
    pub fn new(name: impl Into<String>, body: TaskBody) -> Self {
        Self {
            name: name.into(),
            body,
            deps: Vec::new(),
            compensation: None,
            retry: None,
            timeout_ms: None,
            priority: 0,
        }
    }

    /// Adds a dependency on a sibling step.
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Sets the rollback callback.
    pub fn with_compensation(mut self, callback: CompensationCallback) -> Self {
        self.compensation = Some(callback);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the per-step timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A workflow: named steps plus dependency and compensation wiring,
/// executed as one unit.
pub struct WorkflowPlan {
    /// Workflow name, used for logging only.
    pub name: String,

    /// Steps in user-declared order; results are returned in this order.
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowPlan {
    /// Creates an empty plan.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Validates step wiring: names unique, dependencies known.
    pub fn validate(&self) -> RuntimeResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(RuntimeError::DuplicateStep(step.name.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.deps {
                if !seen.contains(dep.as_str()) {
                    return Err(RuntimeError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Builds a workflow plan from a Core IR `workflow` expression, binding
/// step and compensation bodies to the evaluator collaborator.
pub fn plan_from_ir(
    name: impl Into<String>,
    expr: &Expr,
    evaluator: Arc<dyn Evaluator>,
) -> RuntimeResult<WorkflowPlan> {
    let Expr::Workflow { steps } = expr else {
        return Err(RuntimeError::Module(CoreError::Parse(
            "expected a workflow expression".to_string(),
        )));
    };
    plan_from_ir_steps(name, steps, evaluator)
}

/// Builds a workflow plan from the step list of a `workflow` expression.
pub fn plan_from_ir_steps(
    name: impl Into<String>,
    steps: &[WorkflowStepIr],
    evaluator: Arc<dyn Evaluator>,
) -> RuntimeResult<WorkflowPlan> {
    validate_workflow_steps(steps).map_err(|err| match err {
        CoreError::DuplicateStep(step) => RuntimeError::DuplicateStep(step),
        CoreError::UnknownStep { step, dependency } => {
            RuntimeError::UnknownDependency { step, dependency }
        }
        other => RuntimeError::Module(other),
    })?;

    let mut plan = WorkflowPlan::new(name);
    for ir in steps {
        let mut step = WorkflowStep::new(
            &ir.name,
            evaluator_body(Arc::clone(&evaluator), ir.body.clone()),
        );
        for dep in &ir.deps {
            step = step.depends_on(dep);
        }
        if let Some(compensate) = &ir.compensate {
            let evaluator = Arc::clone(&evaluator);
            let expr = compensate.clone();
            let label = format!("{}/compensate", ir.name);
            step = step.with_compensation(compensation_fn(move || {
                let evaluator = Arc::clone(&evaluator);
                let expr = expr.clone();
                let label = label.clone();
                async move {
                    evaluator
                        .run(&expr, FrameSnapshot::detached(label))
                        .await
                        .map(|_| ())
                }
            }));
        }
        plan = plan.step(step);
    }
    Ok(plan)
}

/// Drives one workflow at a time against an owned task registry.
pub struct WorkflowOrchestrator {
    registry: TaskRegistry,
    effect_policy: Arc<EffectPolicy>,
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator over the given registry.
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            effect_policy: Arc::new(EffectPolicy::new()),
        }
    }

    /// Supplies the effect policy whose capability snapshot workflow bodies
    /// re-enter.
    pub fn with_effect_policy(mut self, policy: Arc<EffectPolicy>) -> Self {
        self.effect_policy = policy;
        self
    }

    /// The underlying registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Executes the workflow to completion. On success, step results are
    /// returned in user-declared order.
    pub async fn run(&self, plan: WorkflowPlan) -> RuntimeResult<Vec<Value>> {
        self.run_inner(plan, None).await
    }

    /// Executes the workflow under an outer deadline.
    pub async fn run_with_timeout(
        &self,
        plan: WorkflowPlan,
        timeout_ms: u64,
    ) -> RuntimeResult<Vec<Value>> {
        self.run_inner(plan, Some(timeout_ms)).await
    }

    async fn run_inner(
        &self,
        plan: WorkflowPlan,
        timeout_ms: Option<u64>,
    ) -> RuntimeResult<Vec<Value>> {
        plan.validate()?;

        let workflow_id: WorkflowId = Uuid::new_v4().to_string();
        let capabilities = self.effect_policy.snapshot();
        let step_names: Vec<String> = plan.steps.iter().map(|s| s.name.clone()).collect();
        info!(
            workflow = %plan.name,
            workflow_id = %workflow_id,
            steps = step_names.len(),
            "starting workflow"
        );

        for step in plan.steps {
            let body = scoped_body(
                Arc::clone(&self.effect_policy),
                capabilities.clone(),
                step.body,
            );
            let mut spec = TaskSpec::new(step.name, workflow_id.clone(), body)
                .with_deps(step.deps)
                .with_priority(step.priority)
                .with_capabilities(capabilities.clone());
            if let Some(ms) = step.timeout_ms {
                spec = spec.with_timeout_ms(ms);
            }
            if let Some(policy) = step.retry {
                spec = spec.with_retry(policy);
            }
            if let Some(callback) = step.compensation {
                spec = spec.with_compensation(callback);
            }
            if let Err(err) = self.registry.register(spec) {
                self.teardown(&step_names, &workflow_id);
                return Err(err);
            }
        }

        let run_result = match timeout_ms {
            None => self.registry.run_until_complete().await,
            Some(ms) => self.registry.run_with_timeout(ms).await,
        };

        let outcome = match run_result {
            Ok(()) => {
                let mut results = Vec::with_capacity(step_names.len());
                let mut missing = None;
                for name in &step_names {
                    match self.registry.result(name) {
                        Some(value) => results.push(value),
                        None => {
                            missing = Some(name.clone());
                            break;
                        }
                    }
                }
                match missing {
                    None => {
                        info!(workflow_id = %workflow_id, "workflow completed");
                        Ok(results)
                    }
                    Some(name) => Err(RuntimeError::Internal(format!(
                        "step {name} reported success without a stored result"
                    ))),
                }
            }
            Err(err) => {
                // The registry's standard failure path has already run
                // compensation; the outer timeout catch has not.
                if matches!(err, RuntimeError::WorkflowTimeout(_)) {
                    let compensated = self.registry.compensation().compensate(&workflow_id).await;
                    warn!(
                        workflow_id = %workflow_id,
                        compensated = compensated.len(),
                        "workflow timed out; compensation ran"
                    );
                }
                Err(err)
            }
        };

        self.teardown(&step_names, &workflow_id);
        outcome
    }

    fn teardown(&self, step_names: &[String], workflow_id: &str) {
        for name in step_names {
            self.registry.remove(name);
        }
        self.registry.compensation().clear(workflow_id);
    }
}

/// Wraps a body so each attempt re-enters the workflow's capability scope
/// before executing.
fn scoped_body(policy: Arc<EffectPolicy>, capabilities: CapabilitySet, inner: TaskBody) -> TaskBody {
    Arc::new(move |snapshot| {
        let policy = Arc::clone(&policy);
        let capabilities = capabilities.clone();
        let inner = Arc::clone(&inner);
        Box::pin(async move {
            let _scope = policy.enter(capabilities);
            inner(snapshot).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::facade::body_fn;
    use async_trait::async_trait;

    fn orchestrator() -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(TaskRegistry::new(
            RuntimeConfig::default()
                .with_thread_pool_size(1)
                .with_poll_interval_ms(5),
        ))
    }

    fn named_step(name: &str) -> WorkflowStep {
        let label = name.to_string();
        WorkflowStep::new(
            name,
            body_fn(move |_snapshot| {
                let label = label.clone();
                async move { Ok(Value::Str(label)) }
            }),
        )
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let plan = WorkflowPlan::new("wf")
            .step(named_step("a"))
            .step(named_step("a"));
        assert!(matches!(
            plan.validate(),
            Err(RuntimeError::DuplicateStep(name)) if name == "a"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let plan = WorkflowPlan::new("wf").step(named_step("a").depends_on("ghost"));
        assert!(matches!(
            plan.validate(),
            Err(RuntimeError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_results_in_declared_order() {
        let orchestrator = orchestrator();
        let plan = WorkflowPlan::new("wf")
            .step(named_step("first"))
            .step(named_step("second").depends_on("first"))
            .step(named_step("third").depends_on("second"));

        let results = orchestrator.run(plan).await.unwrap();
        let labels: Vec<_> = results.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
        orchestrator.registry().shutdown().await;
    }

    #[tokio::test]
    async fn test_teardown_removes_tasks() {
        let orchestrator = orchestrator();
        let plan = WorkflowPlan::new("wf").step(named_step("only"));

        orchestrator.run(plan).await.unwrap();
        assert!(orchestrator.registry().state("only").is_none());
        assert_eq!(orchestrator.registry().stats().total, 0);
        orchestrator.registry().shutdown().await;
    }

    #[tokio::test]
    async fn test_capabilities_reentered_by_bodies() {
        let policy = Arc::new(EffectPolicy::with_capabilities(CapabilitySet::of(["net"])));
        let registry = TaskRegistry::new(RuntimeConfig::default().with_thread_pool_size(1));
        let orchestrator = WorkflowOrchestrator::new(registry).with_effect_policy(policy);

        let step = WorkflowStep::new(
            "probe",
            body_fn(|snapshot| async move {
                Ok(Value::Bool(snapshot.capabilities.contains("net")))
            }),
        );
        let results = orchestrator.run(WorkflowPlan::new("wf").step(step)).await.unwrap();
        assert_eq!(results[0], Value::Bool(true));
        orchestrator.registry().shutdown().await;
    }

    #[tokio::test]
    async fn test_plan_from_ir_runs_through_evaluator() {
        struct LiteralEvaluator;

        #[async_trait]
        impl Evaluator for LiteralEvaluator {
            async fn run(&self, body: &Expr, _snapshot: FrameSnapshot) -> RuntimeResult<Value> {
                match body {
                    Expr::Str { value } => Ok(Value::Str(value.clone())),
                    Expr::Int { value } => Ok(Value::Int(*value)),
                    _ => Ok(Value::Unit),
                }
            }
        }

        let expr = Expr::Workflow {
            steps: vec![
                WorkflowStepIr::new(
                    "fetch",
                    Expr::Str {
                        value: "payload".to_string(),
                    },
                ),
                WorkflowStepIr::new("count", Expr::Int { value: 3 }).depends_on("fetch"),
            ],
        };

        let plan = plan_from_ir("ir-wf", &expr, Arc::new(LiteralEvaluator)).unwrap();
        let orchestrator = orchestrator();
        let results = orchestrator.run(plan).await.unwrap();
        assert_eq!(results[0].as_str(), Some("payload"));
        assert_eq!(results[1].as_int(), Some(3));
        orchestrator.registry().shutdown().await;
    }

    #[test]
    fn test_plan_from_ir_rejects_duplicate_steps() {
        struct NullEvaluator;

        #[async_trait]
        impl Evaluator for NullEvaluator {
            async fn run(&self, _body: &Expr, _snapshot: FrameSnapshot) -> RuntimeResult<Value> {
                Ok(Value::Unit)
            }
        }

        let expr = Expr::Workflow {
            steps: vec![
                WorkflowStepIr::new("a", Expr::Int { value: 1 }),
                WorkflowStepIr::new("a", Expr::Int { value: 2 }),
            ],
        };
        assert!(matches!(
            plan_from_ir("wf", &expr, Arc::new(NullEvaluator)),
            Err(RuntimeError::DuplicateStep(name)) if name == "a"
        ));
    }
}
