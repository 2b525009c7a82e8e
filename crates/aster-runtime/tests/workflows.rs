//! End-to-end workflow scenarios across the registry, retry engine,
//! compensation stack and orchestrator.

use aster_core::Value;
use aster_events::{EventStore, EventType, InMemoryEventStore};
use aster_runtime::clock::{DeterministicRandom, RecordedValues, RecordingClock, ReplayClock};
use aster_runtime::compensation::compensation_fn;
use aster_runtime::config::RuntimeConfig;
use aster_runtime::error::RuntimeError;
use aster_runtime::facade::body_fn;
use aster_runtime::orchestrator::{WorkflowOrchestrator, WorkflowPlan, WorkflowStep};
use aster_runtime::registry::{TaskRegistry, TaskSpec, TaskStateKind};
use aster_runtime::retry::RetryPolicy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn serial_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_thread_pool_size(1)
        .with_poll_interval_ms(5)
        .with_grace_period_ms(500)
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

#[tokio::test]
async fn diamond_success_returns_results_in_declared_order() {
    let store = Arc::new(InMemoryEventStore::new());
    let registry = TaskRegistry::builder(serial_config())
        .with_event_store(store.clone())
        .build();
    let orchestrator = WorkflowOrchestrator::new(registry);

    let plan = WorkflowPlan::new("diamond")
        .step(named_step("root"))
        .step(named_step("fan-a").depends_on("root"))
        .step(named_step("fan-b").depends_on("root"))
        .step(named_step("join").depends_on("fan-a").depends_on("fan-b"));

    let results = orchestrator.run(plan).await.unwrap();
    let labels: Vec<_> = results.iter().filter_map(|v| v.as_str()).collect();
    assert_eq!(labels, vec!["root", "fan-a", "fan-b", "join"]);

    // A clean run appends nothing.
    assert!(store.list_workflows().await.unwrap().is_empty());
    orchestrator.registry().shutdown().await;
}

#[tokio::test]
async fn mid_graph_failure_compensates_in_reverse_completion_order() {
    let registry = TaskRegistry::new(serial_config());
    let orchestrator = WorkflowOrchestrator::new(registry);
    let compensated = Arc::new(Mutex::new(Vec::new()));

    let step_with_compensation = |name: &str| {
        let log = compensated.clone();
        let label = name.to_string();
        named_step(name).with_compensation(compensation_fn(move || {
            let log = log.clone();
            let label = label.clone();
            async move {
                log.lock().push(label);
                Ok(())
            }
        }))
    };

    let failing_terminal = {
        let log = compensated.clone();
        WorkflowStep::new(
            "terminal",
            body_fn(|snapshot| async move {
                Err(RuntimeError::TaskExecutionFailed {
                    task_id: snapshot.task_id,
                    reason: "IllegalState".to_string(),
                })
            }),
        )
        .depends_on("diamond")
        .with_compensation(compensation_fn(move || {
            let log = log.clone();
            async move {
                log.lock().push("terminal".to_string());
                Ok(())
            }
        }))
    };

    let plan = WorkflowPlan::new("saga")
        .step(step_with_compensation("start"))
        .step(step_with_compensation("fan-left").depends_on("start"))
        .step(step_with_compensation("fan-right").depends_on("start"))
        .step(
            step_with_compensation("diamond")
                .depends_on("fan-left")
                .depends_on("fan-right"),
        )
        .step(failing_terminal);

    let err = orchestrator.run(plan).await.unwrap_err();
    assert!(matches!(
        &err,
        RuntimeError::TaskFailure { task_id, .. } if task_id == "terminal"
    ));

    // Strict LIFO of successful completions; the failed step never
    // completed, so its callback must not run.
    assert_eq!(
        *compensated.lock(),
        vec!["diamond", "fan-right", "fan-left", "start"]
    );
    orchestrator.registry().shutdown().await;
}

#[tokio::test]
async fn retry_then_succeed_records_retry_events() {
    let store = Arc::new(InMemoryEventStore::new());
    let registry = TaskRegistry::builder(serial_config())
        .with_event_store(store.clone())
        .build();
    let orchestrator = WorkflowOrchestrator::new(registry);

    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = {
        let attempts = attempts.clone();
        WorkflowStep::new(
            "flaky",
            body_fn(move |snapshot| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        Err(RuntimeError::TaskExecutionFailed {
                            task_id: snapshot.task_id,
                            reason: format!("transient failure {n}"),
                        })
                    } else {
                        Ok(Value::from("ok"))
                    }
                }
            }),
        )
        .with_retry(RetryPolicy::linear(3, 10))
    };

    let results = orchestrator
        .run(WorkflowPlan::new("flaky-wf").step(flaky))
        .await
        .unwrap();
    assert_eq!(results[0].as_str(), Some("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let workflows = store.list_workflows().await.unwrap();
    assert_eq!(workflows.len(), 1);
    let events = store.events(&workflows[0], 1).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.event_type, EventType::RetryScheduled);
        assert_eq!(event.task_id(), Some("flaky"));
    }
    assert_eq!(events[0].attempt_number, Some(2));
    assert!(events[0].backoff_delay_ms.unwrap() >= 10);
    assert_eq!(events[1].attempt_number, Some(3));
    assert!(events[1].backoff_delay_ms.unwrap() >= 20);

    orchestrator.registry().shutdown().await;
}

#[tokio::test]
async fn timeout_cascades_cancellation_downstream() {
    let registry = TaskRegistry::new(
        RuntimeConfig::default()
            .with_thread_pool_size(2)
            .with_poll_interval_ms(5)
            .with_grace_period_ms(500),
    );

    registry
        .register(TaskSpec::new(
            "root",
            "wf-timeout",
            body_fn(|_snapshot| async { Ok(Value::Unit) }),
        ))
        .unwrap();
    registry
        .register(
            TaskSpec::new(
                "slow-mid",
                "wf-timeout",
                body_fn(|_snapshot| async {
                    sleep(Duration::from_millis(80)).await;
                    Ok(Value::Unit)
                }),
            )
            .depends_on("root")
            .with_timeout_ms(25),
        )
        .unwrap();

    let leaf_ran = Arc::new(AtomicBool::new(false));
    {
        let leaf_ran = leaf_ran.clone();
        registry
            .register(
                TaskSpec::new(
                    "leaf",
                    "wf-timeout",
                    body_fn(move |_snapshot| {
                        let leaf_ran = leaf_ran.clone();
                        async move {
                            leaf_ran.store(true, Ordering::SeqCst);
                            Ok(Value::Unit)
                        }
                    }),
                )
                .depends_on("slow-mid"),
            )
            .unwrap();
    }

    let err = registry.run_until_complete().await.unwrap_err();
    assert!(matches!(&err, RuntimeError::Timeout(id) if id == "slow-mid"));

    assert_eq!(registry.state("root"), Some(TaskStateKind::Completed));
    assert_eq!(registry.state("slow-mid"), Some(TaskStateKind::Failed));
    assert_eq!(registry.state("leaf"), Some(TaskStateKind::Cancelled));
    assert!(!leaf_ran.load(Ordering::SeqCst));

    registry.shutdown().await;
}

#[tokio::test]
async fn timeout_counts_as_a_retry_attempt() {
    let store = Arc::new(InMemoryEventStore::new());
    let registry = TaskRegistry::builder(serial_config())
        .with_event_store(store.clone())
        .build();

    registry
        .register(
            TaskSpec::new(
                "sluggish",
                "wf-slow",
                body_fn(|_snapshot| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok(Value::Unit)
                }),
            )
            .with_timeout_ms(20)
            .with_retry(RetryPolicy::linear(2, 5)),
        )
        .unwrap();

    let err = registry.run_until_complete().await.unwrap_err();
    assert!(matches!(
        &err,
        RuntimeError::MaxRetriesExceeded { task_id, max_attempts: 2, source }
            if task_id == "sluggish" && matches!(source.as_ref(), RuntimeError::Timeout(_))
    ));

    let events = store.events("wf-slow", 1).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempt_number, Some(2));

    registry.shutdown().await;
}

#[tokio::test]
async fn single_attempt_policy_fails_terminally() {
    let store = Arc::new(InMemoryEventStore::new());
    let registry = TaskRegistry::builder(serial_config())
        .with_event_store(store.clone())
        .build();

    registry
        .register(
            TaskSpec::new(
                "one-shot",
                "wf-one",
                body_fn(|snapshot| async move {
                    Err(RuntimeError::TaskExecutionFailed {
                        task_id: snapshot.task_id,
                        reason: "boom".to_string(),
                    })
                }),
            )
            .with_retry(RetryPolicy::linear(1, 10)),
        )
        .unwrap();

    let err = registry.run_until_complete().await.unwrap_err();
    assert!(matches!(
        &err,
        RuntimeError::MaxRetriesExceeded { max_attempts: 1, .. }
    ));
    assert!(store.events("wf-one", 1).await.unwrap().is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn workflow_timeout_runs_compensation() {
    let registry = TaskRegistry::new(serial_config());
    let orchestrator = WorkflowOrchestrator::new(registry);
    let compensated = Arc::new(Mutex::new(Vec::new()));

    let done = {
        let log = compensated.clone();
        named_step("done").with_compensation(compensation_fn(move || {
            let log = log.clone();
            async move {
                log.lock().push("done".to_string());
                Ok(())
            }
        }))
    };
    let stall = WorkflowStep::new(
        "stall",
        body_fn(|_snapshot| async {
            sleep(Duration::from_secs(30)).await;
            Ok(Value::Unit)
        }),
    )
    .depends_on("done");

    let err = orchestrator
        .run_with_timeout(WorkflowPlan::new("stuck").step(done).step(stall), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::WorkflowTimeout(100)));
    assert_eq!(*compensated.lock(), vec!["done"]);

    orchestrator.registry().shutdown().await;
}

#[tokio::test]
async fn compensation_is_scoped_to_the_failing_workflow() {
    let registry = TaskRegistry::new(serial_config());
    let compensated = Arc::new(Mutex::new(Vec::new()));

    let with_tracking = |workflow: &str, id: &str| {
        let log = compensated.clone();
        let label = id.to_string();
        TaskSpec::new(
            id,
            workflow,
            body_fn(|_snapshot| async { Ok(Value::Unit) }),
        )
        .with_compensation(compensation_fn(move || {
            let log = log.clone();
            let label = label.clone();
            async move {
                log.lock().push(label);
                Ok(())
            }
        }))
    };

    registry.register(with_tracking("wf-a", "a-ok")).unwrap();
    registry.register(with_tracking("wf-b", "b-ok")).unwrap();
    registry
        .register(
            TaskSpec::new(
                "b-fail",
                "wf-b",
                body_fn(|snapshot| async move {
                    Err(RuntimeError::TaskExecutionFailed {
                        task_id: snapshot.task_id,
                        reason: "boom".to_string(),
                    })
                }),
            )
            .depends_on("b-ok"),
        )
        .unwrap();

    let err = registry.run_until_complete().await.unwrap_err();
    assert!(matches!(
        &err,
        RuntimeError::TaskFailure { task_id, .. } if task_id == "b-fail"
    ));

    // Only the failing workflow's stack drains.
    assert_eq!(*compensated.lock(), vec!["b-ok"]);
    assert_eq!(registry.compensation().depth("wf-a"), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn concurrent_pool_still_honours_dependency_edges() {
    let registry = TaskRegistry::new(
        RuntimeConfig::default()
            .with_thread_pool_size(4)
            .with_poll_interval_ms(5),
    );

    let fan_a_done = Arc::new(AtomicBool::new(false));
    let fan_b_done = Arc::new(AtomicBool::new(false));

    registry
        .register(TaskSpec::new(
            "root",
            "wf-par",
            body_fn(|_snapshot| async { Ok(Value::Unit) }),
        ))
        .unwrap();
    for (id, flag) in [("fan-a", fan_a_done.clone()), ("fan-b", fan_b_done.clone())] {
        registry
            .register(
                TaskSpec::new(
                    id,
                    "wf-par",
                    body_fn(move |_snapshot| {
                        let flag = flag.clone();
                        async move {
                            sleep(Duration::from_millis(10)).await;
                            flag.store(true, Ordering::SeqCst);
                            Ok(Value::Unit)
                        }
                    }),
                )
                .depends_on("root"),
            )
            .unwrap();
    }
    {
        let fan_a_done = fan_a_done.clone();
        let fan_b_done = fan_b_done.clone();
        registry
            .register(
                TaskSpec::new(
                    "join",
                    "wf-par",
                    body_fn(move |_snapshot| {
                        let fan_a_done = fan_a_done.clone();
                        let fan_b_done = fan_b_done.clone();
                        async move {
                            // Both fan-out branches were terminal before this
                            // body began.
                            assert!(fan_a_done.load(Ordering::SeqCst));
                            assert!(fan_b_done.load(Ordering::SeqCst));
                            Ok(Value::Unit)
                        }
                    }),
                )
                .depends_on("fan-a")
                .depends_on("fan-b"),
            )
            .unwrap();
    }

    registry.run_until_complete().await.unwrap();
    assert_eq!(registry.state("join"), Some(TaskStateKind::Completed));
    registry.shutdown().await;
}

#[tokio::test]
async fn empty_dependency_set_runs_immediately() {
    let registry = TaskRegistry::new(serial_config());
    registry
        .register(TaskSpec::new(
            "free",
            "wf",
            body_fn(|_snapshot| async { Ok(Value::from("done")) }),
        ))
        .unwrap();
    registry.run_until_complete().await.unwrap();
    assert_eq!(registry.state("free"), Some(TaskStateKind::Completed));
    registry.shutdown().await;
}

fn flaky_body(attempts: Arc<AtomicU32>) -> aster_runtime::facade::TaskBody {
    body_fn(move |snapshot| {
        let attempts = attempts.clone();
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 2 {
                Err(RuntimeError::TaskExecutionFailed {
                    task_id: snapshot.task_id,
                    reason: format!("transient failure {n}"),
                })
            } else {
                Ok(Value::from("ok"))
            }
        }
    })
}

#[tokio::test]
async fn replay_reproduces_recorded_run() {
    const WORKFLOW: &str = "wf-replay";

    // Record run: real clock and a seeded RNG, both logged.
    let record_log = Arc::new(RecordedValues::new());
    let record_store = Arc::new(InMemoryEventStore::new());
    let record_registry = TaskRegistry::builder(serial_config())
        .with_event_store(record_store.clone())
        .with_clock(Arc::new(RecordingClock::new(record_log.clone())))
        .with_random(Arc::new(DeterministicRandom::recording(42, record_log.clone())))
        .build();

    record_registry
        .register(
            TaskSpec::new("flaky", WORKFLOW, flaky_body(Arc::new(AtomicU32::new(0))))
                .with_retry(RetryPolicy::linear(3, 10)),
        )
        .unwrap();
    record_registry.run_until_complete().await.unwrap();

    let recorded_value = record_registry.result("flaky").unwrap();
    let captured_events = record_store.stream_snapshot(WORKFLOW);
    let captured_recording = record_log.snapshot();
    assert_eq!(captured_events.len(), 2);
    record_registry.shutdown().await;

    // Replay run: same program, backoffs and values from the captured log.
    let replay_log = Arc::new(RecordedValues::from_snapshot(captured_recording));
    let replay_store = Arc::new(InMemoryEventStore::new());
    replay_store.load_stream(WORKFLOW, captured_events.clone());

    let replay_registry = TaskRegistry::builder(serial_config().with_replay(true))
        .with_event_store(replay_store.clone())
        .with_clock(Arc::new(ReplayClock::new(replay_log.clone())))
        .with_random(Arc::new(DeterministicRandom::replaying(replay_log)))
        .build();

    replay_registry
        .register(
            TaskSpec::new("flaky", WORKFLOW, flaky_body(Arc::new(AtomicU32::new(0))))
                .with_retry(RetryPolicy::linear(3, 10)),
        )
        .unwrap();
    replay_registry.run_until_complete().await.unwrap();

    // Identical terminal value, identical event sequence, no new appends.
    assert_eq!(replay_registry.result("flaky").unwrap(), recorded_value);
    let replay_events = replay_store.stream_snapshot(WORKFLOW);
    assert_eq!(replay_events, captured_events);

    replay_registry.shutdown().await;
}

#[tokio::test]
async fn replay_divergence_fails_loudly() {
    // Replay with an empty event log: the first retry lookup must fail.
    let replay_store = Arc::new(InMemoryEventStore::new());
    let registry = TaskRegistry::builder(serial_config().with_replay(true))
        .with_event_store(replay_store)
        .build();

    registry
        .register(
            TaskSpec::new("flaky", "wf-empty", flaky_body(Arc::new(AtomicU32::new(0))))
                .with_retry(RetryPolicy::linear(3, 10)),
        )
        .unwrap();

    let err = registry.run_until_complete().await.unwrap_err();
    assert!(matches!(
        &err,
        RuntimeError::TaskFailure { source, .. }
            if matches!(source.as_ref(), RuntimeError::ReplayDivergence(_))
    ));

    registry.shutdown().await;
}
