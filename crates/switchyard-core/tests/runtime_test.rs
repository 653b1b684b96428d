// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step runtime integration tests against in-memory SQLite.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use switchyard_core::persistence::ListRunsFilter;
use switchyard_core::workflow::{STEP_PANICKED_CODE, STEP_TIMEOUT_CODE};
use switchyard_core::{
    AdvanceOutcome, CoreError, ExecutionMode, FailureHook, RetryPolicy, RetrySweeper,
    RetrySweeperConfig, RunFailure, RunStatus, StepContext, StepDescriptor, StepError,
    StepOutcome, StepRuntime, StepRuntimeConfig, StepStatus, Workflow, WorkflowCatalog, step_fn,
};

use common::{Counter, counting_step, immediate_retry, runtime_with, wait_for_status};

fn catalog_of(workflow: Workflow) -> WorkflowCatalog {
    let mut catalog = WorkflowCatalog::new();
    catalog.register(workflow).unwrap();
    catalog
}

/// Fails with a transient error until the step has been executed `failures` times.
fn flaky_step(counter: Counter, failures: u32) -> impl switchyard_core::StepHandler {
    step_fn(move |ctx: StepContext| {
        let counter = counter.clone();
        async move {
            if counter.bump() <= failures {
                Err(StepError::transient("UPSTREAM_503", "upstream unavailable"))
            } else {
                Ok(StepOutcome::Complete(json!({ "valid": true, "input": ctx.input })))
            }
        }
    })
}

#[tokio::test]
async fn test_failed_step_resumes_without_repeating_earlier_steps() {
    common::init_tracing();
    let first = Counter::new();
    let second = Counter::new();
    let workflow = Workflow::builder("resumable")
        .default_retry(immediate_retry(3))
        .step(StepDescriptor::new("charge", counting_step(first.clone(), json!({"charged": true}))))
        .step(StepDescriptor::new("receipt", flaky_step(second.clone(), 1)))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;

    let run = runtime.create_run("resumable", json!({"amount": 10}), None).await.unwrap();
    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(
        outcome,
        AdvanceOutcome::RetryScheduled { ref step_id, attempt: 2, .. } if step_id == "receipt"
    ));

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Completed { .. }));
    assert_eq!(first.get(), 1, "side effect of the first step must fire once");
    assert_eq!(second.get(), 2);

    let run = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step_results["charge"].attempt, 1);
    assert_eq!(run.step_results["receipt"].attempt, 2);
    assert!(run.next_retry_at.is_none());
}

#[tokio::test]
async fn test_validate_persist_notify_with_three_attempts() {
    let validate = Counter::new();
    let persist = Counter::new();
    let notify = Counter::new();
    let workflow = Workflow::builder("expense")
        .step(
            StepDescriptor::new("validate", flaky_step(validate.clone(), 2))
                .with_retry(immediate_retry(3)),
        )
        .step(StepDescriptor::new("persist", counting_step(persist.clone(), json!({"id": 7}))))
        .step(StepDescriptor::new("notify", counting_step(notify.clone(), json!({"sent": true}))))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;

    let run = runtime.create_run("expense", json!({"amount": 150}), None).await.unwrap();
    let mut outcome = runtime.advance(run.run_id).await.unwrap();
    let mut advances = 1;
    while matches!(outcome, AdvanceOutcome::RetryScheduled { .. }) {
        outcome = runtime.advance(run.run_id).await.unwrap();
        advances += 1;
    }

    assert_eq!(advances, 3);
    assert_eq!(outcome, AdvanceOutcome::Completed { output: json!({"sent": true}) });
    let run = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step_results["validate"].attempt, 3);
    assert_eq!(validate.get(), 3);
    assert_eq!(persist.get(), 1);
    assert_eq!(notify.get(), 1);
    assert_eq!(run.output, Some(json!({"sent": true})));
}

#[tokio::test]
async fn test_redelivery_of_finished_run_is_rejected_without_side_effects() {
    let counter = Counter::new();
    let workflow = Workflow::builder("once")
        .step(StepDescriptor::new("only", counting_step(counter.clone(), json!(1))))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;

    let run = runtime.create_run("once", json!({}), None).await.unwrap();
    runtime.advance(run.run_id).await.unwrap();
    let err = runtime.advance(run.run_id).await.unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { .. }));
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_concurrent_advances_execute_each_step_once() {
    let counter = Counter::new();
    let slow = {
        let counter = counter.clone();
        step_fn(move |_ctx: StepContext| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.bump();
                Ok(StepOutcome::Complete(json!("done")))
            }
        })
    };
    let workflow = Workflow::builder("slow")
        .step(StepDescriptor::new("work", slow))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("slow", json!({}), None).await.unwrap();

    let (a, b) = tokio::join!(runtime.advance(run.run_id), runtime.advance(run.run_id));
    let completed = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Ok(AdvanceOutcome::Completed { .. })))
        .count();
    let terminal = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(CoreError::RunTerminal { .. })))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(terminal, 1);
    assert_eq!(counter.get(), 1);
}

fn approval_workflow(applied: Counter) -> Workflow {
    let request = step_fn(|ctx: StepContext| async move {
        match ctx.resume {
            None => Ok(StepOutcome::Suspend(json!({"question": "approve?", "amount": ctx.input["amount"]}))),
            Some(_) => Ok(StepOutcome::Complete(json!({
                "approved": ctx.input["approved"],
                "amount": ctx.input["amount"],
            }))),
        }
    });
    Workflow::builder("approval")
        .step(StepDescriptor::new("request", request).with_resume_schema(json!({
            "type": "object",
            "required": ["approved"],
            "properties": {
                "approved": {"type": "boolean"},
                "approver": {"type": "string"}
            }
        })))
        .step(StepDescriptor::new("apply", {
            step_fn(move |ctx: StepContext| {
                let applied = applied.clone();
                async move {
                    applied.bump();
                    Ok(StepOutcome::Complete(ctx.input))
                }
            })
        }))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let applied = Counter::new();
    let runtime = runtime_with(
        catalog_of(approval_workflow(applied.clone())),
        StepRuntimeConfig::default(),
    )
    .await;
    let run = runtime.create_run("approval", json!({"amount": 42}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Suspended {
            step_id: "request".to_string(),
            payload: json!({"question": "approve?", "amount": 42}),
        }
    );
    let suspended = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(suspended.status, RunStatus::Suspended);
    assert_eq!(suspended.suspended_step_id.as_deref(), Some("request"));
    assert_eq!(suspended.step_results["request"].status, StepStatus::Suspended);

    // Advancing a suspended run is refused
    let err = runtime.advance(run.run_id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidRunState { .. }));

    let outcome = runtime
        .resume(run.run_id, Some("request"), json!({"approved": true, "approver": "ops"}))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Completed {
            output: json!({"approved": true, "amount": 42})
        }
    );
    assert_eq!(applied.get(), 1);

    let run = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.suspended_step_id.is_none());
}

#[tokio::test]
async fn test_resume_mismatch_leaves_run_suspended() {
    let applied = Counter::new();
    let runtime = runtime_with(
        catalog_of(approval_workflow(applied.clone())),
        StepRuntimeConfig::default(),
    )
    .await;
    let run = runtime.create_run("approval", json!({"amount": 5}), None).await.unwrap();
    runtime.advance(run.run_id).await.unwrap();

    let wrong_step = runtime
        .resume(run.run_id, Some("apply"), json!({"approved": true}))
        .await
        .unwrap_err();
    assert!(matches!(wrong_step, CoreError::ResumeMismatch { .. }));

    let bad_shape = runtime
        .resume(run.run_id, None, json!({"approved": "yes"}))
        .await
        .unwrap_err();
    match bad_shape {
        CoreError::ResumeMismatch { step_id, reason, .. } => {
            assert_eq!(step_id, "request");
            assert!(reason.contains("approved"), "reason was: {reason}");
        }
        other => panic!("expected ResumeMismatch, got {other:?}"),
    }

    let run = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Suspended);
    assert_eq!(applied.get(), 0);
}

#[tokio::test]
async fn test_resume_of_running_run_is_invalid_state() {
    let runtime = runtime_with(
        catalog_of(approval_workflow(Counter::new())),
        StepRuntimeConfig::default(),
    )
    .await;
    let run = runtime.create_run("approval", json!({}), None).await.unwrap();
    let err = runtime
        .resume(run.run_id, None, json!({"approved": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRunState { .. }));
}

#[tokio::test]
async fn test_canceled_run_fails_fast() {
    let runtime = runtime_with(
        catalog_of(approval_workflow(Counter::new())),
        StepRuntimeConfig::default(),
    )
    .await;
    let run = runtime.create_run("approval", json!({}), None).await.unwrap();
    runtime.advance(run.run_id).await.unwrap();

    let canceled = runtime.cancel(run.run_id, Some("operator request")).await.unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);
    assert_eq!(canceled.error.as_deref(), Some("operator request"));

    let err = runtime.advance(run.run_id).await.unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { ref status, .. } if status == "canceled"));
    let err = runtime
        .resume(run.run_id, Some("request"), json!({"approved": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { .. }));
    let err = runtime.cancel(run.run_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { .. }));
}

#[tokio::test]
async fn test_cancel_observed_between_steps() {
    let later = Counter::new();
    let runtime_slot: Arc<tokio::sync::OnceCell<Arc<switchyard_core::StepRuntime>>> =
        Arc::new(tokio::sync::OnceCell::new());
    let slot = runtime_slot.clone();
    let cancel_self = step_fn(move |ctx: StepContext| {
        let slot = slot.clone();
        async move {
            if let Some(runtime) = slot.get() {
                runtime.cancel(ctx.run_id, Some("stop")).await.unwrap();
            }
            Ok(StepOutcome::Complete(json!(null)))
        }
    });
    let workflow = Workflow::builder("cancelable")
        .step(StepDescriptor::new("first", cancel_self))
        .step(StepDescriptor::new("second", counting_step(later.clone(), json!(2))))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    runtime_slot.set(runtime.clone()).ok();

    let run = runtime.create_run("cancelable", json!({}), None).await.unwrap();
    let err = runtime.advance(run.run_id).await.unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { .. }));
    assert_eq!(later.get(), 0);
    assert_eq!(
        runtime.get_run(run.run_id).await.unwrap().status,
        RunStatus::Canceled
    );
}

#[tokio::test]
async fn test_step_timeout_is_retriable() {
    let slow_first = step_fn(|ctx: StepContext| async move {
        if ctx.attempt == 1 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(StepOutcome::Complete(json!({"attempt": ctx.attempt})))
    });
    let workflow = Workflow::builder("slow")
        .step(
            StepDescriptor::new("fetch", slow_first)
                .with_timeout(Duration::from_millis(20))
                .with_retry(immediate_retry(2)),
        )
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("slow", json!({}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::RetryScheduled { attempt: 2, .. }));
    let pending = runtime.get_run(run.run_id).await.unwrap();
    let fetch = &pending.step_results["fetch"];
    assert_eq!(fetch.status, StepStatus::Pending);
    assert!(fetch.error.as_deref().unwrap().contains(STEP_TIMEOUT_CODE));

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Completed { output: json!({"attempt": 2}) });
}

#[tokio::test]
async fn test_interrupted_advance_is_picked_up_after_lease_lapses() {
    common::init_tracing();
    let first = Counter::new();
    let second = Counter::new();
    let started = Arc::new(tokio::sync::Notify::new());
    let hang_once = {
        let second = second.clone();
        let started = started.clone();
        step_fn(move |_ctx: StepContext| {
            let second = second.clone();
            let started = started.clone();
            async move {
                if second.bump() == 1 {
                    started.notify_one();
                    std::future::pending::<()>().await;
                }
                Ok(StepOutcome::Complete(json!({"b": 2})))
            }
        })
    };
    let workflow = Workflow::builder("interrupted")
        .step(StepDescriptor::new("a", counting_step(first.clone(), json!({"a": 1}))))
        .step(StepDescriptor::new("b", hang_once))
        .build()
        .unwrap();
    let catalog = Arc::new(catalog_of(workflow));
    let config = StepRuntimeConfig {
        step_timeout: Duration::from_millis(500),
        lease_grace: Duration::ZERO,
        ..StepRuntimeConfig::default()
    };
    let store = common::memory_store().await;
    let runtime = Arc::new(StepRuntime::new(store.clone(), catalog.clone(), config.clone()));
    let run = runtime.create_run("interrupted", json!({}), None).await.unwrap();

    // The process dies while step "b" is executing
    let in_flight = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.advance(run.run_id).await }
    });
    started.notified().await;
    in_flight.abort();
    assert!(in_flight.await.unwrap_err().is_cancelled());
    drop(runtime);

    let stalled = store.get_run(&run.run_id.to_string()).await.unwrap().unwrap();
    assert_eq!(stalled.status, "running");
    assert!(stalled.next_retry_at.is_some());

    let restarted = Arc::new(StepRuntime::new(store, catalog, config));
    let sweeper = RetrySweeper::new(restarted.clone(), RetrySweeperConfig::default());
    assert!(sweeper.sweep().await.unwrap().is_empty(), "lease still held");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sweeper.sweep().await.unwrap(), vec![run.run_id]);
    wait_for_status(&restarted, run.run_id, RunStatus::Success).await;

    let run = restarted.get_run(run.run_id).await.unwrap();
    assert_eq!(first.get(), 1, "finished step must not run again");
    assert_eq!(second.get(), 2);
    assert_eq!(run.step_results["b"].attempt, 1);
    assert_eq!(run.output, Some(json!({"b": 2})));
    assert!(run.next_retry_at.is_none());
}

#[tokio::test]
async fn test_run_never_advanced_becomes_due() {
    let counter = Counter::new();
    let workflow = Workflow::builder("orphan")
        .step(StepDescriptor::new("only", counting_step(counter.clone(), json!("done"))))
        .build()
        .unwrap();
    let config = StepRuntimeConfig {
        step_timeout: Duration::from_millis(50),
        lease_grace: Duration::ZERO,
        ..StepRuntimeConfig::default()
    };
    let runtime = runtime_with(catalog_of(workflow), config).await;
    // Created, but the delivery that would advance it is lost
    let run = runtime.create_run("orphan", json!({}), None).await.unwrap();
    assert!(run.next_retry_at.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let sweeper = RetrySweeper::new(runtime.clone(), RetrySweeperConfig::default());
    assert_eq!(sweeper.sweep().await.unwrap(), vec![run.run_id]);
    wait_for_status(&runtime, run.run_id, RunStatus::Success).await;
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_panicking_step_is_retried() {
    let calls = Counter::new();
    let panics_once = {
        let calls = calls.clone();
        step_fn(move |_ctx: StepContext| {
            let calls = calls.clone();
            async move {
                if calls.bump() == 1 {
                    panic!("ledger index out of range");
                }
                Ok(StepOutcome::Complete(json!({"ok": true})))
            }
        })
    };
    let workflow = Workflow::builder("fragile")
        .default_retry(immediate_retry(2))
        .step(StepDescriptor::new("index", panics_once))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("fragile", json!({}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(
        outcome,
        AdvanceOutcome::RetryScheduled { ref step_id, attempt: 2, .. } if step_id == "index"
    ));
    let pending = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(pending.status, RunStatus::Running);
    let index = &pending.step_results["index"];
    assert_eq!(index.status, StepStatus::Pending);
    assert!(index.error.as_deref().unwrap().contains(STEP_PANICKED_CODE));

    // The run lock was released, so the next advance goes through
    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Completed { output: json!({"ok": true}) });
    assert_eq!(calls.get(), 2);
}

struct RecordingHook {
    calls: Arc<AtomicU32>,
    last_step: Arc<tokio::sync::Mutex<Option<String>>>,
}

#[async_trait]
impl FailureHook for RecordingHook {
    async fn on_failure(&self, failure: &RunFailure) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_step.lock().await = Some(failure.step_id.clone());
    }
}

#[tokio::test]
async fn test_permanent_failure_fails_run_and_calls_hook_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let last_step = Arc::new(tokio::sync::Mutex::new(None));
    let after = Counter::new();
    let workflow = Workflow::builder("doomed")
        .default_retry(immediate_retry(5))
        .on_failure(RecordingHook {
            calls: calls.clone(),
            last_step: last_step.clone(),
        })
        .step(StepDescriptor::new(
            "parse",
            step_fn(|_ctx: StepContext| async move {
                Err(StepError::permanent("BAD_INPUT", "amount is not a number"))
            }),
        ))
        .step(StepDescriptor::new("after", counting_step(after.clone(), json!(0))))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("doomed", json!({"amount": "x"}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { ref step_id, .. } if step_id == "parse"));
    let err = runtime.advance(run.run_id).await.unwrap_err();
    assert!(matches!(err, CoreError::RunTerminal { .. }));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(last_step.lock().await.as_deref(), Some("parse"));
    assert_eq!(after.get(), 0);

    let run = runtime.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("BAD_INPUT"));

    let events: Vec<String> = runtime
        .list_events(run.run_id, 100, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(events, vec!["created", "step_failed", "failed"]);
}

#[tokio::test]
async fn test_permanent_code_overrides_reported_class() {
    let calls = Counter::new();
    let workflow = Workflow::builder("coded")
        .step(
            StepDescriptor::new(
                "charge",
                {
                    let calls = calls.clone();
                    step_fn(move |_ctx: StepContext| {
                        let calls = calls.clone();
                        async move {
                            calls.bump();
                            Err(StepError::transient("CARD_DECLINED", "declined"))
                        }
                    })
                },
            )
            .with_retry(immediate_retry(3).with_permanent_code("CARD_DECLINED")),
        )
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("coded", json!({}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_development_mode_makes_a_single_attempt() {
    let calls = Counter::new();
    let workflow = Workflow::builder("dev")
        .step(StepDescriptor::new("flaky", flaky_step(calls.clone(), 1)))
        .build()
        .unwrap();
    let config = StepRuntimeConfig {
        default_retry: RetryPolicy::for_mode(ExecutionMode::Development),
        ..StepRuntimeConfig::default()
    };
    let runtime = runtime_with(catalog_of(workflow), config).await;
    let run = runtime.create_run("dev", json!({}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_dag_step_receives_outputs_of_all_predecessors() {
    let join = step_fn(|ctx: StepContext| async move { Ok(StepOutcome::Complete(ctx.input)) });
    let workflow = Workflow::builder("fan-in")
        .step(StepDescriptor::new("left", counting_step(Counter::new(), json!(1))))
        .step(StepDescriptor::new("right", counting_step(Counter::new(), json!(2))).after(Vec::<String>::new()))
        .step(StepDescriptor::new("join", join).after(["left", "right"]))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("fan-in", json!({"seed": 0}), None).await.unwrap();

    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Completed {
            output: json!({"left": 1, "right": 2})
        }
    );
}

#[tokio::test]
async fn test_unknown_workflow_and_run() {
    let runtime = runtime_with(WorkflowCatalog::new(), StepRuntimeConfig::default()).await;
    let err = runtime.create_run("missing", json!({}), None).await.unwrap_err();
    assert!(matches!(err, CoreError::WorkflowNotFound { .. }));
    let err = runtime.advance(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, CoreError::RunNotFound { .. }));
}

#[tokio::test]
async fn test_list_runs_by_status() {
    let workflow = Workflow::builder("listed")
        .step(StepDescriptor::new("only", counting_step(Counter::new(), json!(1))))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let done = runtime.create_run("listed", json!({}), None).await.unwrap();
    runtime.advance(done.run_id).await.unwrap();
    runtime.create_run("listed", json!({}), None).await.unwrap();

    let filter = ListRunsFilter {
        status: Some("success".to_string()),
        ..ListRunsFilter::default()
    };
    let runs = runtime.list_runs(&filter).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, done.run_id);
}

#[tokio::test]
async fn test_sweeper_advances_due_retries_once() {
    let calls = Counter::new();
    let workflow = Workflow::builder("swept")
        .default_retry(immediate_retry(3))
        .step(StepDescriptor::new("flaky", flaky_step(calls.clone(), 1)))
        .build()
        .unwrap();
    let runtime = runtime_with(catalog_of(workflow), StepRuntimeConfig::default()).await;
    let run = runtime.create_run("swept", json!({}), None).await.unwrap();
    let outcome = runtime.advance(run.run_id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::RetryScheduled { .. }));

    // Make sure the stamped retry time is strictly in the past
    tokio::time::sleep(Duration::from_millis(10)).await;
    let sweeper = RetrySweeper::new(runtime.clone(), RetrySweeperConfig::default());
    let claimed = sweeper.sweep().await.unwrap();
    assert_eq!(claimed, vec![run.run_id]);
    assert!(sweeper.sweep().await.unwrap().is_empty());

    let mut status = RunStatus::Running;
    for _ in 0..100 {
        status = runtime.get_run(run.run_id).await.unwrap().status;
        if status == RunStatus::Success {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, RunStatus::Success);
    assert_eq!(calls.get(), 2);
}
