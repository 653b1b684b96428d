// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step execution runtime.
//!
//! Drives a [`WorkflowRun`] through its steps, memoizing every successful
//! output so a run can be advanced again after a crash or a failed step
//! without re-executing finished work.
//!
//! State machine:
//!
//! ```text
//!   create ──► Running ──► Success
//!                 │  ▲ ──► Failed
//!                 │  │
//!       suspend   ▼  │ resume
//!              Suspended
//!
//!   Running | Suspended ──cancel──► Canceled
//! ```
//!
//! Retries never sleep inside [`StepRuntime::advance`]. A retriable failure
//! leaves the step `Pending` with the next attempt number and stamps the run
//! with `next_retry_at`; the caller (or the retry sweeper) advances again.
//!
//! While a run is `Running`, `next_retry_at` is also its lease. Creating a
//! run and starting each step push it to the step timeout plus a grace
//! period. If the process dies mid-step (or nobody ever advances the run),
//! the lease lapses and the sweeper picks the run up; memoization keeps the
//! finished steps from running again. A panicking step is caught and treated
//! as a retriable failure.
//!
//! A `Pending` step row that carries an output holds resume data that has not
//! been consumed yet, so a resume survives a crash or a retriable failure of
//! the resumed step.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::persistence::{
    ListRunsFilter, NewRun, NewRunEvent, Persistence, RunEventRecord, RunStateUpdate,
    StepResultRecord,
};
use crate::retry::RetryPolicy;
use crate::run::{RunStatus, StepResult, StepStatus, WorkflowRun};
use crate::workflow::{
    RunFailure, StepContext, StepError, StepOutcome, Workflow, WorkflowCatalog, merge_resume,
};

/// Runtime-wide defaults.
#[derive(Debug, Clone)]
pub struct StepRuntimeConfig {
    /// Retry policy for steps and workflows that do not set one.
    pub default_retry: RetryPolicy,
    /// Wall-clock bound for steps without their own timeout.
    pub step_timeout: Duration,
    /// Added to the step timeout when leasing a run, covering the writes
    /// around the step.
    pub lease_grace: Duration,
}

impl Default for StepRuntimeConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(300),
            lease_grace: Duration::from_secs(30),
        }
    }
}

/// Where a call to `advance` or `resume` left the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Every step succeeded.
    Completed {
        /// Output of the last step.
        output: Value,
    },
    /// A step asked for external input.
    Suspended {
        /// Step waiting for resume.
        step_id: String,
        /// Payload published by the step.
        payload: Value,
    },
    /// A step failed retriably and will run again.
    RetryScheduled {
        /// Failed step.
        step_id: String,
        /// Attempt number of the next execution.
        attempt: u32,
        /// When the retry becomes due.
        retry_at: DateTime<Utc>,
    },
    /// A step failed permanently; the run is `Failed`.
    Failed {
        /// Failed step.
        step_id: String,
        /// Final error.
        error: StepError,
    },
}

/// Executes workflow runs against a persistence backend.
pub struct StepRuntime {
    persistence: Arc<dyn Persistence>,
    catalog: Arc<WorkflowCatalog>,
    config: StepRuntimeConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StepRuntime {
    /// Create a runtime.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        catalog: Arc<WorkflowCatalog>,
        config: StepRuntimeConfig,
    ) -> Self {
        Self {
            persistence,
            catalog,
            config,
            locks: DashMap::new(),
        }
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Workflow catalog.
    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    /// Create a run in `Running` status without executing anything.
    ///
    /// `run_id` lets the caller pre-allocate the id (cron ticks log it before
    /// the run exists).
    #[instrument(skip(self, input), fields(workflow_id = %workflow_id))]
    pub async fn create_run(
        &self,
        workflow_id: &str,
        input: Value,
        run_id: Option<Uuid>,
    ) -> Result<WorkflowRun> {
        if !self.catalog.contains(workflow_id) {
            return Err(CoreError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            });
        }
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        self.persistence
            .insert_run(&NewRun {
                run_id: run_id.to_string(),
                workflow_id: workflow_id.to_string(),
                input: serde_json::to_string(&input)?,
            })
            .await?;
        // Due for the sweeper if the caller never gets to advance it
        self.persistence
            .extend_lease(&run_id.to_string(), self.lease_until(self.config.step_timeout))
            .await?;
        self.record_event(run_id, "created", None, None).await;
        info!(run_id = %run_id, "Workflow run created");
        self.get_run(run_id).await
    }

    /// Load a run with its step results.
    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let id = run_id.to_string();
        let record = self
            .persistence
            .get_run(&id)
            .await?
            .ok_or_else(|| CoreError::run_not_found(run_id))?;
        let steps = self.persistence.load_step_results(&id).await?;
        WorkflowRun::from_records(record, steps)
    }

    /// List runs, newest first. Step results are not loaded.
    pub async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<WorkflowRun>> {
        self.persistence
            .list_runs(filter)
            .await?
            .into_iter()
            .map(|r| WorkflowRun::from_records(r, Vec::new()))
            .collect()
    }

    /// Audit events of a run.
    pub async fn list_events(
        &self,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunEventRecord>> {
        self.persistence
            .list_events(&run_id.to_string(), limit, offset)
            .await
    }

    /// Execute the run's remaining steps in declared order.
    ///
    /// Steps with a recorded success are skipped and contribute their
    /// memoized output. Fails with `RunTerminal` for finished or canceled
    /// runs and `InvalidRunState` for suspended ones.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn advance(&self, run_id: Uuid) -> Result<AdvanceOutcome> {
        let lock = self.lock_for(run_id);
        let guard = lock.lock().await;

        let result: Result<AdvanceOutcome> = async {
            let run = self.get_run(run_id).await?;
            ensure_not_terminal(&run)?;
            if run.status == RunStatus::Suspended {
                return Err(CoreError::InvalidRunState {
                    run_id: run_id.to_string(),
                    expected: RunStatus::Running.to_string(),
                    actual: run.status.to_string(),
                });
            }
            let workflow = self.workflow(&run.workflow_id)?;
            self.drive(&workflow, run).await
        }
        .await;

        drop(guard);
        self.release_lock(run_id, lock);
        result
    }

    /// Resume a suspended run with external data.
    ///
    /// `step_id`, when given, must name the step the run is suspended at.
    /// Data failing the step's resume schema is rejected with
    /// `ResumeMismatch` and the run stays suspended.
    #[instrument(skip(self, data), fields(run_id = %run_id, step_id = ?step_id))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        step_id: Option<&str>,
        data: Value,
    ) -> Result<AdvanceOutcome> {
        let lock = self.lock_for(run_id);
        let guard = lock.lock().await;

        let result: Result<AdvanceOutcome> = async {
            let run = self.get_run(run_id).await?;
            ensure_not_terminal(&run)?;
            if run.status != RunStatus::Suspended {
                return Err(CoreError::InvalidRunState {
                    run_id: run_id.to_string(),
                    expected: RunStatus::Suspended.to_string(),
                    actual: run.status.to_string(),
                });
            }
            let suspended_at = run.suspended_step_id.clone().unwrap_or_default();
            let mismatch = |reason: String| CoreError::ResumeMismatch {
                run_id: run_id.to_string(),
                step_id: suspended_at.clone(),
                reason,
            };
            if let Some(requested) = step_id
                && requested != suspended_at
            {
                return Err(mismatch(format!(
                    "resume targets step '{requested}' but the run is suspended at '{suspended_at}'"
                )));
            }

            let workflow = self.workflow(&run.workflow_id)?;
            let step = workflow
                .step(&suspended_at)
                .ok_or_else(|| mismatch("suspended step is not part of the workflow".to_string()))?;
            step.validate_resume(&data).map_err(mismatch)?;

            let attempt = run
                .step_results
                .get(&suspended_at)
                .map(|r| r.attempt)
                .unwrap_or(1);
            self.persistence
                .save_step_result(&step_record(
                    run_id,
                    &suspended_at,
                    StepStatus::Pending,
                    Some(&data),
                    attempt,
                    None,
                )?)
                .await?;

            let resumed = self
                .persistence
                .transition_run(
                    &run_id.to_string(),
                    RunStatus::Suspended.as_str(),
                    &RunStateUpdate::status(RunStatus::Running.as_str()),
                )
                .await?;
            if !resumed {
                let current = self.get_run(run_id).await?;
                ensure_not_terminal(&current)?;
                return Err(CoreError::InvalidRunState {
                    run_id: run_id.to_string(),
                    expected: RunStatus::Suspended.to_string(),
                    actual: current.status.to_string(),
                });
            }
            self.record_event(run_id, "resumed", Some(&suspended_at), None)
                .await;
            info!(step_id = %suspended_at, "Run resumed");

            let run = self.get_run(run_id).await?;
            self.drive(&workflow, run).await
        }
        .await;

        drop(guard);
        self.release_lock(run_id, lock);
        result
    }

    /// Mark a run `Canceled`.
    ///
    /// Does not wait for an in-flight `advance`; that call observes the
    /// cancellation before its next step and stops.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: Uuid, reason: Option<&str>) -> Result<WorkflowRun> {
        let run = self.get_run(run_id).await?;
        ensure_not_terminal(&run)?;

        let update = RunStateUpdate {
            error: Some(reason.unwrap_or("canceled by operator").to_string()),
            ..RunStateUpdate::status(RunStatus::Canceled.as_str())
        };
        if !self
            .persistence
            .update_run_state(&run_id.to_string(), &update)
            .await?
        {
            let current = self.get_run(run_id).await?;
            ensure_not_terminal(&current)?;
        }
        self.record_event(run_id, "canceled", None, reason).await;
        info!("Run canceled");
        self.get_run(run_id).await
    }

    async fn drive(&self, workflow: &Workflow, run: WorkflowRun) -> Result<AdvanceOutcome> {
        let run_id = run.run_id;
        let id = run_id.to_string();
        let mut results: BTreeMap<String, StepResult> = run.step_results.clone();
        let mut outputs = run.outputs();
        let mut last_output = Value::Null;

        for step in workflow.steps() {
            if let Some(done) = results.get(step.id())
                && done.status == StepStatus::Success
            {
                debug!(step_id = %step.id(), "Step memoized, skipping");
                last_output = done.output.clone().unwrap_or(Value::Null);
                continue;
            }

            // Lease the run for this step. Refused once an operator canceled
            // the run while earlier steps ran.
            let timeout = step.timeout().unwrap_or(self.config.step_timeout);
            if !self
                .persistence
                .extend_lease(&id, self.lease_until(timeout))
                .await?
            {
                let current = self
                    .persistence
                    .get_run(&id)
                    .await?
                    .ok_or_else(|| CoreError::run_not_found(run_id))?;
                warn!(status = %current.status, step_id = %step.id(), "Run no longer running, stopping");
                return Err(CoreError::RunTerminal {
                    run_id: id,
                    status: current.status,
                });
            }

            let prior = results.get(step.id());
            let attempt = prior.map(|r| r.attempt).unwrap_or(1).max(1);
            let resume = prior
                .filter(|r| r.status == StepStatus::Pending)
                .and_then(|r| r.output.clone());

            let mut input = workflow.input_for(step, &run.input, &outputs);
            if let Some(data) = &resume {
                input = merge_resume(input, data);
            }
            let ctx = StepContext {
                run_id,
                workflow_id: workflow.id().to_string(),
                step_id: step.id().to_string(),
                attempt,
                input,
                run_input: run.input.clone(),
                resume: resume.clone(),
                outputs: outputs.clone(),
            };

            debug!(step_id = %step.id(), attempt, "Executing step");
            let execution = AssertUnwindSafe(step.handler().execute(ctx)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, execution).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let message = panic_message(&*panic);
                    error!(step_id = %step.id(), attempt, panic = %message, "Step panicked");
                    Err(StepError::panicked(message))
                }
                Err(_) => Err(StepError::timeout(timeout)),
            };

            match outcome {
                Ok(StepOutcome::Complete(output)) => {
                    let saved = self
                        .persistence
                        .save_step_result(&step_record(
                            run_id,
                            step.id(),
                            StepStatus::Success,
                            Some(&output),
                            attempt,
                            None,
                        )?)
                        .await?;
                    let output = if saved {
                        output
                    } else {
                        // Another writer recorded this step first; its output wins
                        warn!(step_id = %step.id(), "Step already recorded as success");
                        self.memoized_output(&id, step.id()).await?
                    };
                    self.record_event(run_id, "step_succeeded", Some(step.id()), None)
                        .await;
                    info!(step_id = %step.id(), attempt, "Step succeeded");
                    outputs.insert(step.id().to_string(), output.clone());
                    results.insert(
                        step.id().to_string(),
                        StepResult {
                            step_id: step.id().to_string(),
                            status: StepStatus::Success,
                            output: Some(output.clone()),
                            attempt,
                            error: None,
                        },
                    );
                    last_output = output;
                }
                Ok(StepOutcome::Suspend(payload)) => {
                    self.persistence
                        .save_step_result(&step_record(
                            run_id,
                            step.id(),
                            StepStatus::Suspended,
                            Some(&payload),
                            attempt,
                            None,
                        )?)
                        .await?;
                    let update = RunStateUpdate {
                        suspended_step_id: Some(step.id().to_string()),
                        suspend_payload: Some(serde_json::to_string(&payload)?),
                        ..RunStateUpdate::status(RunStatus::Suspended.as_str())
                    };
                    self.write_state(run_id, &update).await?;
                    self.record_event(run_id, "suspended", Some(step.id()), None)
                        .await;
                    info!(step_id = %step.id(), "Run suspended");
                    return Ok(AdvanceOutcome::Suspended {
                        step_id: step.id().to_string(),
                        payload,
                    });
                }
                Err(step_error) => {
                    let policy = step
                        .retry()
                        .or(workflow.retry())
                        .unwrap_or(&self.config.default_retry);
                    let class = policy.classify(&step_error.code, step_error.class);

                    if policy.should_retry(attempt, class) {
                        let delay = policy.delay_for_attempt(attempt);
                        let retry_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        let next_attempt = attempt + 1;
                        self.persistence
                            .save_step_result(&step_record(
                                run_id,
                                step.id(),
                                StepStatus::Pending,
                                resume.as_ref(),
                                next_attempt,
                                Some(step_error.to_string()),
                            )?)
                            .await?;
                        let update = RunStateUpdate {
                            next_retry_at: Some(retry_at),
                            ..RunStateUpdate::status(RunStatus::Running.as_str())
                        };
                        self.write_state(run_id, &update).await?;
                        self.record_event(
                            run_id,
                            "step_retry_scheduled",
                            Some(step.id()),
                            Some(&step_error.to_string()),
                        )
                        .await;
                        warn!(
                            step_id = %step.id(),
                            attempt,
                            next_attempt,
                            retry_at = %retry_at,
                            error = %step_error,
                            "Step failed, retry scheduled"
                        );
                        return Ok(AdvanceOutcome::RetryScheduled {
                            step_id: step.id().to_string(),
                            attempt: next_attempt,
                            retry_at,
                        });
                    }

                    self.persistence
                        .save_step_result(&step_record(
                            run_id,
                            step.id(),
                            StepStatus::Failed,
                            None,
                            attempt,
                            Some(step_error.to_string()),
                        )?)
                        .await?;
                    let update = RunStateUpdate {
                        error: Some(step_error.to_string()),
                        ..RunStateUpdate::status(RunStatus::Failed.as_str())
                    };
                    self.record_event(
                        run_id,
                        "step_failed",
                        Some(step.id()),
                        Some(&step_error.to_string()),
                    )
                    .await;
                    self.write_state(run_id, &update).await?;
                    self.record_event(run_id, "failed", None, Some(&step_error.to_string()))
                        .await;
                    error!(
                        step_id = %step.id(),
                        attempt,
                        error = %step_error,
                        "Step failed permanently, run failed"
                    );
                    if let Some(hook) = workflow.failure_hook() {
                        hook.on_failure(&RunFailure {
                            run_id,
                            workflow_id: workflow.id().to_string(),
                            step_id: step.id().to_string(),
                            error: step_error.clone(),
                            run_input: run.input.clone(),
                        })
                        .await;
                    }
                    return Ok(AdvanceOutcome::Failed {
                        step_id: step.id().to_string(),
                        error: step_error,
                    });
                }
            }
        }

        let update = RunStateUpdate {
            output: Some(serde_json::to_string(&last_output)?),
            ..RunStateUpdate::status(RunStatus::Success.as_str())
        };
        self.write_state(run_id, &update).await?;
        self.record_event(run_id, "completed", None, None).await;
        info!("Run completed");
        Ok(AdvanceOutcome::Completed {
            output: last_output,
        })
    }

    fn lease_until(&self, timeout: Duration) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(timeout + self.config.lease_grace)
                .unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Write run state, turning a refused write into `RunTerminal`.
    async fn write_state(&self, run_id: Uuid, update: &RunStateUpdate) -> Result<()> {
        if self
            .persistence
            .update_run_state(&run_id.to_string(), update)
            .await?
        {
            return Ok(());
        }
        let current = self.get_run(run_id).await?;
        Err(CoreError::RunTerminal {
            run_id: run_id.to_string(),
            status: current.status.to_string(),
        })
    }

    async fn memoized_output(&self, run_id: &str, step_id: &str) -> Result<Value> {
        let stored = self
            .persistence
            .load_step_results(run_id)
            .await?
            .into_iter()
            .find(|r| r.step_id == step_id)
            .and_then(|r| r.output);
        match stored {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(Value::Null),
        }
    }

    fn workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.catalog
            .get(workflow_id)
            .ok_or_else(|| CoreError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        step_id: Option<&str>,
        detail: Option<&str>,
    ) {
        let event = NewRunEvent {
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            step_id: step_id.map(str::to_string),
            detail: detail.map(str::to_string),
        };
        if let Err(e) = self.persistence.insert_event(&event).await {
            warn!(run_id = %run_id, event_type, error = %e, "Failed to record run event");
        }
    }

    fn lock_for(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(run_id).or_default().clone()
    }

    fn release_lock(&self, run_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&run_id, |_, held| Arc::strong_count(held) == 1);
    }
}

fn ensure_not_terminal(run: &WorkflowRun) -> Result<()> {
    if run.status.is_terminal() {
        return Err(CoreError::RunTerminal {
            run_id: run.run_id.to_string(),
            status: run.status.to_string(),
        });
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "step panicked".to_string()
}

fn step_record(
    run_id: Uuid,
    step_id: &str,
    status: StepStatus,
    output: Option<&Value>,
    attempt: u32,
    error: Option<String>,
) -> Result<StepResultRecord> {
    Ok(StepResultRecord {
        run_id: run_id.to_string(),
        step_id: step_id.to_string(),
        status: status.as_str().to_string(),
        output: output.map(serde_json::to_string).transpose()?,
        attempt: i32::try_from(attempt).unwrap_or(i32::MAX),
        error,
        updated_at: Utc::now(),
    })
}
