// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference workflows and their triggers.
//!
//! | Workflow | Steps | Triggers |
//! |----------|-------|----------|
//! | `budget-alert` | validate, evaluate, summarize | `/webhooks/slack/action`, `/webhooks/telegram/action` |
//! | `approval` | request (suspends), apply | `/api/approvals/events` |
//! | `alert-retention` | prune | cron `alert-retention`, `0 3 1 * *` |
//!
//! Every workflow notifies the run input's `address` when it fails.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use switchyard_core::alerts::{current_period, percent_of};
use switchyard_core::{
    AlertDispatcher, AlertEvaluation, CoreError, ExecutionMode, FailureHook, HandlerSpec,
    NotificationChannel, RegistrationError, RetryPolicy, RunFailure, StepContext,
    StepDescriptor, StepError, StepOutcome, TriggerRegistry, Workflow, WorkflowCatalog, step_fn,
};
use tracing::{debug, warn};

/// Budget threshold alerts.
pub const BUDGET_ALERT: &str = "budget-alert";
/// Human approval round-trip.
pub const APPROVAL: &str = "approval";
/// Monthly dedup-key cleanup.
pub const ALERT_RETENTION: &str = "alert-retention";

/// Thresholds checked by `budget-alert`, in percent of the limit.
pub const BUDGET_THRESHOLDS: [i32; 2] = [80, 100];

/// Shared collaborators of the reference workflows.
#[derive(Clone)]
pub struct WorkflowDeps {
    /// Alert dedup dispatcher.
    pub alerts: Arc<AlertDispatcher>,
    /// Outbound notifications.
    pub channel: Arc<dyn NotificationChannel>,
}

/// Sends a failure notice to the run input's `address`.
pub struct FailureNotifier {
    channel: Arc<dyn NotificationChannel>,
}

impl FailureNotifier {
    /// Notify through `channel`.
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl FailureHook for FailureNotifier {
    async fn on_failure(&self, failure: &RunFailure) {
        let Some(address) = failure.run_input.get("address").and_then(Value::as_str) else {
            debug!(run_id = %failure.run_id, "Failed run has no address to notify");
            return;
        };
        let message = format!(
            "Sorry, we could not process your request ({}). Reference: {}",
            failure.error.message, failure.run_id
        );
        if let Err(e) = self.channel.send(address, &message).await {
            warn!(run_id = %failure.run_id, error = %e, "Failure notification not delivered");
        }
    }
}

/// Build the catalog of reference workflows.
pub fn reference_catalog(deps: &WorkflowDeps) -> Result<WorkflowCatalog, CoreError> {
    let mut catalog = WorkflowCatalog::new();
    catalog.register(budget_alert(deps)?)?;
    catalog.register(approval(deps)?)?;
    catalog.register(alert_retention(deps)?)?;
    Ok(catalog)
}

/// Register the routes and cron triggers of the reference workflows.
pub fn register_triggers(
    registry: &mut TriggerRegistry,
    mode: ExecutionMode,
) -> Result<(), RegistrationError> {
    let retry = RetryPolicy::for_mode(mode);
    for path in ["/webhooks/slack/action", "/webhooks/telegram/action"] {
        registry.register_api_route(
            path,
            HandlerSpec::new(BUDGET_ALERT).with_retry(retry.clone()),
        )?;
    }
    registry.register_api_route(
        "/api/approvals/events",
        HandlerSpec::new(APPROVAL).with_retry(retry.clone()),
    )?;
    registry.register_cron_trigger(ALERT_RETENTION, "0 3 1 * *", ALERT_RETENTION, retry)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct BudgetEvent {
    subject_id: String,
    address: String,
    category: String,
    spent: f64,
    limit: f64,
    #[serde(default)]
    period: Option<String>,
}

fn budget_alert(deps: &WorkflowDeps) -> Result<Workflow, CoreError> {
    let alerts = deps.alerts.clone();

    let validate = step_fn(|ctx: StepContext| async move {
        let event: BudgetEvent = serde_json::from_value(ctx.input)
            .map_err(|e| StepError::permanent("INVALID_PAYLOAD", e.to_string()))?;
        if event.limit <= 0.0 {
            return Err(StepError::permanent(
                "INVALID_PAYLOAD",
                "limit must be positive",
            ));
        }
        let period = event
            .period
            .unwrap_or_else(|| current_period(Utc::now()));
        Ok(StepOutcome::Complete(json!({
            "subject_id": event.subject_id,
            "address": event.address,
            "category": event.category,
            "period": period,
            "value_percent": percent_of(event.spent, event.limit),
        })))
    });

    let evaluate = step_fn(move |ctx: StepContext| {
        let alerts = alerts.clone();
        async move {
            let evaluation = AlertEvaluation {
                subject_id: string_field(&ctx.input, "subject_id")?,
                address: string_field(&ctx.input, "address")?,
                category: string_field(&ctx.input, "category")?,
                period: string_field(&ctx.input, "period")?,
                value_percent: ctx.input["value_percent"].as_f64().unwrap_or_default(),
                thresholds: BUDGET_THRESHOLDS.to_vec(),
            };
            let outcome = alerts
                .evaluate(&evaluation)
                .await
                .map_err(|e| StepError::transient(e.error_code(), e.to_string()))?;
            Ok(StepOutcome::Complete(json!({ "alert": outcome })))
        }
    });

    let summarize = step_fn(|ctx: StepContext| async move {
        let validated = ctx.output_of("validate").cloned().unwrap_or(Value::Null);
        Ok(StepOutcome::Complete(json!({
            "subject_id": validated["subject_id"],
            "category": validated["category"],
            "period": validated["period"],
            "value_percent": validated["value_percent"],
            "alert": ctx.input["alert"],
        })))
    });

    Workflow::builder(BUDGET_ALERT)
        .on_failure(FailureNotifier::new(deps.channel.clone()))
        .step(StepDescriptor::new("validate", validate))
        .step(StepDescriptor::new("evaluate", evaluate))
        .step(StepDescriptor::new("summarize", summarize))
        .build()
}

fn approval(deps: &WorkflowDeps) -> Result<Workflow, CoreError> {
    let channel = deps.channel.clone();

    let request = step_fn(|ctx: StepContext| async move {
        let Some(decision) = ctx.resume else {
            return Ok(StepOutcome::Suspend(json!({
                "question": "Approve this request?",
                "request": ctx.run_input,
            })));
        };
        Ok(StepOutcome::Complete(json!({
            "approved": decision["approved"],
            "approver": decision.get("approver").cloned().unwrap_or(Value::Null),
            "request": ctx.run_input,
        })))
    });

    let apply = step_fn(move |ctx: StepContext| {
        let channel = channel.clone();
        async move {
            let approved = ctx.input["approved"].as_bool().unwrap_or(false);
            if let Some(address) = ctx.run_input.get("address").and_then(Value::as_str) {
                let verdict = if approved { "approved" } else { "declined" };
                channel
                    .send(address, &format!("Your request was {verdict}."))
                    .await
                    .map_err(|e| StepError::transient("NOTIFY_FAILED", e.to_string()))?;
            }
            Ok(StepOutcome::Complete(json!({
                "applied": approved,
                "approver": ctx.input["approver"],
            })))
        }
    });

    Workflow::builder(APPROVAL)
        .on_failure(FailureNotifier::new(deps.channel.clone()))
        .step(
            StepDescriptor::new("request", request).with_resume_schema(json!({
                "type": "object",
                "required": ["approved"],
                "properties": {
                    "approved": {"type": "boolean"},
                    "approver": {"type": "string"}
                }
            })),
        )
        .step(StepDescriptor::new("apply", apply))
        .build()
}

fn alert_retention(deps: &WorkflowDeps) -> Result<Workflow, CoreError> {
    let alerts = deps.alerts.clone();
    let prune = step_fn(move |_ctx: StepContext| {
        let alerts = alerts.clone();
        async move {
            let keep_from = previous_period(Utc::now());
            let pruned = alerts
                .prune_before(&keep_from)
                .await
                .map_err(|e| StepError::transient(e.error_code(), e.to_string()))?;
            Ok(StepOutcome::Complete(json!({
                "pruned": pruned,
                "kept_from": keep_from,
            })))
        }
    });

    Workflow::builder(ALERT_RETENTION)
        .step(StepDescriptor::new("prune", prune))
        .build()
}

/// Period before the one containing `now`.
pub fn previous_period(now: DateTime<Utc>) -> String {
    let (year, month) = if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    };
    format!("{year:04}-{month:02}")
}

fn string_field(input: &Value, name: &str) -> Result<String, StepError> {
    input
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepError::permanent("INVALID_PAYLOAD", format!("missing '{name}'")))
}
