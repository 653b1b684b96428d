// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow-start handlers.
//!
//! This is where the forwarder delivers. A request without the correlation
//! header creates a run; a request naming a run attaches to it, so a
//! redelivered event advances the existing run instead of starting a second
//! one. Either way `advance` runs in a spawned task and the handler answers
//! `202` right away. Redelivery for a finished run is a `200` no-op.

use std::sync::Arc;

use axum::Json;
use axum::extract::{MatchedPath, Path, State};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};
use switchyard_core::{CoreError, RunStatus, StepRuntime};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::AppState;
use super::ingress::run_id_header;
use crate::error::AppError;

/// `POST /_internal/workflows/{workflow_id}/start`
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    start_run(&state, &workflow_id, &headers, &body).await
}

/// Start handler bound to a webhook mount path.
pub async fn start_from_route(
    State(state): State<AppState>,
    matched: MatchedPath,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let route = state
        .registry
        .route(matched.as_str())
        .ok_or_else(|| anyhow::anyhow!("no route registered for '{}'", matched.as_str()))?;
    let workflow_id = route.handler.workflow_id.clone();
    start_run(&state, &workflow_id, &headers, &body).await
}

#[instrument(skip_all, fields(workflow_id = %workflow_id))]
async fn start_run(
    state: &AppState,
    workflow_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(StatusCode, Json<Value>), AppError> {
    let input = parse_input(body)?;

    let run = match run_id_header(headers)? {
        Some(run_id) => {
            let run = state.runtime.get_run(run_id).await?;
            if run.workflow_id != workflow_id {
                return Err(AppError::conflict(format!(
                    "run {run_id} belongs to workflow '{}', not '{workflow_id}'",
                    run.workflow_id
                )));
            }
            if run.status.is_terminal() || run.status == RunStatus::Suspended {
                debug!(run_id = %run_id, status = %run.status, "Redelivery for settled run ignored");
                return Ok((
                    StatusCode::OK,
                    Json(json!({ "run_id": run_id, "status": run.status, "noop": true })),
                ));
            }
            info!(run_id = %run_id, "Attaching to existing run");
            run
        }
        None => state.runtime.create_run(workflow_id, input, None).await?,
    };

    spawn_advance(state.runtime.clone(), run.run_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run.run_id, "status": RunStatus::Running })),
    ))
}

fn parse_input(body: &[u8]) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("request body is not valid JSON: {e}")))
}

fn spawn_advance(runtime: Arc<StepRuntime>, run_id: Uuid) {
    tokio::spawn(async move {
        match runtime.advance(run_id).await {
            Ok(outcome) => debug!(run_id = %run_id, ?outcome, "Run advanced"),
            Err(CoreError::RunTerminal { .. }) => {
                debug!(run_id = %run_id, "Run settled before advance")
            }
            Err(e @ CoreError::InvalidRunState { .. }) => {
                warn!(run_id = %run_id, error = %e, "Run not advanceable")
            }
            Err(e) => error!(run_id = %run_id, error = %e, "Advance failed"),
        }
    });
}
