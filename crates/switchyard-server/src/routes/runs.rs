// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run management under `/_internal/runs`.

use axum::Json;
use axum::extract::{Path, Query, State};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use switchyard_core::persistence::{ListRunsFilter, RunEventRecord};
use switchyard_core::{AdvanceOutcome, WorkflowRun};
use uuid::Uuid;

use super::AppState;
use crate::error::AppError;

const MAX_PAGE: i64 = 500;

/// Paging query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    /// Page size, capped at 500.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, MAX_PAGE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Filters for `GET /_internal/runs`.
#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    /// Only runs of this workflow.
    pub workflow_id: Option<String>,
    /// Only runs in this status.
    pub status: Option<String>,
    /// Page size, capped at 500.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Body of `POST /_internal/runs/{run_id}/resume`.
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    /// Step the caller believes the run is suspended at.
    #[serde(default)]
    pub step_id: Option<String>,
    /// Resume data handed to the suspended step.
    pub data: Value,
}

/// Body of `POST /_internal/runs/{run_id}/cancel`. Optional.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// Recorded as the run's error.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `GET /_internal/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<WorkflowRun>>, AppError> {
    let page = PageQuery {
        limit: query.limit,
        offset: query.offset,
    };
    let filter = ListRunsFilter {
        workflow_id: query.workflow_id,
        status: query.status,
        limit: page.limit(),
        offset: page.offset(),
    };
    Ok(Json(state.runtime.list_runs(&filter).await?))
}

/// `GET /_internal/runs/{run_id}`
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<WorkflowRun>, AppError> {
    Ok(Json(state.runtime.get_run(run_id).await?))
}

/// `GET /_internal/runs/{run_id}/events`
pub async fn list_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<RunEventRecord>>, AppError> {
    // 404 for unknown runs rather than an empty list
    state.runtime.get_run(run_id).await?;
    let events = state
        .runtime
        .list_events(run_id, page.limit(), page.offset())
        .await?;
    Ok(Json(events))
}

/// `POST /_internal/runs/{run_id}/advance`
pub async fn advance_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    Ok(Json(state.runtime.advance(run_id).await?))
}

/// `POST /_internal/runs/{run_id}/resume`
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let request: ResumeRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid resume request: {e}")))?;
    let outcome = state
        .runtime
        .resume(run_id, request.step_id.as_deref(), request.data)
        .await?;
    Ok(Json(outcome))
}

/// `POST /_internal/runs/{run_id}/cancel`
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<WorkflowRun>, AppError> {
    let request: CancelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid cancel request: {e}")))?
    };
    Ok(Json(
        state
            .runtime
            .cancel(run_id, request.reason.as_deref())
            .await?,
    ))
}
