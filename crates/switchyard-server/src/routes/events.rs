// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manual event injection.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use switchyard_core::InboundEvent;
use switchyard_core::cron::CRON_TEST_EVENT;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::error::AppError;

/// Body of `POST /_internal/events`.
#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    /// Channel name.
    pub name: String,
    /// JSON body of the event.
    #[serde(default)]
    pub data: Option<Value>,
    /// Run to attach to.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Mount path, to pick one route on a collapsed channel.
    #[serde(default)]
    pub path: Option<String>,
}

/// `POST /_internal/events`
///
/// `cron.trigger` fires cron triggers immediately and answers with the
/// created run ids. Any other name is enqueued like a webhook.
pub async fn inject_event(
    State(state): State<AppState>,
    Json(request): Json<InjectRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let mut event = InboundEvent::new(request.name);
    if let Some(data) = &request.data {
        event = event.with_json_body(data);
    }
    if let Some(run_id) = request.run_id {
        event = event.with_run_id(run_id);
    }
    event.data.path = request.path;

    if event.name == CRON_TEST_EVENT {
        let runs = state.cron.handle_test_event(&event).await?;
        info!(fired = runs.len(), "Cron test event handled");
        return Ok((StatusCode::OK, Json(json!({ "runs": runs }))));
    }

    if state.registry.function(&event.name).is_none() {
        return Err(AppError::bad_request(format!(
            "no forwarding function listens on '{}'",
            event.name
        )));
    }
    let channel = event.name.clone();
    state.queue.publish(event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "channel": channel })),
    ))
}
