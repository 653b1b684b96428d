// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public webhook ingress.
//!
//! A webhook is forwarded to its workflow-start handler before the sender
//! gets an answer. Nothing is buffered in memory: a retriable delivery
//! failure answers `503` (or `429`) so the sender's own redelivery retries
//! it, and a rejected delivery answers with the handler's client error.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{MatchedPath, State};
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};
use switchyard_core::forwarder::EventData;
use switchyard_core::{InboundEvent, RUN_ID_HEADER};
use tracing::{info, instrument};
use uuid::Uuid;

use super::AppState;
use crate::error::AppError;

/// Turn a webhook into an event on its route's channel and forward it.
#[instrument(skip_all, fields(mount_path = %matched.as_str()))]
pub async fn accept_webhook(
    State(state): State<AppState>,
    matched: MatchedPath,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let mount_path = matched.as_str();
    let route = state
        .registry
        .route(mount_path)
        .ok_or_else(|| anyhow::anyhow!("no route registered for '{mount_path}'"))?;

    let event = InboundEvent {
        name: route.channel_name.clone(),
        data: EventData {
            method: method.to_string(),
            headers: header_map(&headers),
            body: body.to_vec(),
            run_id: run_id_header(&headers)?,
            path: Some(route.mount_path.clone()),
        },
    };
    let receipt = state.dispatcher.deliver(&event).await?;
    info!(channel = %route.channel_name, status = receipt.status, "Webhook forwarded");

    let handler: Value = serde_json::from_str(&receipt.body).unwrap_or(Value::Null);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "channel": route.channel_name,
            "handler": handler,
        })),
    ))
}

/// Headers as lowercase name to value. Non-UTF-8 values are dropped.
pub(crate) fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// The correlation header, if present. A malformed id is a client error.
pub(crate) fn run_id_header(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    let Some(raw) = headers.get(RUN_ID_HEADER) else {
        return Ok(None);
    };
    let text = raw
        .to_str()
        .map_err(|_| AppError::bad_request(format!("{RUN_ID_HEADER} is not valid text")))?;
    Uuid::parse_str(text.trim())
        .map(Some)
        .map_err(|e| AppError::bad_request(format!("{RUN_ID_HEADER} is not a UUID: {e}")))
}
