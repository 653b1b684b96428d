// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use switchyard_core::{CoreError, DeliveryError};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Conflict(String);

/// Error type for HTTP handlers. Responds with `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 400 Bad Request.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }

    /// 409 Conflict.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(Conflict(msg.into()).into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        if self.0.downcast_ref::<BadRequest>().is_some() {
            return (StatusCode::BAD_REQUEST, "BAD_REQUEST");
        }
        if self.0.downcast_ref::<Conflict>().is_some() {
            return (StatusCode::CONFLICT, "CONFLICT");
        }
        if let Some(e) = self.0.downcast_ref::<DeliveryError>() {
            return delivery_status(e);
        }
        let Some(e) = self.0.downcast_ref::<CoreError>() else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR");
        };
        let status = match e {
            CoreError::RunNotFound { .. }
            | CoreError::WorkflowNotFound { .. }
            | CoreError::TriggerNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::InvalidRunState { .. }
            | CoreError::RunTerminal { .. }
            | CoreError::ResumeMismatch { .. }
            | CoreError::DuplicateWorkflow { .. } => StatusCode::CONFLICT,
            CoreError::InvalidWorkflow { .. } => StatusCode::BAD_REQUEST,
            CoreError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.error_code())
    }
}

/// A failed forward as seen by the webhook sender. Retriable failures ask
/// the sender to redeliver; rejections pass the handler's client error on.
fn delivery_status(e: &DeliveryError) -> (StatusCode, &'static str) {
    match e {
        DeliveryError::Retriable {
            status: Some(429), ..
        } => (StatusCode::TOO_MANY_REQUESTS, "DELIVERY_RETRIABLE"),
        DeliveryError::Retriable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "DELIVERY_RETRIABLE"),
        DeliveryError::NonRetriable { status, .. } => (
            status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::UNPROCESSABLE_ENTITY),
            "DELIVERY_REJECTED",
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "Request failed");
        }
        let body = json!({ "error": self.0.to_string(), "code": code });
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
