// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event forwarding.
//!
//! Turns an [`InboundEvent`] into an HTTP call to the local workflow-start
//! handler and classifies the outcome. The forwarder only delivers; retrying
//! is left to the caller (see [`crate::delivery`]).

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::retry::ErrorClass;

/// Header carrying the run id so the receiving handler attaches to an
/// existing run instead of creating one.
pub const RUN_ID_HEADER: &str = "x-switchyard-run-id";

/// Headers describing the inbound connection, never copied onto the
/// forwarded request.
const HOP_BY_HOP: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

/// Payload of an inbound event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventData {
    /// HTTP method to replay.
    pub method: String,
    /// Request headers, lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    pub body: Vec<u8>,
    /// Existing run to attach to.
    pub run_id: Option<Uuid>,
    /// Mount path the event arrived on, when it came through a webhook.
    pub path: Option<String>,
}

/// A unit of trigger delivery. Transient: built, forwarded, dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Channel name.
    pub name: String,
    /// Request to replay.
    pub data: EventData,
}

impl InboundEvent {
    /// Create an event with an empty `POST` payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: EventData {
                method: "POST".to_string(),
                ..EventData::default()
            },
        }
    }

    /// Attach a run id.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.data.run_id = Some(run_id);
        self
    }

    /// Set a JSON body and content type.
    pub fn with_json_body(mut self, body: &serde_json::Value) -> Self {
        self.data.body = body.to_string().into_bytes();
        self.data
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        self
    }
}

/// Forwarding failure, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    /// Transient failure: network, rate limit, timeout, 5xx.
    #[error("Retriable delivery failure{}: {message}", fmt_status(.status))]
    Retriable {
        /// Response status, if a response arrived.
        status: Option<u16>,
        /// Details.
        message: String,
    },

    /// Permanent failure: bad payload, auth, unknown target.
    #[error("Non-retriable delivery failure{}: {message}", fmt_status(.status))]
    NonRetriable {
        /// Response status, if a response arrived.
        status: Option<u16>,
        /// Details.
        message: String,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl DeliveryError {
    /// Build an error of the given class.
    pub fn new(class: ErrorClass, status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        match class {
            ErrorClass::Retriable => Self::Retriable { status, message },
            ErrorClass::NonRetriable => Self::NonRetriable { status, message },
        }
    }

    /// Class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Retriable { .. } => ErrorClass::Retriable,
            Self::NonRetriable { .. } => ErrorClass::NonRetriable,
        }
    }

    /// True when the scheduler should redeliver later.
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}

/// Classify a non-2xx status.
///
/// 5xx, 429 and 408 are transient. Every other status (4xx validation or auth
/// failures, odd 3xx/1xx) cannot succeed on retry.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 => ErrorClass::Retriable,
        500..=599 => ErrorClass::Retriable,
        _ => ErrorClass::NonRetriable,
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardReceipt {
    /// Response status.
    pub status: u16,
    /// Response body, for diagnostics.
    pub body: String,
}

/// HTTP client for the local workflow-start handlers.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl EventForwarder {
    /// Create a forwarder targeting `base_url` (e.g. `http://127.0.0.1:8081`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a forwarder around an existing client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL every target path is appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Deliver `event` to `target_path` once.
    #[instrument(skip(self, event), fields(channel = %event.name, run_id = ?event.data.run_id))]
    pub async fn forward(
        &self,
        target_path: &str,
        event: &InboundEvent,
    ) -> Result<ForwardReceipt, DeliveryError> {
        let url = format!("{}{}", self.base_url, target_path);
        let method = reqwest::Method::from_bytes(event.data.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                DeliveryError::new(
                    ErrorClass::NonRetriable,
                    None,
                    format!("invalid method '{}': {}", event.data.method, e),
                )
            })?;

        let mut request = self.client.request(method, &url);
        for (name, value) in &event.data.headers {
            let lower = name.to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str()) || lower == RUN_ID_HEADER {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(run_id) = event.data.run_id {
            request = request.header(RUN_ID_HEADER, run_id.to_string());
        }
        request = request.body(event.data.body.clone());

        debug!(url = %url, "Forwarding event");
        let response = request.send().await.map_err(|e| {
            // Build errors mean the request itself is malformed
            let class = if e.is_builder() {
                ErrorClass::NonRetriable
            } else {
                ErrorClass::Retriable
            };
            warn!(url = %url, error = %e, "Forwarding request failed");
            DeliveryError::new(class, None, format!("request to {url} failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if (200..300).contains(&status) {
            debug!(status, "Event delivered");
            return Ok(ForwardReceipt { status, body });
        }

        let class = classify_status(status);
        warn!(status, retriable = class.is_retriable(), "Handler rejected event");
        Err(DeliveryError::new(class, Some(status), body))
    }
}
