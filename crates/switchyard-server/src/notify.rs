// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification channels.
//!
//! [`WebhookChannel`] POSTs `{"address", "message"}` to a configured URL,
//! for a messaging bridge to pick up. [`LogChannel`] only logs and is used
//! when no URL is configured.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use switchyard_core::NotificationChannel;
use tracing::{debug, info};

/// Channel that writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, address: &str, message: &str) -> anyhow::Result<()> {
        info!(address, message, "Notification");
        Ok(())
    }
}

/// Channel that POSTs notifications to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    /// Create a channel posting to `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build notification HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, address: &str, message: &str) -> anyhow::Result<()> {
        debug!(url = %self.url, address, "Posting notification");
        self.client
            .post(&self.url)
            .json(&json!({ "address": address, "message": message }))
            .send()
            .await
            .with_context(|| format!("notification request to {} failed", self.url))?
            .error_for_status()
            .context("notification endpoint rejected the message")?;
        Ok(())
    }
}
