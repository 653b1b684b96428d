// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron trigger source.
//!
//! Every registered cron trigger gets its own loop that sleeps until the
//! next tick and then fires. Firing creates a zero-input run for the bound
//! workflow and publishes an event carrying the run id, so the run reaches
//! the workflow-start handler through the same forwarder path as a webhook.
//!
//! The manual test event [`CRON_TEST_EVENT`] fires triggers on demand. Its
//! payload may name one trigger (`{"identifier": "..."}`); an empty payload
//! fires all of them.
//!
//! Each firing logs three points with the run id attached: fired, run
//! created, run dispatched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryQueue;
use crate::error::CoreError;
use crate::forwarder::InboundEvent;
use crate::registry::TriggerRegistry;
use crate::runtime::StepRuntime;

/// Channel name of the manual test event.
pub const CRON_TEST_EVENT: &str = "cron.trigger";

/// What caused a trigger to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireSource {
    /// The schedule came due.
    Schedule,
    /// The manual test event arrived.
    Manual,
}

impl fmt::Display for FireSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TestEventPayload {
    identifier: Option<String>,
}

/// Fires cron triggers on schedule and on demand.
pub struct CronSource {
    registry: Arc<TriggerRegistry>,
    runtime: Arc<StepRuntime>,
    queue: DeliveryQueue,
}

impl CronSource {
    /// Create a cron source over the registered triggers.
    pub fn new(
        registry: Arc<TriggerRegistry>,
        runtime: Arc<StepRuntime>,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            registry,
            runtime,
            queue,
        }
    }

    /// Fire a trigger once and return the new run id.
    pub async fn fire(&self, identifier: &str, source: FireSource) -> Result<Uuid, CoreError> {
        let cron = self
            .registry
            .cron(identifier)
            .ok_or_else(|| CoreError::TriggerNotFound {
                identifier: identifier.to_string(),
            })?;

        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            trigger = identifier,
            workflow_id = %cron.workflow_id,
            source = %source,
            "Cron trigger fired"
        );

        self.runtime
            .create_run(&cron.workflow_id, json!({}), Some(run_id))
            .await?;
        info!(run_id = %run_id, trigger = identifier, "Cron run created");

        let event = InboundEvent::new(cron.channel_name.clone())
            .with_json_body(&json!({}))
            .with_run_id(run_id);
        self.queue.publish(event).await?;
        info!(
            run_id = %run_id,
            trigger = identifier,
            channel = %cron.channel_name,
            "Cron run dispatched"
        );
        Ok(run_id)
    }

    /// Handle the manual test event.
    ///
    /// Returns the run ids created, one per trigger fired.
    pub async fn handle_test_event(&self, event: &InboundEvent) -> Result<Vec<Uuid>, CoreError> {
        let payload: TestEventPayload = if event.data.body.iter().all(u8::is_ascii_whitespace) {
            TestEventPayload::default()
        } else {
            serde_json::from_slice(&event.data.body).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring unreadable cron test payload, firing all triggers");
                TestEventPayload::default()
            })
        };

        let identifiers: Vec<String> = match payload.identifier {
            Some(id) => vec![id],
            None => self.registry.crons().map(|c| c.identifier.clone()).collect(),
        };

        let mut runs = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            runs.push(self.fire(&identifier, FireSource::Manual).await?);
        }
        Ok(runs)
    }

    /// Run one schedule loop per trigger until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let identifiers: Vec<String> = self
            .registry
            .crons()
            .map(|c| c.identifier.clone())
            .collect();
        info!(triggers = identifiers.len(), "Cron source started");

        let handles: Vec<_> = identifiers
            .into_iter()
            .map(|identifier| {
                let source = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { source.schedule_loop(identifier, shutdown).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Cron schedule loop panicked");
            }
        }
        info!("Cron source stopped");
    }

    async fn schedule_loop(&self, identifier: String, mut shutdown: watch::Receiver<bool>) {
        let mut last_tick: Option<DateTime<Utc>> = None;
        loop {
            let Some(cron) = self.registry.cron(&identifier) else {
                break;
            };
            let now = Utc::now();
            // Never fire the same tick twice, even if the timer wakes early
            let from = last_tick.map_or(now, |t| t.max(now));
            let Some(next) = cron.next_after(&from) else {
                warn!(trigger = %identifier, "Schedule has no upcoming tick, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(trigger = %identifier, next = %next, "Waiting for next tick");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    last_tick = Some(next);
                    if let Err(e) = self.fire(&identifier, FireSource::Schedule).await {
                        error!(trigger = %identifier, error = %e, "Cron firing failed");
                    }
                }
            }
        }
    }
}
