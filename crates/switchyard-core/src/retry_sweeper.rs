// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry sweeper.
//!
//! Periodically polls for running runs whose `next_retry_at` has passed and
//! advances them. That covers scheduled retries as well as runs whose lease
//! lapsed because the process executing them died. Each due run is claimed
//! (its marker moved forward by `claim_lease`) before the advance is spawned,
//! so overlapping polls never retry the same run twice, and a claim that is
//! never followed by an advance comes due again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::runtime::StepRuntime;

/// Retry sweeper configuration.
#[derive(Debug, Clone)]
pub struct RetrySweeperConfig {
    /// How often to poll for due retries.
    pub poll_interval: Duration,
    /// Maximum runs taken per poll.
    pub batch_size: i64,
    /// How long a claimed run stays invisible before it can be claimed again.
    pub claim_lease: Duration,
}

impl Default for RetrySweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// Background task re-advancing runs with due retries.
pub struct RetrySweeper {
    runtime: Arc<StepRuntime>,
    config: RetrySweeperConfig,
}

impl RetrySweeper {
    /// Create a sweeper.
    pub fn new(runtime: Arc<StepRuntime>, config: RetrySweeperConfig) -> Self {
        Self { runtime, config }
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Retry sweeper started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Retry sweeper shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to process due retries");
                    }
                }
            }
        }
    }

    /// Claim every due run and spawn an advance for it.
    ///
    /// Returns the claimed run ids.
    pub async fn sweep(&self) -> Result<Vec<Uuid>, CoreError> {
        let now = Utc::now();
        let persistence = self.runtime.persistence();
        let due = persistence
            .get_runs_due_for_retry(now, self.config.batch_size)
            .await?;
        if due.is_empty() {
            debug!("No retries due");
            return Ok(Vec::new());
        }

        let lease_until = now
            + chrono::Duration::from_std(self.config.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let mut claimed = Vec::with_capacity(due.len());
        for record in due {
            let Ok(run_id) = Uuid::parse_str(&record.run_id) else {
                warn!(run_id = %record.run_id, "Skipping run with malformed id");
                continue;
            };
            if !persistence
                .claim_retry(&record.run_id, now, lease_until)
                .await?
            {
                continue;
            }
            info!(run_id = %run_id, workflow_id = %record.workflow_id, "Retrying run");
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                match runtime.advance(run_id).await {
                    Ok(outcome) => debug!(run_id = %run_id, ?outcome, "Retry advanced"),
                    Err(e) => error!(run_id = %run_id, error = %e, "Retry advance failed"),
                }
            });
            claimed.push(run_id);
        }
        Ok(claimed)
    }
}
