// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Threshold alerts sent at most once per dedup key.
//!
//! The dispatcher evaluates thresholds from highest to lowest and acts only
//! on the first one the value meets. The dedup row is inserted before the
//! notification goes out: a crash in between loses a notification instead
//! of sending it twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::CoreError;
use crate::persistence::{AlertRecord, Persistence};

/// Identity of one alert. At most one notification is sent per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertDedupKey {
    /// Subject the alert is about.
    pub subject_id: String,
    /// Category within the subject.
    pub category: String,
    /// Period, `YYYY-MM`.
    pub period: String,
    /// Threshold crossed.
    pub threshold_percent: i32,
}

/// One evaluation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvaluation {
    /// Subject the value belongs to.
    pub subject_id: String,
    /// Where the notification goes.
    pub address: String,
    /// Category within the subject.
    pub category: String,
    /// Period, `YYYY-MM`.
    pub period: String,
    /// Current value as a percentage.
    pub value_percent: f64,
    /// Thresholds to check, any order.
    pub thresholds: Vec<i32>,
}

/// Result of [`AlertDispatcher::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertOutcome {
    /// No threshold met.
    BelowThreshold,
    /// The highest met threshold was already alerted this period.
    AlreadyAlerted {
        /// Threshold matched.
        threshold: i32,
    },
    /// A notification was sent.
    Sent {
        /// Threshold matched.
        threshold: i32,
    },
    /// The key was recorded but the channel failed.
    SendFailed {
        /// Threshold matched.
        threshold: i32,
        /// Channel error.
        reason: String,
    },
}

/// Outbound notification capability.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver `message` to `address`.
    async fn send(&self, address: &str, message: &str) -> anyhow::Result<()>;
}

/// `spent / limit` as a percentage. A non-positive limit yields 0.
pub fn percent_of(spent: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    spent / limit * 100.0
}

/// Period key of `now`, `YYYY-MM`.
pub fn current_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Sends threshold alerts through a dedup store.
pub struct AlertDispatcher {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn NotificationChannel>,
}

impl AlertDispatcher {
    /// Create a dispatcher.
    pub fn new(persistence: Arc<dyn Persistence>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            persistence,
            channel,
        }
    }

    /// Evaluate thresholds and send at most one notification.
    #[instrument(
        skip(self, evaluation),
        fields(subject_id = %evaluation.subject_id, category = %evaluation.category, period = %evaluation.period)
    )]
    pub async fn evaluate(&self, evaluation: &AlertEvaluation) -> Result<AlertOutcome, CoreError> {
        let mut thresholds = evaluation.thresholds.clone();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));

        let Some(threshold) = thresholds
            .into_iter()
            .find(|t| evaluation.value_percent >= f64::from(*t))
        else {
            debug!(value_percent = evaluation.value_percent, "Below every threshold");
            return Ok(AlertOutcome::BelowThreshold);
        };

        let key = AlertDedupKey {
            subject_id: evaluation.subject_id.clone(),
            category: evaluation.category.clone(),
            period: evaluation.period.clone(),
            threshold_percent: threshold,
        };

        if self
            .persistence
            .get_alert(&key.subject_id, &key.category, &key.period, threshold)
            .await?
            .is_some()
        {
            debug!(threshold, "Already alerted this period");
            return Ok(AlertOutcome::AlreadyAlerted { threshold });
        }

        let inserted = self
            .persistence
            .insert_alert(&AlertRecord {
                subject_id: key.subject_id.clone(),
                category: key.category.clone(),
                period: key.period.clone(),
                threshold_percent: threshold,
                value_percent: evaluation.value_percent,
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            // Lost the race to a concurrent evaluation of the same key
            debug!(threshold, "Dedup key inserted concurrently");
            return Ok(AlertOutcome::AlreadyAlerted { threshold });
        }

        let message = alert_message(&key, evaluation.value_percent);
        match self.channel.send(&evaluation.address, &message).await {
            Ok(()) => {
                info!(threshold, "Threshold alert sent");
                Ok(AlertOutcome::Sent { threshold })
            }
            Err(e) => {
                warn!(threshold, error = %e, "Threshold alert recorded but not delivered");
                Ok(AlertOutcome::SendFailed {
                    threshold,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Delete dedup keys of periods before `period`.
    pub async fn prune_before(&self, period: &str) -> Result<u64, CoreError> {
        let deleted = self.persistence.prune_alerts_before(period).await?;
        info!(period, deleted, "Pruned alert dedup keys");
        Ok(deleted)
    }
}

fn alert_message(key: &AlertDedupKey, value_percent: f64) -> String {
    if key.threshold_percent >= 100 {
        format!(
            "'{}' is over its limit for {}: {:.0}% used",
            key.category, key.period, value_percent
        )
    } else {
        format!(
            "'{}' reached {}% of its limit for {}: {:.0}% used",
            key.category, key.threshold_percent, key.period, value_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(80.0, 100.0), 80.0);
        assert_eq!(percent_of(150.0, 100.0), 150.0);
        assert_eq!(percent_of(10.0, 0.0), 0.0);
    }

    #[test]
    fn test_current_period() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(current_period(now), "2025-03");
    }

    #[test]
    fn test_alert_message_mentions_threshold() {
        let key = AlertDedupKey {
            subject_id: "u1".to_string(),
            category: "groceries".to_string(),
            period: "2025-03".to_string(),
            threshold_percent: 80,
        };
        let msg = alert_message(&key, 85.4);
        assert!(msg.contains("80%"));
        assert!(msg.contains("85%"));
        assert!(msg.contains("groceries"));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(AlertOutcome::Sent { threshold: 100 }).unwrap();
        assert_eq!(json["outcome"], "sent");
        assert_eq!(json["threshold"], 100);
    }
}
