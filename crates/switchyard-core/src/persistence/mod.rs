// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for switchyard-core.
//!
//! Runs, step results, run events and alert dedup keys live behind the
//! [`Persistence`] trait. Every method is one short statement; no connection
//! is held while a step executes.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::error::CoreError;

/// Workflow run row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RunRecord {
    /// Run identifier (UUID text).
    pub run_id: String,
    /// Workflow the run executes.
    pub workflow_id: String,
    /// running, suspended, success, failed or canceled.
    pub status: String,
    /// Run input, JSON text.
    pub input: String,
    /// Final output, JSON text.
    pub output: Option<String>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Step the run is suspended at.
    pub suspended_step_id: Option<String>,
    /// Suspend payload, JSON text.
    pub suspend_payload: Option<String>,
    /// When the run is next due for an advance: a scheduled retry, or the
    /// expiry of the lease taken by whoever is executing it.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Step result row. Once `status` is `success` the row is never rewritten.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StepResultRecord {
    /// Owning run.
    pub run_id: String,
    /// Step identifier.
    pub step_id: String,
    /// pending, success, failed or suspended.
    pub status: String,
    /// Output or suspend payload, JSON text.
    pub output: Option<String>,
    /// 1-indexed attempt number.
    pub attempt: i32,
    /// Last failure message.
    pub error: Option<String>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// Audit log row.
#[derive(Debug, Clone, PartialEq, serde::Serialize, sqlx::FromRow)]
pub struct RunEventRecord {
    /// Sequence id.
    pub id: i64,
    /// Owning run.
    pub run_id: String,
    /// Event kind (created, step_succeeded, suspended, ...).
    pub event_type: String,
    /// Step involved, if any.
    pub step_id: Option<String>,
    /// Free-form detail.
    pub detail: Option<String>,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

/// Alert dedup row. At most one exists per key.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AlertRecord {
    /// Subject the alert is about (user, account).
    pub subject_id: String,
    /// Category within the subject (budget name).
    pub category: String,
    /// Period the alert belongs to, `YYYY-MM`.
    pub period: String,
    /// Threshold crossed.
    pub threshold_percent: i32,
    /// Value observed when the alert was recorded.
    pub value_percent: f64,
    /// When the key was inserted.
    pub created_at: DateTime<Utc>,
}

/// New run to insert.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Run identifier.
    pub run_id: String,
    /// Workflow to execute.
    pub workflow_id: String,
    /// Input JSON text.
    pub input: String,
}

/// Full run state written by the runtime.
#[derive(Debug, Clone, Default)]
pub struct RunStateUpdate {
    /// New status.
    pub status: String,
    /// Final output JSON text.
    pub output: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Suspended step.
    pub suspended_step_id: Option<String>,
    /// Suspend payload JSON text.
    pub suspend_payload: Option<String>,
    /// Next retry due time.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RunStateUpdate {
    /// Plain status change with every other field cleared.
    pub fn status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }
}

/// New audit event.
#[derive(Debug, Clone)]
pub struct NewRunEvent {
    /// Owning run.
    pub run_id: String,
    /// Event kind.
    pub event_type: String,
    /// Step involved.
    pub step_id: Option<String>,
    /// Free-form detail.
    pub detail: Option<String>,
}

/// Filter for [`Persistence::list_runs`].
#[derive(Debug, Clone)]
pub struct ListRunsFilter {
    /// Only runs of this workflow.
    pub workflow_id: Option<String>,
    /// Only runs with this status.
    pub status: Option<String>,
    /// Page size.
    pub limit: i64,
    /// Page offset.
    pub offset: i64,
}

impl Default for ListRunsFilter {
    fn default() -> Self {
        Self {
            workflow_id: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Statuses that never change again.
pub const TERMINAL_STATUSES: [&str; 3] = ["success", "failed", "canceled"];

/// Storage for runs, step results, events and alert keys.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new run in `running` status.
    async fn insert_run(&self, run: &NewRun) -> Result<(), CoreError>;

    /// Load a run.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Overwrite the run state unless the run is terminal.
    ///
    /// Returns `false` when the run is terminal or missing.
    async fn update_run_state(
        &self,
        run_id: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError>;

    /// Overwrite the run state only if it currently has status `from`.
    async fn transition_run(
        &self,
        run_id: &str,
        from: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError>;

    /// List runs, newest first.
    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError>;

    /// All step results of a run.
    async fn load_step_results(&self, run_id: &str) -> Result<Vec<StepResultRecord>, CoreError>;

    /// Upsert a step result. Never overwrites a `success` row.
    ///
    /// Returns `false` when the existing row was already a success.
    async fn save_step_result(&self, result: &StepResultRecord) -> Result<bool, CoreError>;

    /// Running runs whose retry or lease is due at `now`.
    async fn get_runs_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, CoreError>;

    /// Move a due marker to `lease_until`. Returns `true` for the caller
    /// that moved it.
    async fn claim_retry(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Set the marker of a running run to `until`.
    ///
    /// Returns `false` when the run is no longer running.
    async fn extend_lease(&self, run_id: &str, until: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Append an audit event.
    async fn insert_event(&self, event: &NewRunEvent) -> Result<(), CoreError>;

    /// Audit events of a run, oldest first.
    async fn list_events(
        &self,
        run_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunEventRecord>, CoreError>;

    /// Insert a dedup key. Returns `false` if the key already existed.
    async fn insert_alert(&self, alert: &AlertRecord) -> Result<bool, CoreError>;

    /// Load a dedup key.
    async fn get_alert(
        &self,
        subject_id: &str,
        category: &str,
        period: &str,
        threshold_percent: i32,
    ) -> Result<Option<AlertRecord>, CoreError>;

    /// Delete dedup keys of periods before `period`. Returns rows deleted.
    async fn prune_alerts_before(&self, period: &str) -> Result<u64, CoreError>;

    /// Cheap connectivity check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;

    /// Close the pool, waiting for checked-out connections to return.
    async fn close(&self);
}

/// Connect to `database_url`, run migrations and return the matching backend.
///
/// `sqlite:` URLs select SQLite (in-memory databases get a single
/// connection); `postgres://` and `postgresql://` select PostgreSQL.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
) -> Result<Arc<dyn Persistence>, CoreError> {
    if database_url.starts_with("sqlite:") {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("invalid SQLite URL: {e}"),
            })?
            .create_if_missing(true);
        let max = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        info!(max_connections = max, "Connected to SQLite");
        return Ok(Arc::new(SqlitePersistence::new(pool)));
    }

    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        info!(max_connections, "Connected to PostgreSQL");
        return Ok(Arc::new(PostgresPersistence::new(pool)));
    }

    Err(CoreError::DatabaseError {
        operation: "connect".to_string(),
        details: "unsupported database URL scheme, expected sqlite: or postgres://".to_string(),
    })
}
