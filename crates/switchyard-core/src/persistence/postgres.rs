// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Queries are free functions over a `PgPool` so they can be reused inside
//! transactions by embedders; [`PostgresPersistence`] delegates to them.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;

use super::{
    AlertRecord, ListRunsFilter, NewRun, NewRunEvent, Persistence, RunEventRecord, RunRecord,
    RunStateUpdate, StepResultRecord,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a persistence provider from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Run Operations
// ============================================================================

/// Insert a run in `running` status.
pub async fn insert_run(pool: &PgPool, run: &NewRun) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_runs (run_id, workflow_id, status, input, created_at, updated_at)
        VALUES ($1, $2, 'running', $3, NOW(), NOW())
        "#,
    )
    .bind(&run.run_id)
    .bind(&run.workflow_id)
    .bind(&run.input)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load a run.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, workflow_id, status, input, output, error, suspended_step_id,
               suspend_payload, next_retry_at, created_at, updated_at
        FROM workflow_runs
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Overwrite run state unless terminal.
pub async fn update_run_state(
    pool: &PgPool,
    run_id: &str,
    update: &RunStateUpdate,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET status = $1, output = $2, error = $3, suspended_step_id = $4,
            suspend_payload = $5, next_retry_at = $6, updated_at = NOW()
        WHERE run_id = $7 AND status NOT IN ('success', 'failed', 'canceled')
        "#,
    )
    .bind(&update.status)
    .bind(&update.output)
    .bind(&update.error)
    .bind(&update.suspended_step_id)
    .bind(&update.suspend_payload)
    .bind(update.next_retry_at)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Overwrite run state only from status `from`.
pub async fn transition_run(
    pool: &PgPool,
    run_id: &str,
    from: &str,
    update: &RunStateUpdate,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET status = $1, output = $2, error = $3, suspended_step_id = $4,
            suspend_payload = $5, next_retry_at = $6, updated_at = NOW()
        WHERE run_id = $7 AND status = $8
        "#,
    )
    .bind(&update.status)
    .bind(&update.output)
    .bind(&update.error)
    .bind(&update.suspended_step_id)
    .bind(&update.suspend_payload)
    .bind(update.next_retry_at)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// List runs, newest first.
pub async fn list_runs(pool: &PgPool, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
    let records = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, workflow_id, status, input, output, error, suspended_step_id,
               suspend_payload, next_retry_at, created_at, updated_at
        FROM workflow_runs
        WHERE ($1::TEXT IS NULL OR workflow_id = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY created_at DESC, run_id
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(&filter.workflow_id)
    .bind(&filter.status)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Running runs with a due retry.
pub async fn get_runs_due_for_retry(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RunRecord>, CoreError> {
    let records = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, workflow_id, status, input, output, error, suspended_step_id,
               suspend_payload, next_retry_at, created_at, updated_at
        FROM workflow_runs
        WHERE status = 'running' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
        ORDER BY next_retry_at
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Move a due marker to `lease_until`.
pub async fn claim_retry(
    pool: &PgPool,
    run_id: &str,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET next_retry_at = $3
        WHERE run_id = $1 AND status = 'running'
          AND next_retry_at IS NOT NULL AND next_retry_at <= $2
        "#,
    )
    .bind(run_id)
    .bind(now)
    .bind(lease_until)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move the lease of a running run.
pub async fn extend_lease(
    pool: &PgPool,
    run_id: &str,
    until: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_runs
        SET next_retry_at = $2, updated_at = NOW()
        WHERE run_id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(until)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Step Results
// ============================================================================

/// All step results of a run.
pub async fn load_step_results(
    pool: &PgPool,
    run_id: &str,
) -> Result<Vec<StepResultRecord>, CoreError> {
    let records = sqlx::query_as::<_, StepResultRecord>(
        r#"
        SELECT run_id, step_id, status, output, attempt, error, updated_at
        FROM step_results
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Upsert a step result without touching a success row.
pub async fn save_step_result(pool: &PgPool, result: &StepResultRecord) -> Result<bool, CoreError> {
    let done = sqlx::query(
        r#"
        INSERT INTO step_results (run_id, step_id, status, output, attempt, error, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (run_id, step_id) DO UPDATE
        SET status = EXCLUDED.status,
            output = EXCLUDED.output,
            attempt = EXCLUDED.attempt,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
        WHERE step_results.status <> 'success'
        "#,
    )
    .bind(&result.run_id)
    .bind(&result.step_id)
    .bind(&result.status)
    .bind(&result.output)
    .bind(result.attempt)
    .bind(&result.error)
    .bind(result.updated_at)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() > 0)
}

// ============================================================================
// Events
// ============================================================================

/// Append an audit event.
pub async fn insert_event(pool: &PgPool, event: &NewRunEvent) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO run_events (run_id, event_type, step_id, detail, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(&event.run_id)
    .bind(&event.event_type)
    .bind(&event.step_id)
    .bind(&event.detail)
    .execute(pool)
    .await?;
    Ok(())
}

/// Audit events of a run, oldest first.
pub async fn list_events(
    pool: &PgPool,
    run_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<RunEventRecord>, CoreError> {
    let records = sqlx::query_as::<_, RunEventRecord>(
        r#"
        SELECT id, run_id, event_type, step_id, detail, created_at
        FROM run_events
        WHERE run_id = $1
        ORDER BY id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(run_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

// ============================================================================
// Alert Dedup
// ============================================================================

/// Insert a dedup key if absent.
pub async fn insert_alert(pool: &PgPool, alert: &AlertRecord) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO alert_dedup
            (subject_id, category, period, threshold_percent, value_percent, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (subject_id, category, period, threshold_percent) DO NOTHING
        "#,
    )
    .bind(&alert.subject_id)
    .bind(&alert.category)
    .bind(&alert.period)
    .bind(alert.threshold_percent)
    .bind(alert.value_percent)
    .bind(alert.created_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Load a dedup key.
pub async fn get_alert(
    pool: &PgPool,
    subject_id: &str,
    category: &str,
    period: &str,
    threshold_percent: i32,
) -> Result<Option<AlertRecord>, CoreError> {
    let record = sqlx::query_as::<_, AlertRecord>(
        r#"
        SELECT subject_id, category, period, threshold_percent, value_percent, created_at
        FROM alert_dedup
        WHERE subject_id = $1 AND category = $2 AND period = $3 AND threshold_percent = $4
        "#,
    )
    .bind(subject_id)
    .bind(category)
    .bind(period)
    .bind(threshold_percent)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Delete dedup keys of older periods.
pub async fn prune_alerts_before(pool: &PgPool, period: &str) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM alert_dedup WHERE period < $1")
        .bind(period)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_run(&self, run: &NewRun) -> Result<(), CoreError> {
        insert_run(&self.pool, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        get_run(&self.pool, run_id).await
    }

    async fn update_run_state(
        &self,
        run_id: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError> {
        update_run_state(&self.pool, run_id, update).await
    }

    async fn transition_run(
        &self,
        run_id: &str,
        from: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError> {
        transition_run(&self.pool, run_id, from, update).await
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
        list_runs(&self.pool, filter).await
    }

    async fn load_step_results(&self, run_id: &str) -> Result<Vec<StepResultRecord>, CoreError> {
        load_step_results(&self.pool, run_id).await
    }

    async fn save_step_result(&self, result: &StepResultRecord) -> Result<bool, CoreError> {
        save_step_result(&self.pool, result).await
    }

    async fn get_runs_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, CoreError> {
        get_runs_due_for_retry(&self.pool, now, limit).await
    }

    async fn claim_retry(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        claim_retry(&self.pool, run_id, now, lease_until).await
    }

    async fn extend_lease(&self, run_id: &str, until: DateTime<Utc>) -> Result<bool, CoreError> {
        extend_lease(&self.pool, run_id, until).await
    }

    async fn insert_event(&self, event: &NewRunEvent) -> Result<(), CoreError> {
        insert_event(&self.pool, event).await
    }

    async fn list_events(
        &self,
        run_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunEventRecord>, CoreError> {
        list_events(&self.pool, run_id, limit, offset).await
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<bool, CoreError> {
        insert_alert(&self.pool, alert).await
    }

    async fn get_alert(
        &self,
        subject_id: &str,
        category: &str,
        period: &str,
        threshold_percent: i32,
    ) -> Result<Option<AlertRecord>, CoreError> {
        get_alert(&self.pool, subject_id, category, period, threshold_percent).await
    }

    async fn prune_alerts_before(&self, period: &str) -> Result<u64, CoreError> {
        prune_alerts_before(&self.pool, period).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
