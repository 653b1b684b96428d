// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{
    AlertRecord, ListRunsFilter, NewRun, NewRunEvent, Persistence, RunEventRecord, RunRecord,
    RunStateUpdate, StepResultRecord,
};

const RUN_COLUMNS: &str = "run_id, workflow_id, status, input, output, error, suspended_step_id, \
     suspend_payload, next_retry_at, created_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and run migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/switchyard.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_run(&self, run: &NewRun) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, workflow_id, status, input, created_at, updated_at)
            VALUES (?, ?, 'running', ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.workflow_id)
        .bind(&run.input)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = ?");
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn update_run_state(
        &self,
        run_id: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = ?, output = ?, error = ?, suspended_step_id = ?,
                suspend_payload = ?, next_retry_at = ?, updated_at = ?
            WHERE run_id = ? AND status NOT IN ('success', 'failed', 'canceled')
            "#,
        )
        .bind(&update.status)
        .bind(&update.output)
        .bind(&update.error)
        .bind(&update.suspended_step_id)
        .bind(&update.suspend_payload)
        .bind(update.next_retry_at)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_run(
        &self,
        run_id: &str,
        from: &str,
        update: &RunStateUpdate,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = ?, output = ?, error = ?, suspended_step_id = ?,
                suspend_payload = ?, next_retry_at = ?, updated_at = ?
            WHERE run_id = ? AND status = ?
            "#,
        )
        .bind(&update.status)
        .bind(&update.output)
        .bind(&update.error)
        .bind(&update.suspended_step_id)
        .bind(&update.suspend_payload)
        .bind(update.next_retry_at)
        .bind(Utc::now())
        .bind(run_id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE (? IS NULL OR workflow_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, run_id
            LIMIT ? OFFSET ?
            "#
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(&filter.workflow_id)
            .bind(&filter.workflow_id)
            .bind(&filter.status)
            .bind(&filter.status)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn load_step_results(&self, run_id: &str) -> Result<Vec<StepResultRecord>, CoreError> {
        let records = sqlx::query_as::<_, StepResultRecord>(
            r#"
            SELECT run_id, step_id, status, output, attempt, error, updated_at
            FROM step_results
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn save_step_result(&self, result: &StepResultRecord) -> Result<bool, CoreError> {
        let done = sqlx::query(
            r#"
            INSERT INTO step_results (run_id, step_id, status, output, attempt, error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, step_id) DO UPDATE
            SET status = excluded.status,
                output = excluded.output,
                attempt = excluded.attempt,
                error = excluded.error,
                updated_at = excluded.updated_at
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
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn get_runs_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE status = 'running' AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            ORDER BY next_retry_at
            LIMIT ?
            "#
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn claim_retry(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET next_retry_at = ?
            WHERE run_id = ? AND status = 'running'
              AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            "#,
        )
        .bind(lease_until)
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend_lease(&self, run_id: &str, until: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET next_retry_at = ?, updated_at = ?
            WHERE run_id = ? AND status = 'running'
            "#,
        )
        .bind(until)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_event(&self, event: &NewRunEvent) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, event_type, step_id, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.run_id)
        .bind(&event.event_type)
        .bind(&event.step_id)
        .bind(&event.detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunEventRecord>, CoreError> {
        let records = sqlx::query_as::<_, RunEventRecord>(
            r#"
            SELECT id, run_id, event_type, step_id, detail, created_at
            FROM run_events
            WHERE run_id = ?
            ORDER BY id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(run_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO alert_dedup
                (subject_id, category, period, threshold_percent, value_percent, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (subject_id, category, period, threshold_percent) DO NOTHING
            "#,
        )
        .bind(&alert.subject_id)
        .bind(&alert.category)
        .bind(&alert.period)
        .bind(alert.threshold_percent)
        .bind(alert.value_percent)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_alert(
        &self,
        subject_id: &str,
        category: &str,
        period: &str,
        threshold_percent: i32,
    ) -> Result<Option<AlertRecord>, CoreError> {
        let record = sqlx::query_as::<_, AlertRecord>(
            r#"
            SELECT subject_id, category, period, threshold_percent, value_percent, created_at
            FROM alert_dedup
            WHERE subject_id = ? AND category = ? AND period = ? AND threshold_percent = ?
            "#,
        )
        .bind(subject_id)
        .bind(category)
        .bind(period)
        .bind(threshold_percent)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn prune_alerts_before(&self, period: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM alert_dedup WHERE period < ?")
            .bind(period)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TERMINAL_STATUSES;

    async fn persistence() -> SqlitePersistence {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        SqlitePersistence::new(pool)
    }

    async fn seed_run(p: &SqlitePersistence, run_id: &str) {
        p.insert_run(&NewRun {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            input: "{}".to_string(),
        })
        .await
        .unwrap();
    }

    fn step(run_id: &str, status: &str, output: &str, attempt: i32) -> StepResultRecord {
        StepResultRecord {
            run_id: run_id.to_string(),
            step_id: "validate".to_string(),
            status: status.to_string(),
            output: Some(output.to_string()),
            attempt,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let p = persistence().await;
        seed_run(&p, "run-1").await;

        let run = p.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.workflow_id, "wf");
        assert_eq!(run.status, "running");
        assert!(p.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_row_is_never_overwritten() {
        let p = persistence().await;
        seed_run(&p, "run-1").await;

        assert!(p.save_step_result(&step("run-1", "pending", "null", 1)).await.unwrap());
        assert!(p.save_step_result(&step("run-1", "success", "1", 2)).await.unwrap());
        assert!(!p.save_step_result(&step("run-1", "success", "2", 3)).await.unwrap());
        assert!(!p.save_step_result(&step("run-1", "failed", "3", 4)).await.unwrap());

        let results = p.load_step_results("run-1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "success");
        assert_eq!(results[0].output.as_deref(), Some("1"));
        assert_eq!(results[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_terminal_runs_are_not_updated() {
        let p = persistence().await;
        for status in TERMINAL_STATUSES {
            let run_id = format!("run-{status}");
            seed_run(&p, &run_id).await;
            assert!(
                p.update_run_state(&run_id, &RunStateUpdate::status(status))
                    .await
                    .unwrap()
            );
            assert!(
                !p.update_run_state(&run_id, &RunStateUpdate::status("running"))
                    .await
                    .unwrap()
            );
            let run = p.get_run(&run_id).await.unwrap().unwrap();
            assert_eq!(run.status, status);
        }
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let p = persistence().await;
        seed_run(&p, "run-1").await;

        assert!(
            !p.transition_run("run-1", "suspended", &RunStateUpdate::status("running"))
                .await
                .unwrap()
        );
        assert!(
            p.transition_run("run-1", "running", &RunStateUpdate::status("suspended"))
                .await
                .unwrap()
        );
        assert_eq!(p.get_run("run-1").await.unwrap().unwrap().status, "suspended");
    }

    #[tokio::test]
    async fn test_retry_due_and_claim() {
        let p = persistence().await;
        seed_run(&p, "due").await;
        seed_run(&p, "later").await;

        let now = Utc::now();
        let mut update = RunStateUpdate::status("running");
        update.next_retry_at = Some(now - chrono::Duration::seconds(1));
        p.update_run_state("due", &update).await.unwrap();
        update.next_retry_at = Some(now + chrono::Duration::hours(1));
        p.update_run_state("later", &update).await.unwrap();

        let due = p.get_runs_due_for_retry(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].run_id, "due");

        let lease = now + chrono::Duration::minutes(1);
        assert!(p.claim_retry("due", now, lease).await.unwrap());
        assert!(!p.claim_retry("due", now, lease).await.unwrap());
        assert!(!p.claim_retry("later", now, lease).await.unwrap());
        assert!(p.get_runs_due_for_retry(now, 10).await.unwrap().is_empty());

        // A claimed run that is never advanced comes due again
        let claimed = p.get_run("due").await.unwrap().unwrap();
        assert_eq!(claimed.next_retry_at, Some(lease));
        let due = p.get_runs_due_for_retry(lease, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].run_id, "due");
    }

    #[tokio::test]
    async fn test_lease_only_moves_running_runs() {
        let p = persistence().await;
        seed_run(&p, "active").await;
        seed_run(&p, "parked").await;
        p.update_run_state("parked", &RunStateUpdate::status("suspended"))
            .await
            .unwrap();

        let until = Utc::now() + chrono::Duration::seconds(30);
        assert!(p.extend_lease("active", until).await.unwrap());
        assert!(!p.extend_lease("parked", until).await.unwrap());
        assert!(!p.extend_lease("missing", until).await.unwrap());

        let active = p.get_run("active").await.unwrap().unwrap();
        assert_eq!(active.next_retry_at, Some(until));
        let parked = p.get_run("parked").await.unwrap().unwrap();
        assert_eq!(parked.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let p = persistence().await;
        seed_run(&p, "a").await;
        seed_run(&p, "b").await;
        p.update_run_state("b", &RunStateUpdate::status("success"))
            .await
            .unwrap();

        let all = p.list_runs(&ListRunsFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let done = p
            .list_runs(&ListRunsFilter {
                status: Some("success".to_string()),
                ..ListRunsFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].run_id, "b");

        let other = p
            .list_runs(&ListRunsFilter {
                workflow_id: Some("other".to_string()),
                ..ListRunsFilter::default()
            })
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let p = persistence().await;
        seed_run(&p, "run-1").await;
        for kind in ["created", "step_succeeded", "completed"] {
            p.insert_event(&NewRunEvent {
                run_id: "run-1".to_string(),
                event_type: kind.to_string(),
                step_id: None,
                detail: None,
            })
            .await
            .unwrap();
        }
        let events = p.list_events("run-1", 10, 0).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, ["created", "step_succeeded", "completed"]);
        assert_eq!(p.list_events("run-1", 10, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_insert_is_unique_per_key() {
        let p = persistence().await;
        let alert = AlertRecord {
            subject_id: "user-1".to_string(),
            category: "groceries".to_string(),
            period: "2025-03".to_string(),
            threshold_percent: 80,
            value_percent: 85.0,
            created_at: Utc::now(),
        };
        assert!(p.insert_alert(&alert).await.unwrap());
        assert!(!p.insert_alert(&alert).await.unwrap());

        let stored = p
            .get_alert("user-1", "groceries", "2025-03", 80)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value_percent, 85.0);

        let old = AlertRecord {
            period: "2025-02".to_string(),
            ..alert.clone()
        };
        assert!(p.insert_alert(&old).await.unwrap());
        assert_eq!(p.prune_alerts_before("2025-03").await.unwrap(), 1);
        assert!(p.get_alert("user-1", "groceries", "2025-03", 80).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("switchyard.db");
        let p = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(p.health_check_db().await.unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_close_releases_the_pool() {
        let p = persistence().await;
        assert!(p.health_check_db().await.unwrap());
        p.close().await;
        assert!(p.health_check_db().await.is_err());
    }
}
