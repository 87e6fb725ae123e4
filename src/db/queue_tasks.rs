//! Queue task database repository
//!
//! Holds the persisted task rows and the transactional read-modify-write
//! operations on them. Lifecycle policy (backoff, sweeps, triage) lives in
//! [`crate::services::queue::QueueService`]; this module only guarantees that
//! individual transitions are atomic against the store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Queue task record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueTaskRecord {
    pub id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub is_directory: bool,
    pub priority: i64,
    pub status: TaskStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<String>,
}

/// Input for enqueueing a task
#[derive(Debug, Clone)]
pub struct NewQueueTask {
    pub file_path: String,
    pub file_name: String,
    pub is_directory: bool,
    pub priority: i64,
    pub max_retries: i64,
}

const TASK_COLUMNS: &str = "id, file_path, file_name, is_directory, priority, status, \
     retry_count, max_retries, created_at, started_at, completed_at, next_retry_at, \
     last_error, result";

pub struct QueueTaskRepository {
    pool: SqlitePool,
}

impl QueueTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a single PENDING task row
    pub async fn insert(&self, task: &NewQueueTask) -> Result<QueueTaskRecord> {
        let record = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            r#"
            INSERT INTO queue_tasks (id, file_path, file_name, is_directory, priority, status,
                                     retry_count, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7)
            RETURNING {TASK_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(&task.file_path)
        .bind(&task.file_name)
        .bind(task.is_directory)
        .bind(task.priority)
        .bind(task.max_retries)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Insert a batch of PENDING rows in one transaction
    pub async fn insert_batch(&self, tasks: &[NewQueueTask]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO queue_tasks (id, file_path, file_name, is_directory, priority, status,
                                         retry_count, max_retries, created_at)
                VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&task.file_path)
            .bind(&task.file_name)
            .bind(task.is_directory)
            .bind(task.priority)
            .bind(task.max_retries)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(tasks.len())
    }

    /// Atomically claim the next runnable task and flip it to RUNNING.
    ///
    /// Candidate selection: highest-priority, oldest-created PENDING row; if
    /// none, the oldest-created FAILED row whose retry backoff has elapsed and
    /// which still has retries left. `retry_count` is incremented only when
    /// the claim is sourced from FAILED.
    ///
    /// Selection and flip happen in one UPDATE statement, so two concurrent
    /// claims can never take the same row: SQLite serializes writers, and the
    /// loser's subselect re-evaluates after the winner commits.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueTaskRecord>> {
        let record = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            r#"
            UPDATE queue_tasks
            SET status = 'RUNNING',
                started_at = $1,
                retry_count = retry_count + (CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END),
                next_retry_at = NULL
            WHERE id = (
                SELECT id FROM queue_tasks
                WHERE status = 'PENDING'
                   OR (status = 'FAILED'
                       AND next_retry_at IS NOT NULL
                       AND next_retry_at <= $1
                       AND retry_count < max_retries)
                ORDER BY CASE status WHEN 'PENDING' THEN 0 ELSE 1 END,
                         CASE WHEN status = 'PENDING' THEN -priority ELSE 0 END,
                         created_at ASC
                LIMIT 1
            )
            RETURNING {TASK_COLUMNS}
            "#,
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Get a task by id
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<QueueTaskRecord>> {
        let record = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Mark a task COMPLETED, storing its result and clearing the last error
    pub async fn mark_completed(&self, id: Uuid, result: Option<String>) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'COMPLETED', completed_at = $2, result = $3, last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(result)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Mark a task FAILED with a retry scheduled at `next_retry_at`
    pub async fn mark_failed_retryable(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'FAILED', last_error = $2, next_retry_at = $3,
                completed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Mark a task terminally FAILED: no backoff, never re-claimed
    pub async fn mark_failed_terminal(&self, id: Uuid, error: &str) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'FAILED', last_error = $2, next_retry_at = NULL, completed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Flip a task to CANCELED, guarded on its current status.
    ///
    /// Returns false when the row was no longer PENDING or FAILED (someone
    /// else transitioned it concurrently).
    pub async fn mark_canceled(&self, id: Uuid) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'CANCELED', completed_at = $2
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// RUNNING rows whose `started_at` is older than the cutoff (stuck workers)
    pub async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueTaskRecord>> {
        let records = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM queue_tasks
            WHERE status = 'RUNNING' AND started_at IS NOT NULL AND started_at < $1
            ORDER BY started_at ASC
            "#,
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Bulk reset all FAILED rows back to PENDING for re-processing
    pub async fn reset_failed_to_pending(&self) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'PENDING', retry_count = 0, next_retry_at = NULL,
                started_at = NULL, completed_at = NULL
            WHERE status = 'FAILED'
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Bulk delete all FAILED rows. The only deletion path for task rows.
    pub async fn delete_failed(&self) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM queue_tasks WHERE status = 'FAILED'")
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows)
    }

    /// Count tasks by status (triage/diagnostics)
    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_tasks WHERE status = $1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
