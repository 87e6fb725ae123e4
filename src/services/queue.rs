//! Task queue lifecycle service
//!
//! Implements the task state machine on top of the queue_tasks repository:
//! PENDING -> RUNNING -> {COMPLETED | FAILED (retryable or terminal) | CANCELED}.
//! Retryable failures loop back through `next_retry_at` with exponential
//! backoff. The atomic claim itself lives in the repository; everything here
//! is policy.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Database, NewQueueTask, QueueTaskRecord, TaskStatus};

/// Queue policy knobs, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub default_max_retries: i64,
    pub batch_size: usize,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
            default_max_retries: config.default_max_retries,
            batch_size: config.batch_size,
        }
    }
}

/// Enqueue/dequeue/complete/fail/cancel operations with backoff policy
#[derive(Clone)]
pub struct QueueService {
    db: Database,
    settings: QueueSettings,
}

impl QueueService {
    pub fn new(db: Database, settings: QueueSettings) -> Self {
        Self { db, settings }
    }

    /// Enqueue a single path as a PENDING task
    pub async fn enqueue(
        &self,
        file_path: &str,
        is_directory: bool,
        priority: i64,
    ) -> Result<QueueTaskRecord> {
        let task = NewQueueTask {
            file_path: file_path.to_string(),
            file_name: file_name_of(file_path),
            is_directory,
            priority,
            max_retries: self.settings.default_max_retries,
        };

        let record = self.db.queue_tasks().insert(&task).await?;
        debug!(task_id = %record.id, path = %record.file_path, "Task enqueued");
        Ok(record)
    }

    /// Enqueue many paths, chunked to the configured batch size
    pub async fn enqueue_batch(&self, paths: &[(String, bool)]) -> Result<usize> {
        let repo = self.db.queue_tasks();
        let mut inserted = 0;

        for chunk in paths.chunks(self.settings.batch_size.max(1)) {
            let tasks: Vec<NewQueueTask> = chunk
                .iter()
                .map(|(path, is_directory)| NewQueueTask {
                    file_path: path.clone(),
                    file_name: file_name_of(path),
                    is_directory: *is_directory,
                    priority: 0,
                    max_retries: self.settings.default_max_retries,
                })
                .collect();

            inserted += repo.insert_batch(&tasks).await?;
        }

        if inserted > 0 {
            info!(count = inserted, "Batch enqueued");
        }
        Ok(inserted)
    }

    /// Claim the next runnable task, flipping it to RUNNING.
    ///
    /// Returns None when nothing is eligible right now.
    pub async fn dequeue(&self) -> Result<Option<QueueTaskRecord>> {
        self.db.queue_tasks().claim_next(Utc::now()).await
    }

    /// Mark a task COMPLETED with its result payload
    pub async fn complete_task(&self, id: Uuid, result: Option<serde_json::Value>) -> Result<()> {
        let updated = self
            .db
            .queue_tasks()
            .mark_completed(id, result.map(|v| v.to_string()))
            .await?;
        if !updated {
            warn!(task_id = %id, "complete_task: no such task");
        }
        Ok(())
    }

    /// Report a retryable failure.
    ///
    /// If the task has exhausted its retry budget the failure becomes
    /// terminal; otherwise the next attempt is scheduled at
    /// `now + min(base * 2^retry_count, max_delay)`.
    pub async fn fail_task(&self, id: Uuid, error: &str) -> Result<()> {
        let repo = self.db.queue_tasks();
        let task = repo
            .get_by_id(id)
            .await?
            .with_context(|| format!("fail_task: task {id} not found"))?;

        if task.retry_count >= task.max_retries - 1 {
            repo.mark_failed_terminal(id, error).await?;
            warn!(
                task_id = %id,
                retry_count = task.retry_count,
                error = %error,
                "Task failed permanently, retries exhausted"
            );
            return Ok(());
        }

        let delay = backoff_delay(
            task.retry_count,
            self.settings.retry_delay,
            self.settings.max_retry_delay,
        );
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));

        repo.mark_failed_retryable(id, error, next_retry_at).await?;
        debug!(
            task_id = %id,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Task failed, retry scheduled"
        );
        Ok(())
    }

    /// Report a non-retryable failure: terminal FAILED regardless of budget
    pub async fn fail_task_permanently(&self, id: Uuid, error: &str) -> Result<()> {
        self.db.queue_tasks().mark_failed_terminal(id, error).await?;
        warn!(task_id = %id, error = %error, "Task failed permanently");
        Ok(())
    }

    /// Cancel a task that has not started running.
    ///
    /// Returns false for RUNNING/COMPLETED tasks (state unchanged); returns
    /// true as a no-op if the task is already CANCELED.
    pub async fn cancel_task(&self, id: Uuid) -> Result<bool> {
        let task = self
            .db
            .queue_tasks()
            .get_by_id(id)
            .await?
            .with_context(|| format!("cancel_task: task {id} not found"))?;

        match task.status {
            TaskStatus::Canceled => Ok(true),
            TaskStatus::Running | TaskStatus::Completed => Ok(false),
            TaskStatus::Pending | TaskStatus::Failed => {
                Ok(self.db.queue_tasks().mark_canceled(id).await?)
            }
        }
    }

    /// Sweep RUNNING rows whose worker stopped reporting: anything started
    /// more than `timeout` ago is failed with "processing timeout" and goes
    /// through the normal retry policy.
    pub async fn cleanup_timeout_tasks(&self, timeout: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1));

        let stuck = self
            .db
            .queue_tasks()
            .list_running_started_before(cutoff)
            .await?;
        let count = stuck.len();

        for task in stuck {
            warn!(
                task_id = %task.id,
                started_at = ?task.started_at,
                "Recovering stuck RUNNING task"
            );
            self.fail_task(task.id, "processing timeout").await?;
        }

        Ok(count)
    }

    /// Bulk reset all FAILED tasks back to PENDING
    pub async fn retry_all_failed_tasks(&self) -> Result<u64> {
        let count = self.db.queue_tasks().reset_failed_to_pending().await?;
        info!(count, "Reset failed tasks to pending");
        Ok(count)
    }

    /// Bulk delete all FAILED tasks
    pub async fn clear_failed_tasks(&self) -> Result<u64> {
        let count = self.db.queue_tasks().delete_failed().await?;
        info!(count, "Cleared failed tasks");
        Ok(count)
    }
}

/// Exponential backoff: `min(base * 2^retry_count, max_delay)`
pub fn backoff_delay(retry_count: i64, base: Duration, max_delay: Duration) -> Duration {
    let exponent = retry_count.clamp(0, 32) as u32;
    base.checked_mul(2u32.saturating_pow(exponent))
        .map(|d| d.min(max_delay))
        .unwrap_or(max_delay)
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}
