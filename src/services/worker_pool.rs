//! Concurrent worker pool over the persisted task queue
//!
//! N independent poll loops dequeue tasks and race their processing against a
//! deadline. The pool is the only caller of the queue's complete/fail APIs,
//! so outcome-to-transition policy lives in exactly one place. Concurrency
//! and intervals can be changed at runtime: a graceful reconfigure drains
//! in-flight iterations, a forced one aborts the loops immediately (any
//! filesystem or network work already in flight may still finish afterward
//! and is not rolled back).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Database, EntryStatus, QueueTaskRecord};

use super::dispatcher::{TaskDispatcher, TaskOutcome};
use super::queue::QueueService;

/// Worker pool knobs, all hot-reloadable via [`WorkerPool::reconfigure`]
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub processing_timeout: Duration,
    pub error_retry_interval: Duration,
    pub timeout_cleanup_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.queue_poll_interval,
            processing_timeout: config.processing_timeout,
            error_retry_interval: config.error_retry_interval,
            timeout_cleanup_interval: config.timeout_cleanup_interval,
        }
    }
}

/// How a running pool is taken down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop dequeuing, await in-flight loop iterations
    Graceful,
    /// Abort loops immediately; in-flight side effects are not rolled back
    Forced,
}

struct Running {
    token: CancellationToken,
    tasks: JoinSet<()>,
    settings: WorkerSettings,
}

pub struct WorkerPool {
    queue: QueueService,
    dispatcher: Arc<TaskDispatcher>,
    db: Arc<Database>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(queue: QueueService, dispatcher: Arc<TaskDispatcher>, db: Arc<Database>) -> Self {
        Self {
            queue,
            dispatcher,
            db,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch worker loops and the stuck-task sweep timer
    pub async fn start(self: &Arc<Self>, settings: WorkerSettings) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            anyhow::bail!("worker pool already running");
        }

        *guard = Some(self.launch(settings));
        Ok(())
    }

    fn launch(self: &Arc<Self>, settings: WorkerSettings) -> Running {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for worker_id in 0..settings.concurrency {
            let pool = Arc::clone(self);
            let token = token.clone();
            let settings = settings.clone();
            tasks.spawn(async move {
                pool.worker_loop(worker_id, settings, token).await;
            });
        }

        {
            let pool = Arc::clone(self);
            let token = token.clone();
            let settings = settings.clone();
            tasks.spawn(async move {
                pool.cleanup_loop(settings, token).await;
            });
        }

        info!(concurrency = settings.concurrency, "Worker pool started");
        Running {
            token,
            tasks,
            settings,
        }
    }

    /// Stop the pool. Graceful mode drains in-flight iterations first.
    pub async fn stop(&self, mode: ShutdownMode) {
        let mut guard = self.running.lock().await;
        let Some(mut running) = guard.take() else {
            return;
        };

        running.token.cancel();
        match mode {
            ShutdownMode::Graceful => {
                while running.tasks.join_next().await.is_some() {}
                info!("Worker pool drained and stopped");
            }
            ShutdownMode::Forced => {
                running.tasks.abort_all();
                while running.tasks.join_next().await.is_some() {}
                warn!("Worker pool force-stopped, in-flight work abandoned");
            }
        }
    }

    /// Swap in new settings at runtime by restarting the loops
    pub async fn reconfigure(
        self: &Arc<Self>,
        settings: WorkerSettings,
        mode: ShutdownMode,
    ) -> Result<()> {
        self.stop(mode).await;

        let mut guard = self.running.lock().await;
        info!(
            concurrency = settings.concurrency,
            mode = ?mode,
            "Worker pool reconfigured"
        );
        *guard = Some(self.launch(settings));
        Ok(())
    }

    /// Current settings, when running
    pub async fn settings(&self) -> Option<WorkerSettings> {
        self.running.lock().await.as_ref().map(|r| r.settings.clone())
    }

    async fn worker_loop(&self, worker_id: usize, settings: WorkerSettings, token: CancellationToken) {
        debug!(worker_id, "Worker loop started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let task = tokio::select! {
                result = self.queue.dequeue() => result,
                _ = token.cancelled() => break,
            };

            match task {
                Ok(Some(task)) => self.handle_task(worker_id, task, &settings).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(settings.poll_interval) => {}
                        _ = token.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!(worker_id, error = %err, "Dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(settings.error_retry_interval) => {}
                        _ = token.cancelled() => break,
                    }
                }
            }
        }

        debug!(worker_id, "Worker loop stopped");
    }

    async fn handle_task(&self, worker_id: usize, task: QueueTaskRecord, settings: &WorkerSettings) {
        debug!(
            worker_id,
            task_id = %task.id,
            path = %task.file_path,
            retry_count = task.retry_count,
            "Processing task"
        );

        // Run processing on its own task and race it against the deadline.
        // On timeout we stop waiting; the spawned work is not aborted and may
        // still complete, its outcome is simply discarded.
        let dispatcher = Arc::clone(&self.dispatcher);
        let racing = {
            let task = task.clone();
            tokio::spawn(async move { dispatcher.process(&task).await })
        };

        let outcome = match timeout(settings.processing_timeout, racing).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => TaskOutcome {
                success: false,
                error: Some(format!("processing task panicked: {join_err}")),
                ..Default::default()
            },
            Err(_) => {
                warn!(
                    worker_id,
                    task_id = %task.id,
                    timeout_secs = settings.processing_timeout.as_secs(),
                    "Task deadline exceeded, no longer waiting"
                );
                TaskOutcome {
                    success: false,
                    error: Some("processing timeout".to_string()),
                    timeout: true,
                    ..Default::default()
                }
            }
        };

        if let Err(err) = self.report_outcome(&task, outcome).await {
            error!(worker_id, task_id = %task.id, error = %err, "Failed to report task outcome");
        }
    }

    /// Map a dispatch outcome onto queue transitions and library-entry status
    async fn report_outcome(&self, task: &QueueTaskRecord, outcome: TaskOutcome) -> Result<()> {
        if outcome.success {
            let result = serde_json::json!({
                "fileId": outcome.file_id,
                "mediaId": outcome.media_id,
            });
            self.queue.complete_task(task.id, Some(result)).await?;
            self.db
                .library_entries()
                .set_status(&task.file_path, EntryStatus::Processed, outcome.file_id)
                .await?;
            return Ok(());
        }

        let error = outcome.error.as_deref().unwrap_or("unknown error");
        if outcome.non_retryable {
            self.queue.fail_task_permanently(task.id, error).await?;
        } else {
            self.queue.fail_task(task.id, error).await?;
        }
        self.db
            .library_entries()
            .set_status(&task.file_path, EntryStatus::Error, None)
            .await?;
        Ok(())
    }

    async fn cleanup_loop(&self, settings: WorkerSettings, token: CancellationToken) {
        let mut ticker = tokio::time::interval(settings.timeout_cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => break,
            }

            match self
                .queue
                .cleanup_timeout_tasks(settings.processing_timeout)
                .await
            {
                Ok(0) => {}
                Ok(count) => info!(count, "Recovered stuck tasks"),
                Err(err) => error!(error = %err, "Stuck-task sweep failed"),
            }
        }
    }
}
