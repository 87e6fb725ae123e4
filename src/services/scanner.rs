//! Periodic source tree scanner
//!
//! Walks the source tree to a bounded depth, records every newly discovered
//! path as a PENDING library entry and enqueues it for processing. The
//! path-hash dedup in the library entry table makes re-scans idempotent: a
//! path seen before is never enqueued a second time, whatever state its
//! earlier task ended in.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::{Database, EntryType};

use super::queue::QueueService;
use super::special_folder;

/// Scanner knobs, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub source_path: std::path::PathBuf,
    pub max_depth: usize,
    pub video_extensions: Vec<String>,
    pub subtitle_extensions: Vec<String>,
    pub cron: String,
}

impl ScannerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_path: config.source_path.clone(),
            max_depth: config.scan_max_depth,
            video_extensions: config.video_extensions.clone(),
            subtitle_extensions: config.subtitle_extensions.clone(),
            cron: config.scan_cron.clone(),
        }
    }
}

/// What one full scan pass did
#[derive(Debug, Default, Clone)]
pub struct ScanSummary {
    pub seen: usize,
    pub discovered: usize,
    pub enqueued: usize,
}

pub struct Scanner {
    db: Arc<Database>,
    queue: QueueService,
    settings: ScannerSettings,
}

impl Scanner {
    pub fn new(db: Arc<Database>, queue: QueueService, settings: ScannerSettings) -> Self {
        Self {
            db,
            queue,
            settings,
        }
    }

    /// One full scan pass over the source tree
    pub async fn scan(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        let mut discovered: Vec<(String, bool, EntryType)> = Vec::new();

        let mut walker = WalkDir::new(&self.settings.source_path)
            .min_depth(1)
            .max_depth(self.settings.max_depth)
            .into_iter();

        // Manual iteration so a detected disc folder is recorded as one unit
        // and its interior is not walked into
        loop {
            let entry = match walker.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    warn!(error = %err, "Skipping unreadable entry during scan");
                    continue;
                }
            };
            summary.seen += 1;

            if entry.file_type().is_dir() {
                match special_folder::detect_signature(entry.path()) {
                    Ok(Some(folder_type)) => {
                        debug!(
                            path = %entry.path().display(),
                            %folder_type,
                            "Disc folder detected, recording as one unit"
                        );
                        discovered.push((
                            entry.path().to_string_lossy().to_string(),
                            true,
                            EntryType::Folder,
                        ));
                        walker.skip_current_dir();
                    }
                    Ok(None) => {
                        // Multi-content releases (numbered volumes, extras)
                        // also stay whole so the classifier sees the full
                        // folder instead of shredded per-file tasks
                        match special_folder::is_release_folder(entry.path()) {
                            Ok(true) => {
                                debug!(
                                    path = %entry.path().display(),
                                    "Release folder detected, recording as one unit"
                                );
                                discovered.push((
                                    entry.path().to_string_lossy().to_string(),
                                    true,
                                    EntryType::Folder,
                                ));
                                walker.skip_current_dir();
                            }
                            Ok(false) => {}
                            Err(err) => {
                                warn!(path = %entry.path().display(), error = %err, "Release probe failed");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "Signature probe failed");
                    }
                }
                continue;
            }

            let Some(entry_type) = self.classify_extension(entry.path()) else {
                continue;
            };
            discovered.push((
                entry.path().to_string_lossy().to_string(),
                false,
                entry_type,
            ));
        }

        // Dedup against earlier scans, then enqueue whatever is genuinely new
        let entries = self.db.library_entries();
        let mut to_enqueue: Vec<(String, bool)> = Vec::new();
        for (path, is_directory, entry_type) in discovered {
            if entries.get_by_path(&path).await?.is_some() {
                continue;
            }
            entries.insert_pending(&path, entry_type).await?;
            summary.discovered += 1;
            to_enqueue.push((path, is_directory));
        }

        summary.enqueued = self.queue.enqueue_batch(&to_enqueue).await?;

        info!(
            seen = summary.seen,
            discovered = summary.discovered,
            enqueued = summary.enqueued,
            "Scan pass finished"
        );
        Ok(summary)
    }

    fn classify_extension(&self, path: &Path) -> Option<EntryType> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if self.settings.video_extensions.iter().any(|e| e == &ext) {
            Some(EntryType::Video)
        } else if self.settings.subtitle_extensions.iter().any(|e| e == &ext) {
            Some(EntryType::Subtitle)
        } else {
            None
        }
    }

    /// Register the periodic scan on a cron schedule and start the scheduler
    pub async fn start_schedule(self: Arc<Self>) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        let cron = self.settings.cron.clone();
        let scanner = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let scanner = Arc::clone(&scanner);
            Box::pin(async move {
                if let Err(err) = scanner.scan().await {
                    error!(error = %err, "Scheduled scan failed");
                }
            })
        })
        .with_context(|| format!("Invalid scan cron expression: {cron}"))?;

        scheduler.add(job).await.context("Failed to add scan job")?;
        scheduler.start().await.context("Failed to start scheduler")?;

        info!(cron = %self.settings.cron, "Periodic scan scheduled");
        Ok(scheduler)
    }
}
