//! Filesystem change listener for the source tree
//!
//! Complements the periodic scan with immediate pickup: create and rename
//! events on recognized files (or on directories carrying a disc signature)
//! become PENDING library entries and queued tasks, with the same path-hash
//! dedup the scanner uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Database, EntryType};

use super::queue::QueueService;
use super::special_folder;

/// Watcher knobs, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub source_path: PathBuf,
    pub video_extensions: Vec<String>,
    pub subtitle_extensions: Vec<String>,
}

impl WatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_path: config.source_path.clone(),
            video_extensions: config.video_extensions.clone(),
            subtitle_extensions: config.subtitle_extensions.clone(),
        }
    }
}

pub struct SourceWatcher {
    db: Arc<Database>,
    queue: QueueService,
    settings: WatcherSettings,
    // Dropping the watcher stops event delivery, so it is held for the
    // lifetime of the service
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

impl SourceWatcher {
    pub fn new(db: Arc<Database>, queue: QueueService, settings: WatcherSettings) -> Self {
        Self {
            db,
            queue,
            settings,
            watcher: std::sync::Mutex::new(None),
        }
    }

    /// Begin watching the source tree and processing change events
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        if let Err(err) = event_tx.send(event) {
                            error!(error = %err, "Failed to forward watch event");
                        }
                    }
                }
                Err(err) => error!(error = %err, "Watch error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(&self.settings.source_path, RecursiveMode::Recursive)
            .with_context(|| {
                format!(
                    "Failed to watch source path: {}",
                    self.settings.source_path.display()
                )
            })?;

        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                for path in event.paths {
                    if let Err(err) = service.handle_path(&path).await {
                        warn!(path = %path.display(), error = %err, "Failed to process watch event");
                    }
                }
            }
        });

        *self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(watcher);
        info!(path = %self.settings.source_path.display(), "Watching source tree");
        Ok(())
    }

    async fn handle_path(&self, path: &Path) -> Result<()> {
        let Some((is_directory, entry_type)) = self.classify(path) else {
            return Ok(());
        };

        let path_str = path.to_string_lossy().to_string();
        let entries = self.db.library_entries();
        if entries.get_by_path(&path_str).await?.is_some() {
            return Ok(());
        }

        entries.insert_pending(&path_str, entry_type).await?;
        let task = self.queue.enqueue(&path_str, is_directory, 0).await?;
        debug!(task_id = %task.id, path = %path_str, "Watched path enqueued");
        Ok(())
    }

    /// Relevant paths only: recognized video/subtitle files, and directories
    /// with a disc signature. Other directory events are left to the periodic
    /// scan, which sees the settled state instead of a half-copied tree.
    fn classify(&self, path: &Path) -> Option<(bool, EntryType)> {
        if path.is_dir() {
            return match special_folder::detect_signature(path) {
                Ok(Some(_)) => Some((true, EntryType::Folder)),
                _ => None,
            };
        }

        let ext = path.extension()?.to_str()?.to_lowercase();
        if self.settings.video_extensions.iter().any(|e| e == &ext) {
            Some((false, EntryType::Video))
        } else if self.settings.subtitle_extensions.iter().any(|e| e == &ext) {
            Some((false, EntryType::Subtitle))
        } else {
            None
        }
    }
}
