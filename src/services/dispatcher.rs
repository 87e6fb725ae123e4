//! Per-task classification and routing
//!
//! Turns one claimed queue task into filesystem and store side effects:
//! ordinary files and season-style folders are identified and hardlinked to a
//! normalized target path; special disc folders are decomposed into contents
//! and mirrored with parent/child bookkeeping. No error ever escapes
//! [`TaskDispatcher::process`]: every branch resolves to a [`TaskOutcome`]
//! consumed by the worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{QueueTaskRecord, UpsertFile};

use super::catalog::{CatalogService, ResolvedMedia};
use super::error::ProcessingError;
use super::hardlink::HardlinkService;
use super::identifier::{IdentifiedMedia, Identifier};
use super::special_folder::{
    self, content_sub_path, ContentType, FolderClassifier, FolderType,
    SpecialFolderClassification,
};

/// Uniform processing result reported to the worker pool
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub file_id: Option<Uuid>,
    pub media_id: Option<Uuid>,
    pub error: Option<String>,
    pub non_retryable: bool,
    pub timeout: bool,
}

impl TaskOutcome {
    pub fn ok(file_id: Option<Uuid>, media_id: Option<Uuid>) -> Self {
        Self {
            success: true,
            file_id,
            media_id,
            ..Default::default()
        }
    }

    pub fn from_error(err: &ProcessingError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            non_retryable: err.is_non_retryable(),
            timeout: err.is_timeout(),
            ..Default::default()
        }
    }
}

/// Dispatcher knobs, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub target_path: PathBuf,
    pub video_extensions: Vec<String>,
    pub subtitle_extensions: Vec<String>,
    pub listing_depth: usize,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_path: config.target_path.clone(),
            video_extensions: config.video_extensions.clone(),
            subtitle_extensions: config.subtitle_extensions.clone(),
            listing_depth: config.scan_max_depth.min(4),
        }
    }

    fn is_video_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.video_extensions.iter().any(|e| e == &ext)
    }

    fn is_subtitle_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.subtitle_extensions.iter().any(|e| e == &ext)
    }
}

pub struct TaskDispatcher {
    settings: DispatcherSettings,
    identifier: Arc<dyn Identifier>,
    classifier: Arc<dyn FolderClassifier>,
    hardlinks: HardlinkService,
    catalog: Arc<CatalogService>,
}

impl TaskDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        identifier: Arc<dyn Identifier>,
        classifier: Arc<dyn FolderClassifier>,
        hardlinks: HardlinkService,
        catalog: Arc<CatalogService>,
    ) -> Self {
        Self {
            settings,
            identifier,
            classifier,
            hardlinks,
            catalog,
        }
    }

    /// Process one claimed task. Never returns an error; every failure is
    /// folded into the outcome.
    pub async fn process(&self, task: &QueueTaskRecord) -> TaskOutcome {
        match self.run(task).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    task_id = %task.id,
                    path = %task.file_path,
                    error = %err,
                    non_retryable = err.is_non_retryable(),
                    "Task processing failed"
                );
                TaskOutcome::from_error(&err)
            }
        }
    }

    async fn run(&self, task: &QueueTaskRecord) -> Result<TaskOutcome, ProcessingError> {
        let path = Path::new(&task.file_path);
        if !path.exists() {
            return Err(ProcessingError::non_retryable(format!(
                "source path no longer exists: {}",
                task.file_path
            )));
        }

        if task.is_directory {
            // A structural disc signature wins outright: a BDMV/VIDEO_TS tree
            // or an .iso payload is never an ordinary season folder, whatever
            // its file extensions look like
            let signature = special_folder::detect_signature(path)
                .map_err(|e| ProcessingError::retryable(format!("signature probe failed: {e}")))?;
            if signature.is_some() || !is_ordinary_folder(path, &self.settings)? {
                return self.process_special_folder(task, path, signature).await;
            }
        }

        self.process_plain(task, path).await
    }

    /// Plain file, or a directory confirmed ordinary (season-style folder)
    async fn process_plain(
        &self,
        task: &QueueTaskRecord,
        path: &Path,
    ) -> Result<TaskOutcome, ProcessingError> {
        let identified = self
            .identifier
            .identify(&task.file_name, task.is_directory, path)
            .await?
            .ok_or_else(|| {
                ProcessingError::non_retryable(format!("cannot identify: {}", task.file_name))
            })?;

        let resolved = self.catalog.resolve(&identified).await?;
        let link_path = self.build_target_path(&identified, path, task.is_directory);

        let is_sidecar = !task.is_directory
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.settings.is_subtitle_extension(ext));

        if task.is_directory {
            self.hardlinks
                .create_hardlink_recursively(path, &link_path)
                .map_err(map_hardlink_error)?;
        } else {
            self.hardlinks
                .create_hardlink(path, &link_path)
                .map_err(map_hardlink_error)?;
        }

        let record = self
            .catalog
            .persist_file(UpsertFile {
                file_path: task.file_path.clone(),
                link_path: link_path.to_string_lossy().to_string(),
                media_id: Some(resolved.media.id),
                episode_info_id: resolved.episode.as_ref().map(|e| e.id),
                is_directory: task.is_directory,
                is_sidecar,
                ..stat_upsert(path)?
            })
            .await?;

        info!(
            task_id = %task.id,
            file_id = %record.id,
            title = %resolved.media.title,
            link = %record.link_path,
            "Placed item"
        );
        Ok(TaskOutcome::ok(Some(record.id), Some(resolved.media.id)))
    }

    /// Disc-image or multi-content folder
    async fn process_special_folder(
        &self,
        task: &QueueTaskRecord,
        path: &Path,
        signature: Option<FolderType>,
    ) -> Result<TaskOutcome, ProcessingError> {
        // Disc signature short-circuits the classifier: the whole folder is a
        // single main content
        let contents = match signature {
            Some(folder_type) => vec![SpecialFolderClassification {
                folder_type: Some(folder_type),
                title: None,
                sub_folder_name: None,
                media_type: None,
                is_multi_disc: false,
                disc_number: None,
                content_type: ContentType::Main,
                year: None,
            }],
            None => {
                let listing = special_folder::build_listing(path, self.settings.listing_depth);
                self.classifier.classify(&task.file_name, &listing).await?
            }
        };

        // One title per scanned folder; prefer the classifier's title for the
        // first main content, fall back to the folder name
        let identify_name = contents
            .iter()
            .find(|c| c.content_type == ContentType::Main)
            .and_then(|c| c.title.clone())
            .unwrap_or_else(|| task.file_name.clone());

        let identified = self
            .identifier
            .identify(&identify_name, true, path)
            .await?
            .ok_or_else(|| {
                ProcessingError::non_retryable(format!("cannot identify: {identify_name}"))
            })?;
        let resolved = self.catalog.resolve(&identified).await?;
        let title_dir = self
            .settings
            .target_path
            .join(sanitize_filename::sanitize(&identified.title));

        if contents.len() == 1 {
            return self
                .place_single_content(task, path, &contents[0], signature, &resolved, &title_dir)
                .await;
        }

        self.place_content_family(task, path, &contents, signature, &resolved, &title_dir)
            .await
    }

    /// One content entry: a single file row, no parent container
    async fn place_single_content(
        &self,
        task: &QueueTaskRecord,
        path: &Path,
        content: &SpecialFolderClassification,
        signature: Option<FolderType>,
        resolved: &ResolvedMedia,
        title_dir: &Path,
    ) -> Result<TaskOutcome, ProcessingError> {
        let source = self.resolve_content_source(path, content)?.ok_or_else(|| {
            ProcessingError::non_retryable(format!(
                "classified sub-folder not found under {}",
                task.file_path
            ))
        })?;
        let link_dir = match content_sub_path(
            content.content_type,
            content.is_multi_disc,
            content.disc_number,
        ) {
            Some(sub) => title_dir.join(sub),
            None => title_dir.to_path_buf(),
        };

        self.hardlinks
            .create_hardlink_recursively(&source, &link_dir)
            .map_err(map_hardlink_error)?;

        let record = self
            .catalog
            .persist_file(UpsertFile {
                file_path: task.file_path.clone(),
                link_path: link_dir.to_string_lossy().to_string(),
                is_directory: true,
                is_special_folder: true,
                folder_type: signature.or(content.folder_type).map(|t| t.to_string()),
                is_multi_disc: content.is_multi_disc,
                disc_number: content.disc_number,
                media_id: Some(resolved.media.id),
                episode_info_id: resolved.episode.as_ref().map(|e| e.id),
                ..stat_upsert(path)?
            })
            .await?;

        info!(
            task_id = %task.id,
            file_id = %record.id,
            title = %resolved.media.title,
            folder_type = ?record.folder_type,
            "Placed special folder"
        );
        Ok(TaskOutcome::ok(Some(record.id), Some(resolved.media.id)))
    }

    /// Several content entries: one parent container row plus one child per
    /// placed content, all sharing the title association
    async fn place_content_family(
        &self,
        task: &QueueTaskRecord,
        path: &Path,
        contents: &[SpecialFolderClassification],
        signature: Option<FolderType>,
        resolved: &ResolvedMedia,
        title_dir: &Path,
    ) -> Result<TaskOutcome, ProcessingError> {
        let mut children = Vec::new();
        let mut main_ordinal = 0i64;

        for content in contents {
            let Some(source) = self.resolve_content_source(path, content)? else {
                warn!(
                    folder = %task.file_path,
                    sub_folder = ?content.sub_folder_name,
                    "Classified sub-folder has no matching child, skipping entry"
                );
                continue;
            };

            // Siblings need distinct link paths; a main content in a family is
            // always volume-suffixed even when the classifier did not flag it
            // multi-disc
            let (is_multi_disc, disc_number) = match content.content_type {
                ContentType::Main => {
                    main_ordinal += 1;
                    (true, Some(content.disc_number.unwrap_or(main_ordinal)))
                }
                _ => (content.is_multi_disc, content.disc_number),
            };
            let sub = content_sub_path(content.content_type, is_multi_disc, disc_number)
                .unwrap_or_else(|| "Other".to_string());
            let link_dir = title_dir.join(sub);

            self.hardlinks
                .create_hardlink_recursively(&source, &link_dir)
                .map_err(map_hardlink_error)?;

            children.push(UpsertFile {
                file_path: source.to_string_lossy().to_string(),
                link_path: link_dir.to_string_lossy().to_string(),
                is_directory: true,
                is_special_folder: true,
                folder_type: signature.or(content.folder_type).map(|t| t.to_string()),
                is_multi_disc,
                disc_number,
                ..stat_upsert(&source)?
            });
        }

        if children.is_empty() {
            return Err(ProcessingError::non_retryable(format!(
                "no classified content could be resolved under {}",
                task.file_path
            )));
        }

        let parent = UpsertFile {
            file_path: task.file_path.clone(),
            link_path: title_dir.to_string_lossy().to_string(),
            is_directory: true,
            is_special_folder: true,
            is_parent_folder: true,
            folder_type: signature.map(|t| t.to_string()),
            media_id: Some(resolved.media.id),
            episode_info_id: resolved.episode.as_ref().map(|e| e.id),
            ..stat_upsert(path)?
        };

        let child_count = children.len();
        let (parent_record, _) = self.catalog.persist_family(parent, children).await?;

        info!(
            task_id = %task.id,
            parent_id = %parent_record.id,
            title = %resolved.media.title,
            children = child_count,
            "Placed special folder family"
        );
        Ok(TaskOutcome::ok(
            Some(parent_record.id),
            Some(resolved.media.id),
        ))
    }

    fn resolve_content_source(
        &self,
        folder: &Path,
        content: &SpecialFolderClassification,
    ) -> Result<Option<PathBuf>, ProcessingError> {
        match content.sub_folder_name.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => special_folder::resolve_sub_folder(folder, name)
                .map_err(|e| ProcessingError::retryable(format!("sub-folder lookup failed: {e}"))),
            None => Ok(Some(folder.to_path_buf())),
        }
    }

    /// Normalized target path for an identified item:
    /// - movie file: `{target}/{title}/{title}.{ext}`
    /// - episode file: `{target}/{title}/Season {N}/{title} SxxEyy {episode title}.{ext}`
    /// - directory: the title directory (or its season directory)
    fn build_target_path(
        &self,
        identified: &IdentifiedMedia,
        source: &Path,
        is_directory: bool,
    ) -> PathBuf {
        let title = sanitize_filename::sanitize(&identified.title);
        let title_dir = self.settings.target_path.join(&title);

        let season_dir = identified
            .season
            .map(|season| title_dir.join(format!("Season {season}")));

        if is_directory {
            return season_dir.unwrap_or(title_dir);
        }

        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv")
            .to_lowercase();

        match (season_dir, identified.episode) {
            (Some(dir), Some(episode)) => {
                let season = identified.season.unwrap_or(1);
                let mut name = format!("{title} S{season:02}E{episode:02}");
                if let Some(episode_title) = identified
                    .episode_title
                    .as_deref()
                    .filter(|t| !t.is_empty())
                {
                    name.push(' ');
                    name.push_str(&sanitize_filename::sanitize(episode_title));
                }
                dir.join(format!("{name}.{ext}"))
            }
            _ => title_dir.join(format!("{title}.{ext}")),
        }
    }
}

/// A folder with files, zero sub-directories, and nothing but recognized
/// video extensions is an ordinary season-style folder, not a special one
fn is_ordinary_folder(path: &Path, settings: &DispatcherSettings) -> Result<bool, ProcessingError> {
    let mut file_count = 0usize;

    let entries = std::fs::read_dir(path)
        .map_err(|e| ProcessingError::retryable(format!("cannot list {}: {e}", path.display())))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| ProcessingError::retryable(format!("cannot read entry: {e}")))?;
        let file_type = entry
            .file_type()
            .map_err(|e| ProcessingError::retryable(format!("cannot stat entry: {e}")))?;

        if file_type.is_dir() {
            return Ok(false);
        }

        file_count += 1;
        let name = entry.file_name();
        let ext = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !settings.is_video_extension(ext) {
            return Ok(false);
        }
    }

    Ok(file_count > 0)
}

/// Physical identity and size fields for an upsert, from a stat call
fn stat_upsert(path: &Path) -> Result<UpsertFile, ProcessingError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ProcessingError::retryable(format!("cannot stat {}: {e}", path.display())))?;

    #[cfg(unix)]
    let (device_id, inode) = {
        use std::os::unix::fs::MetadataExt;
        (Some(metadata.dev() as i64), Some(metadata.ino() as i64))
    };
    #[cfg(not(unix))]
    let (device_id, inode) = (None, None);

    Ok(UpsertFile {
        device_id,
        inode,
        file_size: if metadata.is_file() {
            metadata.len() as i64
        } else {
            0
        },
        ..Default::default()
    })
}

fn map_hardlink_error(err: super::hardlink::HardlinkError) -> ProcessingError {
    if err.is_non_retryable() {
        ProcessingError::non_retryable(err.to_string())
    } else {
        ProcessingError::retryable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identifier::MediaKind;
    use tempfile::tempdir;

    fn settings(target: &Path) -> DispatcherSettings {
        DispatcherSettings {
            target_path: target.to_path_buf(),
            video_extensions: vec!["mkv".to_string(), "mp4".to_string()],
            subtitle_extensions: vec!["srt".to_string(), "ass".to_string()],
            listing_depth: 3,
        }
    }

    fn identified(title: &str, season: Option<i64>, episode: Option<i64>) -> IdentifiedMedia {
        IdentifiedMedia {
            external_id: 42,
            kind: if season.is_some() {
                MediaKind::Tv
            } else {
                MediaKind::Movie
            },
            title: title.to_string(),
            original_title: None,
            year: None,
            season,
            episode,
            episode_title: None,
        }
    }

    fn dispatcher_for_paths(target: &Path) -> TaskDispatcher {
        struct NoIdentify;
        #[async_trait::async_trait]
        impl Identifier for NoIdentify {
            async fn identify(
                &self,
                _: &str,
                _: bool,
                _: &Path,
            ) -> Result<Option<IdentifiedMedia>, ProcessingError> {
                Ok(None)
            }
        }
        struct NoClassify;
        #[async_trait::async_trait]
        impl FolderClassifier for NoClassify {
            async fn classify(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Vec<SpecialFolderClassification>, ProcessingError> {
                Err(ProcessingError::retryable("unused"))
            }
        }

        // Catalog is unused by the path-building tests; an unreachable pool
        // keeps construction simple
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        TaskDispatcher::new(
            settings(target),
            Arc::new(NoIdentify),
            Arc::new(NoClassify),
            HardlinkService::new(),
            Arc::new(CatalogService::new(Arc::new(crate::db::Database::new(pool)))),
        )
    }

    #[tokio::test]
    async fn test_movie_target_path() {
        let dir = tempdir().unwrap();
        let dispatcher = dispatcher_for_paths(dir.path());

        let path = dispatcher.build_target_path(
            &identified("Perfect Blue", None, None),
            Path::new("/lib/Perfect.Blue.1997.mkv"),
            false,
        );
        assert_eq!(path, dir.path().join("Perfect Blue/Perfect Blue.mkv"));
    }

    #[tokio::test]
    async fn test_episode_target_path() {
        let dir = tempdir().unwrap();
        let dispatcher = dispatcher_for_paths(dir.path());

        let mut media = identified("Severance", Some(2), Some(3));
        media.episode_title = Some("Hide and Seek".to_string());
        let path = dispatcher.build_target_path(
            &media,
            Path::new("/lib/Severance.S02E03.mkv"),
            false,
        );
        assert_eq!(
            path,
            dir.path()
                .join("Severance/Season 2/Severance S02E03 Hide and Seek.mkv")
        );
    }

    #[tokio::test]
    async fn test_directory_target_is_title_dir() {
        let dir = tempdir().unwrap();
        let dispatcher = dispatcher_for_paths(dir.path());

        let path = dispatcher.build_target_path(
            &identified("Frieren", Some(1), None),
            Path::new("/lib/Frieren S01"),
            true,
        );
        assert_eq!(path, dir.path().join("Frieren/Season 1"));
    }

    #[test]
    fn test_ordinary_folder_heuristic() {
        let dir = tempdir().unwrap();
        let s = settings(Path::new("/tmp/out"));

        // Video files only, no subdirs: ordinary
        std::fs::write(dir.path().join("e01.mkv"), b"").unwrap();
        std::fs::write(dir.path().join("e02.mp4"), b"").unwrap();
        assert!(is_ordinary_folder(dir.path(), &s).unwrap());

        // A non-video file makes it ambiguous
        std::fs::write(dir.path().join("extras.iso"), b"").unwrap();
        assert!(!is_ordinary_folder(dir.path(), &s).unwrap());
    }

    #[test]
    fn test_folder_with_subdir_is_not_ordinary() {
        let dir = tempdir().unwrap();
        let s = settings(Path::new("/tmp/out"));
        std::fs::write(dir.path().join("e01.mkv"), b"").unwrap();
        std::fs::create_dir(dir.path().join("Extras")).unwrap();
        assert!(!is_ordinary_folder(dir.path(), &s).unwrap());
    }

    #[test]
    fn test_empty_folder_is_not_ordinary() {
        let dir = tempdir().unwrap();
        let s = settings(Path::new("/tmp/out"));
        assert!(!is_ordinary_folder(dir.path(), &s).unwrap());
    }
}
