//! Integration tests for the processing pipeline
//!
//! Exercises the persisted queue lifecycle (claim atomicity, backoff, cancel
//! semantics, stuck-task recovery), the repository gateway's conflict rules,
//! and full dispatch of special folders against a real temp-file SQLite
//! database and temp source/target trees.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use medialinker::db::{Database, EntryType, TaskStatus, UpsertFile};
use medialinker::services::catalog::CatalogService;
use medialinker::services::dispatcher::{DispatcherSettings, TaskDispatcher};
use medialinker::services::error::ProcessingError;
use medialinker::services::hardlink::HardlinkService;
use medialinker::services::identifier::{IdentifiedMedia, Identifier, MediaKind};
use medialinker::services::queue::{QueueService, QueueSettings};
use medialinker::services::scanner::{Scanner, ScannerSettings};
use medialinker::services::special_folder::{
    ContentType, FolderClassifier, SpecialFolderClassification,
};

async fn test_db(dir: &TempDir) -> Database {
    let db = Database::connect(&dir.path().join("test.db"))
        .await
        .expect("connect");
    db.migrate().await.expect("migrate");
    db
}

fn queue_service(db: &Database) -> QueueService {
    QueueService::new(
        db.clone(),
        QueueSettings {
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(300),
            default_max_retries: 3,
            batch_size: 100,
        },
    )
}

/// Make a FAILED task's backoff immediately eligible
async fn expire_backoff(db: &Database, id: Uuid) {
    sqlx::query("UPDATE queue_tasks SET next_retry_at = $1 WHERE id = $2")
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .bind(id)
        .execute(db.pool())
        .await
        .expect("expire backoff");
}

// ============================================================================
// Queue lifecycle
// ============================================================================

#[tokio::test]
async fn test_enqueue_dequeue_complete() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let task = queue.enqueue("/lib/Show/S01E01.mkv", false, 0).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.file_name, "S01E01.mkv");

    let claimed = queue.dequeue().await.unwrap().expect("task claimed");
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.started_at.is_some());

    queue
        .complete_task(task.id, Some(serde_json::json!({"ok": true})))
        .await
        .unwrap();

    let done = db.queue_tasks().get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.last_error.is_none());

    // Nothing left to claim
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_priority_then_age_ordering() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let low = queue.enqueue("/lib/a.mkv", false, 0).await.unwrap();
    let high = queue.enqueue("/lib/b.mkv", false, 10).await.unwrap();

    assert_eq!(queue.dequeue().await.unwrap().unwrap().id, high.id);
    assert_eq!(queue.dequeue().await.unwrap().unwrap().id, low.id);
}

#[tokio::test]
async fn test_failed_task_retries_with_backoff() {
    // Scenario: first failure schedules a retry one base-delay out, and the
    // re-claim carries retry_count = 1
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let task = queue.enqueue("/lib/Show/S01", true, 0).await.unwrap();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.retry_count, 0);

    let before = Utc::now();
    queue.fail_task(task.id, "identification failed").await.unwrap();

    let failed = db.queue_tasks().get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("identification failed"));
    let next_retry_at = failed.next_retry_at.expect("retry scheduled");
    let delay_ms = (next_retry_at - before).num_milliseconds();
    assert!((900..=3000).contains(&delay_ms), "unexpected backoff: {delay_ms}ms");

    // Not eligible until the backoff elapses
    assert!(queue.dequeue().await.unwrap().is_none());

    expire_backoff(&db, task.id).await;
    let reclaimed = queue.dequeue().await.unwrap().expect("retry claimed");
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.retry_count, 1);
    assert_eq!(reclaimed.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_retries_exhaust_to_terminal_failure() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let task = queue.enqueue("/lib/bad.mkv", false, 0).await.unwrap();

    // max_retries = 3: attempts at retry_count 0 and 1 reschedule, the
    // attempt at retry_count 2 is the last one
    for _ in 0..2 {
        queue.dequeue().await.unwrap().expect("claim");
        queue.fail_task(task.id, "transient").await.unwrap();
        expire_backoff(&db, task.id).await;
    }
    let last = queue.dequeue().await.unwrap().expect("final claim");
    assert_eq!(last.retry_count, 2);
    queue.fail_task(task.id, "transient").await.unwrap();

    let dead = db.queue_tasks().get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(dead.status, TaskStatus::Failed);
    assert!(dead.next_retry_at.is_none());
    assert!(dead.completed_at.is_some());
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fail_permanently_skips_backoff() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let task = queue.enqueue("/lib/conflict.mkv", false, 0).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    queue
        .fail_task_permanently(task.id, "link conflict")
        .await
        .unwrap();

    let dead = db.queue_tasks().get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(dead.status, TaskStatus::Failed);
    assert!(dead.next_retry_at.is_none());
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_semantics() {
    // Scenario: cancel succeeds on PENDING, is rejected on COMPLETED, and is
    // an idempotent no-op on an already CANCELED task
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let pending = queue.enqueue("/lib/p.mkv", false, 0).await.unwrap();
    assert!(queue.cancel_task(pending.id).await.unwrap());
    let canceled = db.queue_tasks().get_by_id(pending.id).await.unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(canceled.completed_at.is_some());

    // Idempotent second cancel
    assert!(queue.cancel_task(pending.id).await.unwrap());

    let done = queue.enqueue("/lib/d.mkv", false, 0).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    queue.complete_task(done.id, None).await.unwrap();
    assert!(!queue.cancel_task(done.id).await.unwrap());
    let unchanged = db.queue_tasks().get_by_id(done.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::Completed);

    let running = queue.enqueue("/lib/r.mkv", false, 0).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    assert!(!queue.cancel_task(running.id).await.unwrap());
}

#[tokio::test]
async fn test_no_double_dispatch_under_concurrent_dequeue() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    for i in 0..5 {
        queue.enqueue(&format!("/lib/e{i}.mkv"), false, 0).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..20 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.dequeue().await }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap().unwrap() {
            claimed.push(task.id);
        }
    }

    // Exactly the five tasks, each claimed exactly once
    assert_eq!(claimed.len(), 5);
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn test_timeout_sweep_recovers_stuck_tasks() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    let task = queue.enqueue("/lib/stuck.mkv", false, 0).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();

    // Simulate a worker that died an hour ago
    sqlx::query("UPDATE queue_tasks SET started_at = $1 WHERE id = $2")
        .bind(Utc::now() - chrono::Duration::hours(1))
        .bind(task.id)
        .execute(db.pool())
        .await
        .unwrap();

    let swept = queue
        .cleanup_timeout_tasks(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let failed = db.queue_tasks().get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("processing timeout"));
    assert!(failed.next_retry_at.is_some(), "timeout goes through retry policy");
}

#[tokio::test]
async fn test_failed_task_triage() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let queue = queue_service(&db);

    for i in 0..3 {
        let task = queue.enqueue(&format!("/lib/f{i}.mkv"), false, 0).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        queue.fail_task_permanently(task.id, "bad").await.unwrap();
    }

    assert_eq!(queue.retry_all_failed_tasks().await.unwrap(), 3);
    assert_eq!(db.queue_tasks().count_by_status(TaskStatus::Pending).await.unwrap(), 3);

    for _ in 0..3 {
        let task = queue.dequeue().await.unwrap().unwrap();
        queue.fail_task_permanently(task.id, "still bad").await.unwrap();
    }
    assert_eq!(queue.clear_failed_tasks().await.unwrap(), 3);
    assert_eq!(db.queue_tasks().count_by_status(TaskStatus::Failed).await.unwrap(), 0);
}

// ============================================================================
// Library entries (idempotent re-scan)
// ============================================================================

#[tokio::test]
async fn test_rescan_does_not_duplicate_entries() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir).await;
    let entries = db.library_entries();

    let first = entries
        .insert_pending("/lib/Show/S01E01.mkv", EntryType::Video)
        .await
        .unwrap();
    let second = entries
        .insert_pending("/lib/Show/S01E01.mkv", EntryType::Video)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        entries.count_by_status(medialinker::db::EntryStatus::Pending).await.unwrap(),
        1
    );
}

// ============================================================================
// Repository gateway conflicts
// ============================================================================

fn movie(title: &str) -> IdentifiedMedia {
    IdentifiedMedia {
        external_id: 603,
        kind: MediaKind::Movie,
        title: title.to_string(),
        original_title: None,
        year: Some(1999),
        season: None,
        episode: None,
        episode_title: None,
    }
}

#[tokio::test]
async fn test_media_association_conflict_is_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let catalog = CatalogService::new(Arc::clone(&db));

    let resolved = catalog.resolve(&movie("The Matrix")).await.unwrap();

    let original = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/matrix.mkv".to_string(),
            link_path: "/media/The Matrix/The Matrix.mkv".to_string(),
            device_id: Some(1),
            inode: Some(100),
            file_size: 1,
            media_id: Some(resolved.media.id),
            ..Default::default()
        })
        .await
        .unwrap();

    // A second distinct physical file claiming the same title
    let err = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/matrix-copy.mkv".to_string(),
            link_path: "/media/The Matrix/The Matrix (copy).mkv".to_string(),
            device_id: Some(1),
            inode: Some(200),
            file_size: 1,
            media_id: Some(resolved.media.id),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(err.is_non_retryable());
    assert!(err.to_string().contains(&original.id.to_string()));

    // Original association untouched
    let kept = db.files().get_by_id(original.id).await.unwrap().unwrap();
    assert_eq!(kept.media_id, Some(resolved.media.id));
    assert_eq!(kept.file_path, "/lib/matrix.mkv");
}

#[tokio::test]
async fn test_link_path_conflict_is_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let catalog = CatalogService::new(Arc::clone(&db));

    catalog
        .persist_file(UpsertFile {
            file_path: "/lib/a.mkv".to_string(),
            link_path: "/media/T/T.mkv".to_string(),
            device_id: Some(1),
            inode: Some(1),
            file_size: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    let err = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/b.mkv".to_string(),
            link_path: "/media/T/T.mkv".to_string(),
            device_id: Some(1),
            inode: Some(2),
            file_size: 1,
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(err.is_non_retryable());
    assert!(err.to_string().contains("/lib/a.mkv"));
}

#[tokio::test]
async fn test_same_physical_file_updates_in_place() {
    // Rename on the same filesystem: device+inode match wins over path
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let catalog = CatalogService::new(Arc::clone(&db));

    let original = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/old-name.mkv".to_string(),
            link_path: "/media/T/T.mkv".to_string(),
            device_id: Some(7),
            inode: Some(42),
            file_size: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    let renamed = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/new-name.mkv".to_string(),
            link_path: "/media/T/T.mkv".to_string(),
            device_id: Some(7),
            inode: Some(42),
            file_size: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(renamed.id, original.id);
    assert_eq!(renamed.file_path, "/lib/new-name.mkv");
}

// ============================================================================
// Dispatcher end-to-end
// ============================================================================

struct FixedIdentifier(Option<IdentifiedMedia>);

#[async_trait::async_trait]
impl Identifier for FixedIdentifier {
    async fn identify(
        &self,
        _: &str,
        _: bool,
        _: &Path,
    ) -> Result<Option<IdentifiedMedia>, ProcessingError> {
        Ok(self.0.clone())
    }
}

struct RecordingClassifier {
    called: AtomicBool,
    result: Vec<SpecialFolderClassification>,
}

#[async_trait::async_trait]
impl FolderClassifier for RecordingClassifier {
    async fn classify(
        &self,
        _: &str,
        _: &str,
    ) -> Result<Vec<SpecialFolderClassification>, ProcessingError> {
        self.called.store(true, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

fn content(
    content_type: ContentType,
    sub_folder: Option<&str>,
    disc_number: Option<i64>,
) -> SpecialFolderClassification {
    SpecialFolderClassification {
        folder_type: None,
        title: Some("Akira".to_string()),
        sub_folder_name: sub_folder.map(|s| s.to_string()),
        media_type: Some("movie".to_string()),
        is_multi_disc: disc_number.is_some(),
        disc_number,
        content_type,
        year: Some(1988),
    }
}

fn dispatcher_with(
    db: &Arc<Database>,
    target: &Path,
    identifier: Arc<dyn Identifier>,
    classifier: Arc<dyn FolderClassifier>,
) -> TaskDispatcher {
    TaskDispatcher::new(
        DispatcherSettings {
            target_path: target.to_path_buf(),
            video_extensions: vec!["mkv".to_string(), "m2ts".to_string(), "iso".to_string()],
            subtitle_extensions: vec!["srt".to_string()],
            listing_depth: 3,
        },
        identifier,
        classifier,
        HardlinkService::new(),
        Arc::new(CatalogService::new(Arc::clone(db))),
    )
}

#[tokio::test]
async fn test_dispatch_plain_file() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let source = dir.path().join("src");
    let target = dir.path().join("out");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("akira.mkv"), b"video").unwrap();

    let dispatcher = dispatcher_with(
        &db,
        &target,
        Arc::new(FixedIdentifier(Some(movie("Akira")))),
        Arc::new(RecordingClassifier {
            called: AtomicBool::new(false),
            result: vec![],
        }),
    );

    let path = source.join("akira.mkv").to_string_lossy().to_string();
    queue.enqueue(&path, false, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();

    let outcome = dispatcher.process(&task).await;
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert!(target.join("Akira/Akira.mkv").exists());

    let record = db.files().get_by_id(outcome.file_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.media_id, outcome.media_id);
    assert!(!record.is_special_folder);
}

#[tokio::test]
async fn test_dispatch_unidentified_is_non_retryable() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let source = dir.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("mystery.mkv"), b"").unwrap();

    let dispatcher = dispatcher_with(
        &db,
        &dir.path().join("out"),
        Arc::new(FixedIdentifier(None)),
        Arc::new(RecordingClassifier {
            called: AtomicBool::new(false),
            result: vec![],
        }),
    );

    let path = source.join("mystery.mkv").to_string_lossy().to_string();
    queue.enqueue(&path, false, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();

    let outcome = dispatcher.process(&task).await;
    assert!(!outcome.success);
    assert!(outcome.non_retryable);
    assert!(outcome.error.unwrap().contains("cannot identify"));
}

#[tokio::test]
async fn test_subtitle_rides_along_with_its_video() {
    // A subtitle next to a placed video shares the title association instead
    // of tripping the one-file-per-title rule; a second distinct video for
    // the same title is still rejected
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let source = dir.path().join("src");
    let target = dir.path().join("out");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("akira.mkv"), b"video").unwrap();
    std::fs::write(source.join("akira.srt"), b"subs").unwrap();
    std::fs::write(source.join("akira-copy.mp4"), b"video2").unwrap();

    let dispatcher = dispatcher_with(
        &db,
        &target,
        Arc::new(FixedIdentifier(Some(movie("Akira")))),
        Arc::new(RecordingClassifier {
            called: AtomicBool::new(false),
            result: vec![],
        }),
    );

    let mut outcomes = Vec::new();
    for name in ["akira.mkv", "akira.srt"] {
        let path = source.join(name).to_string_lossy().to_string();
        queue.enqueue(&path, false, 0).await.unwrap();
        let task = queue.dequeue().await.unwrap().unwrap();
        outcomes.push(dispatcher.process(&task).await);
    }

    assert!(outcomes[0].success, "error: {:?}", outcomes[0].error);
    assert!(outcomes[1].success, "error: {:?}", outcomes[1].error);
    assert!(target.join("Akira/Akira.mkv").exists());
    assert!(target.join("Akira/Akira.srt").exists());

    let video = db.files().get_by_id(outcomes[0].file_id.unwrap()).await.unwrap().unwrap();
    let subs = db.files().get_by_id(outcomes[1].file_id.unwrap()).await.unwrap().unwrap();
    assert!(!video.is_sidecar);
    assert!(subs.is_sidecar);
    assert_eq!(subs.media_id, video.media_id);

    // The uniqueness rule still holds for actual videos
    let path = source.join("akira-copy.mp4").to_string_lossy().to_string();
    queue.enqueue(&path, false, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();
    let rejected = dispatcher.process(&task).await;
    assert!(!rejected.success);
    assert!(rejected.non_retryable);
    assert!(rejected.error.unwrap().contains("already associated"));
}

#[tokio::test]
async fn test_iso_folder_is_dispatched_as_special() {
    // A folder holding an .iso payload must take the disc route even though
    // iso is also a recognized video extension (the ordinary-folder check
    // alone would wave it through)
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let folder = dir.path().join("src/AKIRA");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("akira.iso"), b"disc").unwrap();

    let classifier = Arc::new(RecordingClassifier {
        called: AtomicBool::new(false),
        result: vec![],
    });
    let target = dir.path().join("out");
    let dispatcher = dispatcher_with(
        &db,
        &target,
        Arc::new(FixedIdentifier(Some(movie("Akira")))),
        Arc::clone(&classifier) as Arc<dyn FolderClassifier>,
    );

    let path = folder.to_string_lossy().to_string();
    queue.enqueue(&path, true, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();

    let outcome = dispatcher.process(&task).await;
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert!(!classifier.called.load(Ordering::SeqCst), "classifier must not run");
    assert!(target.join("Akira/akira.iso").exists());

    let record = db.files().get_by_id(outcome.file_id.unwrap()).await.unwrap().unwrap();
    assert!(record.is_special_folder);
    assert_eq!(record.folder_type.as_deref(), Some("iso"));
}

#[tokio::test]
async fn test_bdmv_signature_skips_classifier() {
    // Scenario: a BDMV structure is classified by signature alone
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let disc = dir.path().join("src/AKIRA");
    std::fs::create_dir_all(disc.join("BDMV/STREAM")).unwrap();
    std::fs::write(disc.join("BDMV/STREAM/00000.m2ts"), b"video").unwrap();

    let classifier = Arc::new(RecordingClassifier {
        called: AtomicBool::new(false),
        result: vec![],
    });
    let target = dir.path().join("out");
    let dispatcher = dispatcher_with(
        &db,
        &target,
        Arc::new(FixedIdentifier(Some(movie("Akira")))),
        Arc::clone(&classifier) as Arc<dyn FolderClassifier>,
    );

    let path = disc.to_string_lossy().to_string();
    queue.enqueue(&path, true, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();

    let outcome = dispatcher.process(&task).await;
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert!(!classifier.called.load(Ordering::SeqCst), "classifier must not run");
    assert!(target.join("Akira/BDMV/STREAM/00000.m2ts").exists());

    let record = db.files().get_by_id(outcome.file_id.unwrap()).await.unwrap().unwrap();
    assert!(record.is_special_folder);
    assert_eq!(record.folder_type.as_deref(), Some("bdmv"));
}

#[tokio::test]
async fn test_multi_volume_decomposition() {
    // {main Vol.1, main Vol.2, bonus} -> one parent row plus three children,
    // all sharing one media id
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let folder = dir.path().join("src/AKIRA COMPLETE");
    for (sub, file) in [
        ("Vol.1", "v1.mkv"),
        ("Vol.2", "v2.mkv"),
        ("Extras", "making-of.mkv"),
    ] {
        std::fs::create_dir_all(folder.join(sub)).unwrap();
        std::fs::write(folder.join(sub).join(file), b"video").unwrap();
    }

    let classifier = Arc::new(RecordingClassifier {
        called: AtomicBool::new(false),
        result: vec![
            content(ContentType::Main, Some("Vol.1"), Some(1)),
            content(ContentType::Main, Some("Vol.2"), Some(2)),
            content(ContentType::Bonus, Some("Extras"), None),
        ],
    });
    let target = dir.path().join("out");
    let dispatcher = dispatcher_with(
        &db,
        &target,
        Arc::new(FixedIdentifier(Some(movie("Akira")))),
        Arc::clone(&classifier) as Arc<dyn FolderClassifier>,
    );

    let path = folder.to_string_lossy().to_string();
    queue.enqueue(&path, true, 0).await.unwrap();
    let task = queue.dequeue().await.unwrap().unwrap();

    let outcome = dispatcher.process(&task).await;
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert!(classifier.called.load(Ordering::SeqCst));

    assert!(target.join("Akira/Vol.1/v1.mkv").exists());
    assert!(target.join("Akira/Vol.2/v2.mkv").exists());
    assert!(target.join("Akira/Bonus/making-of.mkv").exists());

    let parent = db.files().get_by_id(outcome.file_id.unwrap()).await.unwrap().unwrap();
    assert!(parent.is_parent_folder);
    assert_eq!(parent.media_id, outcome.media_id);

    let children = db.files().list_children(parent.id).await.unwrap();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.media_id, parent.media_id);
        assert_eq!(child.parent_folder_id, Some(parent.id));
        assert!(child.is_special_folder);
    }
    assert_eq!(
        children.iter().filter(|c| c.disc_number.is_some()).count(),
        2
    );
}

#[tokio::test]
async fn test_family_reassociation_cascades() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let catalog = CatalogService::new(Arc::clone(&db));

    let first = catalog.resolve(&movie("Akira")).await.unwrap();
    let (parent, children) = catalog
        .persist_family(
            UpsertFile {
                file_path: "/lib/AKIRA".to_string(),
                link_path: "/media/Akira".to_string(),
                is_directory: true,
                is_special_folder: true,
                is_parent_folder: true,
                media_id: Some(first.media.id),
                ..Default::default()
            },
            vec![
                UpsertFile {
                    file_path: "/lib/AKIRA/Vol.1".to_string(),
                    link_path: "/media/Akira/Vol.1".to_string(),
                    is_directory: true,
                    is_special_folder: true,
                    disc_number: Some(1),
                    ..Default::default()
                },
                UpsertFile {
                    file_path: "/lib/AKIRA/Vol.2".to_string(),
                    link_path: "/media/Akira/Vol.2".to_string(),
                    is_directory: true,
                    is_special_folder: true,
                    disc_number: Some(2),
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(children.len(), 2);

    let second = catalog
        .resolve(&IdentifiedMedia {
            external_id: 999,
            ..movie("Akira (Remaster)")
        })
        .await
        .unwrap();
    // Re-association keyed by any family member resolves the containing
    // parent and moves the whole set
    catalog
        .reassociate_family(children[0].id, Some(second.media.id), None)
        .await
        .unwrap();

    let parent = db.files().get_by_id(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.media_id, Some(second.media.id));
    let children = db.files().list_children(parent.id).await.unwrap();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(child.media_id, Some(second.media.id));
    }
}

// ============================================================================
// Scanner unit-recording
// ============================================================================

#[tokio::test]
async fn test_scan_records_release_folder_as_one_unit() {
    // A multi-volume release must reach the queue as a single directory task
    // so its folder structure survives to classification; a plain show tree
    // is still walked down to its episode files
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let queue = queue_service(&db);

    let source = dir.path().join("src");
    std::fs::create_dir_all(source.join("AKIRA/Vol.1")).unwrap();
    std::fs::create_dir_all(source.join("AKIRA/Vol.2")).unwrap();
    std::fs::write(source.join("AKIRA/Vol.1/v1.mkv"), b"").unwrap();
    std::fs::write(source.join("AKIRA/Vol.2/v2.mkv"), b"").unwrap();
    std::fs::create_dir_all(source.join("Show/Season 1")).unwrap();
    std::fs::write(source.join("Show/Season 1/e01.mkv"), b"").unwrap();

    let scanner = Scanner::new(
        Arc::clone(&db),
        queue.clone(),
        ScannerSettings {
            source_path: source.clone(),
            max_depth: 6,
            video_extensions: vec!["mkv".to_string()],
            subtitle_extensions: vec!["srt".to_string()],
            cron: "0 0 * * * *".to_string(),
        },
    );

    let summary = scanner.scan().await.unwrap();
    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.enqueued, 2);

    let mut claimed = Vec::new();
    while let Some(task) = queue.dequeue().await.unwrap() {
        claimed.push(task);
    }
    assert_eq!(claimed.len(), 2);

    let release = claimed.iter().find(|t| t.is_directory).expect("directory task");
    assert!(release.file_path.ends_with("AKIRA"));

    let episode = claimed.iter().find(|t| !t.is_directory).expect("file task");
    assert!(episode.file_path.ends_with("e01.mkv"));

    // Re-scan discovers nothing new
    let again = scanner.scan().await.unwrap();
    assert_eq!(again.discovered, 0);
    assert_eq!(again.enqueued, 0);
}

#[tokio::test]
async fn test_child_update_moves_whole_family_and_stays_attached() {
    // Re-persisting one volume of a known family with a new title must not
    // detach it from its parent, and must move every sibling with it
    let dir = TempDir::new().unwrap();
    let db = Arc::new(test_db(&dir).await);
    let catalog = CatalogService::new(Arc::clone(&db));

    let first = catalog.resolve(&movie("Akira")).await.unwrap();
    let (parent, children) = catalog
        .persist_family(
            UpsertFile {
                file_path: "/lib/AKIRA".to_string(),
                link_path: "/media/Akira".to_string(),
                is_directory: true,
                is_special_folder: true,
                is_parent_folder: true,
                media_id: Some(first.media.id),
                ..Default::default()
            },
            vec![
                UpsertFile {
                    file_path: "/lib/AKIRA/Vol.1".to_string(),
                    link_path: "/media/Akira/Vol.1".to_string(),
                    is_directory: true,
                    is_special_folder: true,
                    disc_number: Some(1),
                    ..Default::default()
                },
                UpsertFile {
                    file_path: "/lib/AKIRA/Vol.2".to_string(),
                    link_path: "/media/Akira/Vol.2".to_string(),
                    is_directory: true,
                    is_special_folder: true,
                    disc_number: Some(2),
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();

    let second = catalog
        .resolve(&IdentifiedMedia {
            external_id: 999,
            ..movie("Akira (Remaster)")
        })
        .await
        .unwrap();

    // The caller re-found this volume on its own and knows nothing about the
    // family; the stored parent linkage must survive the update
    let updated = catalog
        .persist_file(UpsertFile {
            file_path: "/lib/AKIRA/Vol.1".to_string(),
            link_path: "/media/Akira/Vol.1".to_string(),
            is_directory: true,
            is_special_folder: true,
            disc_number: Some(1),
            media_id: Some(second.media.id),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(updated.id, children[0].id);
    assert_eq!(updated.parent_folder_id, Some(parent.id));

    let parent = db.files().get_by_id(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.media_id, Some(second.media.id));
    let children = db.files().list_children(parent.id).await.unwrap();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(child.media_id, Some(second.media.id));
    }
}
