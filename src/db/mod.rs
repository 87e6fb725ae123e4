//! Database connection and repositories

pub mod files;
pub mod library_entries;
pub mod media;
pub mod queue_tasks;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use files::{FileRecord, FileRepository, UpsertFile};
pub use library_entries::{EntryStatus, EntryType, LibraryEntryRecord, LibraryEntryRepository};
pub use media::{
    EpisodeInfoRecord, MediaRecord, MediaRepository, UpsertEpisodeInfo, UpsertMedia,
};
pub use queue_tasks::{NewQueueTask, QueueTaskRecord, QueueTaskRepository, TaskStatus};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the SQLite database at `path`.
    ///
    /// WAL mode plus a busy timeout so concurrent worker claims serialize on
    /// the store's write lock instead of surfacing SQLITE_BUSY.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::max_connections())
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    fn max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get a queue task repository
    pub fn queue_tasks(&self) -> QueueTaskRepository {
        QueueTaskRepository::new(self.pool.clone())
    }

    /// Get a library entry repository
    pub fn library_entries(&self) -> LibraryEntryRepository {
        LibraryEntryRepository::new(self.pool.clone())
    }

    /// Get a placed-file repository
    pub fn files(&self) -> FileRepository {
        FileRepository::new(self.pool.clone())
    }

    /// Get a title/episode metadata repository
    pub fn media(&self) -> MediaRepository {
        MediaRepository::new(self.pool.clone())
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}
