//! Library entry database repository
//!
//! One row per discovered source path. The `path_hash` column is the dedup
//! key that makes re-scans idempotent: a path that already has an entry is
//! never enqueued a second time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

/// What kind of source path an entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum EntryType {
    Video,
    Subtitle,
    Folder,
}

/// Processing state of a discovered path
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Pending,
    Processed,
    Error,
    Ignored,
}

/// Library entry record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LibraryEntryRecord {
    pub id: Uuid,
    pub path: String,
    pub path_hash: String,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub file_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stable content-hash of a filesystem path, independent of physical identity
pub fn hash_path(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct LibraryEntryRepository {
    pool: SqlitePool,
}

impl LibraryEntryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up an entry by the hash of its path
    pub async fn get_by_path_hash(&self, path_hash: &str) -> Result<Option<LibraryEntryRecord>> {
        let record = sqlx::query_as::<_, LibraryEntryRecord>(
            r#"
            SELECT id, path, path_hash, entry_type, status, file_id, created_at, updated_at
            FROM library_entries
            WHERE path_hash = $1
            "#,
        )
        .bind(path_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Look up an entry by its source path
    pub async fn get_by_path(&self, path: &str) -> Result<Option<LibraryEntryRecord>> {
        self.get_by_path_hash(&hash_path(path)).await
    }

    /// Insert a PENDING entry for a newly discovered path.
    ///
    /// Returns the existing entry unchanged if the path was seen before.
    pub async fn insert_pending(
        &self,
        path: &str,
        entry_type: EntryType,
    ) -> Result<LibraryEntryRecord> {
        let path_hash = hash_path(path);

        if let Some(existing) = self.get_by_path_hash(&path_hash).await? {
            return Ok(existing);
        }

        let record = sqlx::query_as::<_, LibraryEntryRecord>(
            r#"
            INSERT INTO library_entries (id, path, path_hash, entry_type, status, created_at)
            VALUES ($1, $2, $3, $4, 'PENDING', $5)
            RETURNING id, path, path_hash, entry_type, status, file_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(path)
        .bind(&path_hash)
        .bind(entry_type)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Update an entry's status once its task resolves
    pub async fn set_status(
        &self,
        path: &str,
        status: EntryStatus,
        file_id: Option<Uuid>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE library_entries
            SET status = $2, file_id = COALESCE($3, file_id), updated_at = $4
            WHERE path_hash = $1
            "#,
        )
        .bind(hash_path(path))
        .bind(status)
        .bind(file_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Count entries by status
    pub async fn count_by_status(&self, status: EntryStatus) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM library_entries WHERE status = $1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_path_is_stable() {
        let a = hash_path("/media/Show/S01E01.mkv");
        let b = hash_path("/media/Show/S01E01.mkv");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_path_distinguishes_paths() {
        assert_ne!(hash_path("/media/a.mkv"), hash_path("/media/b.mkv"));
    }
}
