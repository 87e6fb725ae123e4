//! Placed file database repository
//!
//! One row per materialized hardlink (or disc-folder container). The
//! parent/child pattern models a special folder that decomposes into several
//! contents: the parent row is the container (its link path is the title's
//! base directory, no content of its own), each child row is one volume or
//! bonus entry pointing back via `parent_folder_id`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Placed file record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    pub id: Uuid,
    pub file_path: String,
    pub link_path: String,
    pub device_id: Option<i64>,
    pub inode: Option<i64>,
    pub file_hash: Option<String>,
    pub file_size: i64,
    pub is_directory: bool,
    /// Subtitle (or other companion) file that shares its video's title
    /// association instead of claiming it
    pub is_sidecar: bool,
    pub is_special_folder: bool,
    pub is_parent_folder: bool,
    pub parent_folder_id: Option<Uuid>,
    pub folder_type: Option<String>,
    pub is_multi_disc: bool,
    pub disc_number: Option<i64>,
    pub media_id: Option<Uuid>,
    pub episode_info_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input for creating or updating a placed file
#[derive(Debug, Clone, Default)]
pub struct UpsertFile {
    pub file_path: String,
    pub link_path: String,
    pub device_id: Option<i64>,
    pub inode: Option<i64>,
    pub file_hash: Option<String>,
    pub file_size: i64,
    pub is_directory: bool,
    pub is_sidecar: bool,
    pub is_special_folder: bool,
    pub is_parent_folder: bool,
    pub parent_folder_id: Option<Uuid>,
    pub folder_type: Option<String>,
    pub is_multi_disc: bool,
    pub disc_number: Option<i64>,
    pub media_id: Option<Uuid>,
    pub episode_info_id: Option<Uuid>,
}

const FILE_COLUMNS: &str = "id, file_path, link_path, device_id, inode, file_hash, file_size, \
     is_directory, is_sidecar, is_special_folder, is_parent_folder, parent_folder_id, \
     folder_type, is_multi_disc, disc_number, media_id, episode_info_id, created_at, updated_at";

pub struct FileRepository {
    pool: SqlitePool,
}

impl FileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Look up by physical identity. Survives a rename on the same filesystem.
    pub async fn get_by_device_inode(
        &self,
        device_id: i64,
        inode: i64,
    ) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE device_id = $1 AND inode = $2",
        ))
        .bind(device_id)
        .bind(inode)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_file_path(&self, file_path: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE file_path = $1",
        ))
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Who owns a target link path, if anyone. Used for conflict detection
    /// before any write: a second source must never silently take over an
    /// existing link.
    pub async fn get_by_link_path(&self, link_path: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE link_path = $1",
        ))
        .bind(link_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// A file already associated with this (media, episode) pair, excluding
    /// parent containers (several children legitimately share one title) and
    /// sidecars (a subtitle rides along with its video's association).
    pub async fn get_by_media_association(
        &self,
        media_id: Uuid,
        episode_info_id: Option<Uuid>,
    ) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE media_id = $1
              AND (episode_info_id IS $2)
              AND is_parent_folder = 0
              AND parent_folder_id IS NULL
              AND is_sidecar = 0
            "#,
        ))
        .bind(media_id)
        .bind(episode_info_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Insert a new row
    pub async fn insert(&self, input: &UpsertFile) -> Result<FileRecord> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            r#"
            INSERT INTO files (id, file_path, link_path, device_id, inode, file_hash, file_size,
                               is_directory, is_sidecar, is_special_folder, is_parent_folder,
                               parent_folder_id, folder_type, is_multi_disc, disc_number, media_id,
                               episode_info_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {FILE_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(&input.file_path)
        .bind(&input.link_path)
        .bind(input.device_id)
        .bind(input.inode)
        .bind(&input.file_hash)
        .bind(input.file_size)
        .bind(input.is_directory)
        .bind(input.is_sidecar)
        .bind(input.is_special_folder)
        .bind(input.is_parent_folder)
        .bind(input.parent_folder_id)
        .bind(&input.folder_type)
        .bind(input.is_multi_disc)
        .bind(input.disc_number)
        .bind(input.media_id)
        .bind(input.episode_info_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Update an existing row in place (same identity, possibly renamed path)
    pub async fn update(&self, id: Uuid, input: &UpsertFile) -> Result<FileRecord> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            r#"
            UPDATE files
            SET file_path = $2, link_path = $3, device_id = $4, inode = $5, file_hash = $6,
                file_size = $7, is_directory = $8, is_sidecar = $9, is_special_folder = $10,
                is_parent_folder = $11, parent_folder_id = $12, folder_type = $13,
                is_multi_disc = $14, disc_number = $15, media_id = $16, episode_info_id = $17,
                updated_at = $18
            WHERE id = $1
            RETURNING {FILE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(&input.file_path)
        .bind(&input.link_path)
        .bind(input.device_id)
        .bind(input.inode)
        .bind(&input.file_hash)
        .bind(input.file_size)
        .bind(input.is_directory)
        .bind(input.is_sidecar)
        .bind(input.is_special_folder)
        .bind(input.is_parent_folder)
        .bind(input.parent_folder_id)
        .bind(&input.folder_type)
        .bind(input.is_multi_disc)
        .bind(input.disc_number)
        .bind(input.media_id)
        .bind(input.episode_info_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// All children of a parent container row
    pub async fn list_children(&self, parent_id: Uuid) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE parent_folder_id = $1 ORDER BY disc_number, link_path",
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Re-associate a parent container and all of its children with a title in
    /// one transaction. Siblings must never end up pointing at different
    /// titles, so the update always covers the whole set {parent, children}.
    pub async fn set_media_for_family(
        &self,
        parent_id: Uuid,
        media_id: Option<Uuid>,
        episode_info_id: Option<Uuid>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut rows = sqlx::query(
            "UPDATE files SET media_id = $2, episode_info_id = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(parent_id)
        .bind(media_id)
        .bind(episode_info_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        rows += sqlx::query(
            "UPDATE files SET media_id = $2, episode_info_id = $3, updated_at = $4 WHERE parent_folder_id = $1",
        )
        .bind(parent_id)
        .bind(media_id)
        .bind(episode_info_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(rows)
    }
}
