//! Title and episode metadata repository
//!
//! Canonical metadata resolved from the external catalog. A title is created
//! once per (external id, type) and updated in place on re-resolution; an
//! episode is additionally keyed by season + episode number within its title.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Title record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaRecord {
    pub id: Uuid,
    pub external_id: i64,
    pub media_type: String,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Episode record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EpisodeInfoRecord {
    pub id: Uuid,
    pub media_id: Uuid,
    pub season: i64,
    pub episode: i64,
    pub title: Option<String>,
    pub air_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input for upserting a title
#[derive(Debug, Clone)]
pub struct UpsertMedia {
    pub external_id: i64,
    pub media_type: String,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i64>,
}

/// Input for upserting an episode
#[derive(Debug, Clone)]
pub struct UpsertEpisodeInfo {
    pub media_id: Uuid,
    pub season: i64,
    pub episode: i64,
    pub title: Option<String>,
    pub air_date: Option<String>,
}

pub struct MediaRepository {
    pool: SqlitePool,
}

impl MediaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a title by its internal id
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<MediaRecord>> {
        let record = sqlx::query_as::<_, MediaRecord>(
            r#"
            SELECT id, external_id, media_type, title, original_title, year,
                   created_at, updated_at
            FROM media
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Idempotent upsert keyed by (external_id, media_type).
    ///
    /// Re-resolution updates the stored metadata in place, never duplicates.
    pub async fn upsert(&self, input: UpsertMedia) -> Result<MediaRecord> {
        let record = sqlx::query_as::<_, MediaRecord>(
            r#"
            INSERT INTO media (id, external_id, media_type, title, original_title, year, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id, media_type) DO UPDATE
            SET title = excluded.title,
                original_title = excluded.original_title,
                year = excluded.year,
                updated_at = $7
            RETURNING id, external_id, media_type, title, original_title, year,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.external_id)
        .bind(&input.media_type)
        .bind(&input.title)
        .bind(&input.original_title)
        .bind(input.year)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Idempotent episode upsert keyed by (media_id, season, episode)
    pub async fn upsert_episode(&self, input: UpsertEpisodeInfo) -> Result<EpisodeInfoRecord> {
        let record = sqlx::query_as::<_, EpisodeInfoRecord>(
            r#"
            INSERT INTO episode_info (id, media_id, season, episode, title, air_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (media_id, season, episode) DO UPDATE
            SET title = COALESCE(excluded.title, episode_info.title),
                air_date = COALESCE(excluded.air_date, episode_info.air_date),
                updated_at = $7
            RETURNING id, media_id, season, episode, title, air_date, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.media_id)
        .bind(input.season)
        .bind(input.episode)
        .bind(&input.title)
        .bind(&input.air_date)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }
}
