//! Repository gateway between processing and the metadata store
//!
//! All writes from the pipeline funnel through here so the identity and
//! conflict rules live in one place:
//! - a physical file (device + inode) keeps its row across renames
//! - a link path has exactly one owner
//! - a (title, episode) pair maps to one standalone file; only siblings under
//!   one parent container may share an association

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{
    Database, EpisodeInfoRecord, FileRecord, MediaRecord, UpsertEpisodeInfo, UpsertFile,
    UpsertMedia,
};

use super::error::ProcessingError;
use super::identifier::IdentifiedMedia;

/// Resolved metadata handles for one identification
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub media: MediaRecord,
    pub episode: Option<EpisodeInfoRecord>,
}

pub struct CatalogService {
    db: Arc<Database>,
}

impl CatalogService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert title (and episode, for episodic content) metadata.
    ///
    /// Keyed by external id, so re-identifying the same title refreshes the
    /// stored row instead of duplicating it.
    pub async fn resolve(&self, identified: &IdentifiedMedia) -> Result<ResolvedMedia> {
        let media = self
            .db
            .media()
            .upsert(UpsertMedia {
                external_id: identified.external_id,
                media_type: identified.kind.as_str().to_string(),
                title: identified.title.clone(),
                original_title: identified.original_title.clone(),
                year: identified.year,
            })
            .await
            .context("Failed to upsert media metadata")?;

        let episode = match (identified.season, identified.episode) {
            (Some(season), Some(episode)) => Some(
                self.db
                    .media()
                    .upsert_episode(UpsertEpisodeInfo {
                        media_id: media.id,
                        season,
                        episode,
                        title: identified.episode_title.clone(),
                        air_date: None,
                    })
                    .await
                    .context("Failed to upsert episode metadata")?,
            ),
            _ => None,
        };

        debug!(
            media_id = %media.id,
            title = %media.title,
            episode = episode.as_ref().map(|e| format!("S{:02}E{:02}", e.season, e.episode)),
            "Resolved media metadata"
        );

        Ok(ResolvedMedia { media, episode })
    }

    /// Persist a standalone placed file, enforcing identity and conflict
    /// rules. Returns the stored row.
    ///
    /// Identity resolution order: device + inode (survives renames), then
    /// source path. A link path owned by a different physical file, or a
    /// (title, episode) pair already claimed by another file, is rejected as
    /// non-retryable with the conflicting record named.
    pub async fn persist_file(&self, input: UpsertFile) -> Result<FileRecord, ProcessingError> {
        let files = self.db.files();

        let existing = match (input.device_id, input.inode) {
            (Some(device_id), Some(inode)) => files
                .get_by_device_inode(device_id, inode)
                .await
                .map_err(ProcessingError::from)?,
            _ => None,
        };
        let existing = match existing {
            Some(record) => Some(record),
            None => files
                .get_by_file_path(&input.file_path)
                .await
                .map_err(ProcessingError::from)?,
        };

        // A caller that found this file on its own (re-scan, rename) may not
        // know it belongs to a family; keep the stored parent linkage rather
        // than overwriting it with unset fields
        let mut input = input;
        if let Some(old) = &existing {
            if input.parent_folder_id.is_none() {
                input.parent_folder_id = old.parent_folder_id;
            }
            if old.is_parent_folder {
                input.is_parent_folder = true;
            }
        }

        // Link path ownership: never silently take over someone else's link
        if let Some(owner) = files
            .get_by_link_path(&input.link_path)
            .await
            .map_err(ProcessingError::from)?
        {
            let same_row = existing.as_ref().map(|e| e.id) == Some(owner.id);
            if !same_row {
                warn!(
                    link_path = %input.link_path,
                    owner_source = %owner.file_path,
                    new_source = %input.file_path,
                    "Link path already owned by a different file"
                );
                return Err(ProcessingError::non_retryable(format!(
                    "link path {} is already owned by file {} ({})",
                    input.link_path, owner.id, owner.file_path
                )));
            }
        }

        // Association uniqueness for standalone files; children of a parent
        // container are exempt and checked at the family level instead, and a
        // sidecar shares its video's title by definition
        if !input.is_parent_folder && input.parent_folder_id.is_none() && !input.is_sidecar {
            if let Some(media_id) = input.media_id {
                if let Some(claimed) = files
                    .get_by_media_association(media_id, input.episode_info_id)
                    .await
                    .map_err(ProcessingError::from)?
                {
                    let same_row = existing.as_ref().map(|e| e.id) == Some(claimed.id);
                    if !same_row {
                        return Err(ProcessingError::non_retryable(format!(
                            "media {} is already associated with file {} ({})",
                            media_id, claimed.id, claimed.file_path
                        )));
                    }
                }
            }
        }

        let record = match existing {
            Some(old) => {
                let record = files
                    .update(old.id, &input)
                    .await
                    .map_err(ProcessingError::from)?;
                // Re-identifying one family member moves the whole family:
                // siblings must never point at different titles
                let association_changed = old.media_id != input.media_id
                    || old.episode_info_id != input.episode_info_id;
                let family_root = if record.is_parent_folder {
                    Some(record.id)
                } else {
                    record.parent_folder_id
                };
                if association_changed {
                    if let Some(root) = family_root {
                        files
                            .set_media_for_family(root, input.media_id, input.episode_info_id)
                            .await
                            .map_err(ProcessingError::from)?;
                    }
                }
                info!(
                    file_id = %record.id,
                    file_path = %record.file_path,
                    "Updated placed file in place"
                );
                record
            }
            None => {
                let record = files.insert(&input).await.map_err(ProcessingError::from)?;
                info!(
                    file_id = %record.id,
                    file_path = %record.file_path,
                    link_path = %record.link_path,
                    "Recorded placed file"
                );
                record
            }
        };

        Ok(record)
    }

    /// Persist a decomposed special folder: one parent container row plus one
    /// child row per content entry, all associated with the same title.
    ///
    /// The parent is identified by its source path; re-processing an already
    /// known container updates the parent and re-associates the whole family
    /// atomically so siblings never diverge.
    pub async fn persist_family(
        &self,
        parent: UpsertFile,
        children: Vec<UpsertFile>,
    ) -> Result<(FileRecord, Vec<FileRecord>), ProcessingError> {
        let files = self.db.files();

        let parent_record = match files
            .get_by_file_path(&parent.file_path)
            .await
            .map_err(ProcessingError::from)?
        {
            Some(old) => {
                let record = files
                    .update(old.id, &parent)
                    .await
                    .map_err(ProcessingError::from)?;
                files
                    .set_media_for_family(record.id, parent.media_id, parent.episode_info_id)
                    .await
                    .map_err(ProcessingError::from)?;
                record
            }
            None => files.insert(&parent).await.map_err(ProcessingError::from)?,
        };

        let mut child_records = Vec::with_capacity(children.len());
        for mut child in children {
            child.parent_folder_id = Some(parent_record.id);
            child.media_id = parent.media_id;
            child.episode_info_id = parent.episode_info_id;
            child_records.push(self.persist_file(child).await?);
        }

        info!(
            parent_id = %parent_record.id,
            children = child_records.len(),
            "Recorded special folder family"
        );

        Ok((parent_record, child_records))
    }

    /// Move an already placed family onto a different title, cascading the
    /// association to every member so the set stays consistent. Accepts any
    /// family member's id and resolves the containing parent itself.
    pub async fn reassociate_family(
        &self,
        member_id: Uuid,
        media_id: Option<Uuid>,
        episode_info_id: Option<Uuid>,
    ) -> Result<u64> {
        let files = self.db.files();
        let member = files
            .get_by_id(member_id)
            .await?
            .with_context(|| format!("file {member_id} not found"))?;
        let parent_id = if member.is_parent_folder {
            member.id
        } else {
            member.parent_folder_id.unwrap_or(member.id)
        };
        let rows = files
            .set_media_for_family(parent_id, media_id, episode_info_id)
            .await?;
        info!(%parent_id, rows, "Re-associated folder family");
        Ok(rows)
    }
}
