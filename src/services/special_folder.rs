//! Special folder detection and classification
//!
//! A "special" folder is a disc-image structure (BDMV/DVD/ISO) or a
//! multi-content release (numbered volumes, bonus material) rather than a
//! single playable file. Deterministic structural signatures are checked
//! first; only structurally ambiguous folders are handed to the pluggable
//! classifier, which may return several contents for one scanned folder.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::error::ProcessingError;
use super::llm::{extract_json, LlmClient};

/// Structural disc-image signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Bdmv,
    Dvd,
    Iso,
    /// No disc signature; classified by content instead
    Collection,
}

impl fmt::Display for FolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bdmv => "bdmv",
            Self::Dvd => "dvd",
            Self::Iso => "iso",
            Self::Collection => "collection",
        };
        f.write_str(s)
    }
}

/// What a classified content entry actually is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Main,
    Sp,
    Bonus,
    Menu,
    Pv,
    Ova,
    Other,
}

impl ContentType {
    /// Target sub-path for this content. `main` has no suffix (multi-volume
    /// mains get a `Vol.{N}` suffix instead, see [`content_sub_path`]).
    pub fn sub_path(self) -> Option<&'static str> {
        match self {
            Self::Main => None,
            Self::Sp => Some("SP"),
            Self::Bonus => Some("Bonus"),
            Self::Menu => Some("Menu"),
            Self::Pv => Some("PV"),
            Self::Ova => Some("OVA"),
            Self::Other => Some("Other"),
        }
    }
}

/// Sub-path under the title directory for one classified content entry
pub fn content_sub_path(
    content_type: ContentType,
    is_multi_disc: bool,
    disc_number: Option<i64>,
) -> Option<String> {
    match content_type.sub_path() {
        Some(fixed) => Some(fixed.to_string()),
        None if is_multi_disc => Some(format!("Vol.{}", disc_number.unwrap_or(1))),
        None => None,
    }
}

/// One classified content entry; a scanned folder may yield several
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialFolderClassification {
    #[serde(rename = "type", default)]
    pub folder_type: Option<FolderType>,
    pub title: Option<String>,
    #[serde(default)]
    pub sub_folder_name: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub is_multi_disc: bool,
    #[serde(default)]
    pub disc_number: Option<i64>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub year: Option<i64>,
}

/// Check the cheap deterministic disc signatures, no external call:
/// - BDMV: a `BDMV/` child containing STREAM, CLIPINF or PLAYLIST
/// - DVD: a `VIDEO_TS/` child containing at least one .VOB or .IFO
/// - ISO: any file ending in .iso
pub fn detect_signature(dir: &Path) -> Result<Option<FolderType>> {
    let bdmv = dir.join("BDMV");
    if bdmv.is_dir() {
        for marker in ["STREAM", "CLIPINF", "PLAYLIST"] {
            if bdmv.join(marker).exists() {
                return Ok(Some(FolderType::Bdmv));
            }
        }
    }

    let video_ts = dir.join("VIDEO_TS");
    if video_ts.is_dir() {
        for entry in std::fs::read_dir(&video_ts)? {
            let name = entry?.file_name().to_string_lossy().to_uppercase();
            if name.ends_with(".VOB") || name.ends_with(".IFO") {
                return Ok(Some(FolderType::Dvd));
            }
        }
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if entry.file_type()?.is_file() && name.ends_with(".iso") {
            return Ok(Some(FolderType::Iso));
        }
    }

    Ok(None)
}

/// Does this folder look like a multi-content release (numbered volumes,
/// extras) rather than a plain show/season tree?
///
/// True when any child directory is a numbered volume (`Vol.1`, `Disc 2`,
/// `disk_01`), or when every child directory is a known extras name (SP,
/// Bonus, Menu, PV, OVA). A `Season 1` child matches neither, so ordinary
/// show trees are still walked into.
pub fn is_release_folder(dir: &Path) -> Result<bool> {
    let volume_re = Regex::new(r"(?i)^(vol(ume)?|disc|disk)[\s._-]*\d+").unwrap();
    let extras_re = Regex::new(r"(?i)^(sp|bonus|extras?|menu|pv|ova)$").unwrap();

    let mut child_dirs = 0usize;
    let mut extras_only = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        child_dirs += 1;
        let name = entry.file_name().to_string_lossy().to_string();
        if volume_re.is_match(&name) {
            return Ok(true);
        }
        if !extras_re.is_match(&name) {
            extras_only = false;
        }
    }

    Ok(child_dirs > 0 && extras_only)
}

/// Render a depth-bounded nested listing of a folder for the classifier
pub fn build_listing(dir: &Path, max_depth: usize) -> String {
    let mut lines = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let depth = entry.depth();
        let indent = "  ".repeat(depth.saturating_sub(1));
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            lines.push(format!("{indent}{name}/"));
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }

    lines.join("\n")
}

/// Resolve a classification's `subFolderName` against the scanned folder's
/// real children: exact match, then case-insensitive, then substring
/// containment. First hit wins; no hit means the entry is skipped.
pub fn resolve_sub_folder(dir: &Path, sub_folder_name: &str) -> Result<Option<PathBuf>> {
    let mut children: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    if let Some(name) = children.iter().find(|c| c.as_str() == sub_folder_name) {
        return Ok(Some(dir.join(name)));
    }

    let wanted_lower = sub_folder_name.to_lowercase();
    if let Some(name) = children.iter().find(|c| c.to_lowercase() == wanted_lower) {
        return Ok(Some(dir.join(name)));
    }

    if let Some(name) = children.iter().find(|c| {
        let lower = c.to_lowercase();
        lower.contains(&wanted_lower) || wanted_lower.contains(&lower)
    }) {
        return Ok(Some(dir.join(name)));
    }

    Ok(None)
}

/// Pluggable multi-content classification for structurally ambiguous folders
#[async_trait]
pub trait FolderClassifier: Send + Sync {
    /// Classify a folder given its name and a depth-bounded nested listing.
    ///
    /// Must return at least one entry; an empty or unparseable result is a
    /// retryable failure.
    async fn classify(
        &self,
        folder_name: &str,
        listing: &str,
    ) -> Result<Vec<SpecialFolderClassification>, ProcessingError>;
}

const CLASSIFY_PROMPT: &str = r#"You are classifying a media release folder. It may contain one main feature, multiple numbered volumes, and extras (SP/bonus/menu/PV/OVA). Reply with only a JSON array; one object per distinct content:
[{"type":null,"title":"...","subFolderName":"...","mediaType":"movie|tv","isMultiDisc":false,"discNumber":null,"contentType":"main|sp|bonus|menu|pv|ova|other","year":null}]

Folder: {folder}
Contents:
{listing}"#;

/// LLM-backed folder classifier
pub struct LlmFolderClassifier {
    llm: Arc<LlmClient>,
}

impl LlmFolderClassifier {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl FolderClassifier for LlmFolderClassifier {
    async fn classify(
        &self,
        folder_name: &str,
        listing: &str,
    ) -> Result<Vec<SpecialFolderClassification>, ProcessingError> {
        let prompt = CLASSIFY_PROMPT
            .replace("{folder}", folder_name)
            .replace("{listing}", listing);

        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| ProcessingError::retryable(format!("classifier call failed: {e:#}")))?;

        let json = extract_json(&response)
            .map_err(|e| ProcessingError::ClassifierParse(e.to_string()))?;
        let entries: Vec<SpecialFolderClassification> = serde_json::from_str(&json)
            .map_err(|e| ProcessingError::ClassifierParse(e.to_string()))?;

        if entries.is_empty() {
            warn!(folder = folder_name, "Classifier returned no contents");
            return Err(ProcessingError::ClassifierParse(
                "classifier returned an empty list".to_string(),
            ));
        }

        debug!(folder = folder_name, contents = entries.len(), "Folder classified");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bdmv_signature() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("BDMV/STREAM")).unwrap();
        assert_eq!(detect_signature(dir.path()).unwrap(), Some(FolderType::Bdmv));
    }

    #[test]
    fn test_bdmv_requires_marker_child() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("BDMV")).unwrap();
        assert_eq!(detect_signature(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_dvd_signature() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("VIDEO_TS")).unwrap();
        std::fs::write(dir.path().join("VIDEO_TS/VTS_01_0.IFO"), b"").unwrap();
        assert_eq!(detect_signature(dir.path()).unwrap(), Some(FolderType::Dvd));
    }

    #[test]
    fn test_iso_signature() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("movie.ISO"), b"").unwrap();
        assert_eq!(detect_signature(dir.path()).unwrap(), Some(FolderType::Iso));
    }

    #[test]
    fn test_no_signature() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("episode.mkv"), b"").unwrap();
        assert_eq!(detect_signature(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_release_folder_with_numbered_volumes() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Vol.1")).unwrap();
        std::fs::create_dir(dir.path().join("Vol.2")).unwrap();
        std::fs::create_dir(dir.path().join("Scans")).unwrap();
        assert!(is_release_folder(dir.path()).unwrap());

        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("DISC 1")).unwrap();
        assert!(is_release_folder(dir.path()).unwrap());
    }

    #[test]
    fn test_release_folder_with_extras_only() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("SP")).unwrap();
        std::fs::create_dir(dir.path().join("Bonus")).unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"").unwrap();
        assert!(is_release_folder(dir.path()).unwrap());
    }

    #[test]
    fn test_season_tree_is_not_a_release_folder() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Season 1")).unwrap();
        std::fs::create_dir(dir.path().join("Season 2")).unwrap();
        assert!(!is_release_folder(dir.path()).unwrap());

        // No child directories at all: plain episode folder
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("e01.mkv"), b"").unwrap();
        assert!(!is_release_folder(dir.path()).unwrap());
    }

    #[test]
    fn test_resolve_sub_folder_priority() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Vol.1")).unwrap();
        std::fs::create_dir(dir.path().join("vol.2")).unwrap();
        std::fs::create_dir(dir.path().join("Extras (Bonus)")).unwrap();

        // Exact
        assert_eq!(
            resolve_sub_folder(dir.path(), "Vol.1").unwrap(),
            Some(dir.path().join("Vol.1"))
        );
        // Case-insensitive
        assert_eq!(
            resolve_sub_folder(dir.path(), "VOL.2").unwrap(),
            Some(dir.path().join("vol.2"))
        );
        // Substring containment
        assert_eq!(
            resolve_sub_folder(dir.path(), "Bonus").unwrap(),
            Some(dir.path().join("Extras (Bonus)"))
        );
        // No match
        assert_eq!(resolve_sub_folder(dir.path(), "Menu").unwrap(), None);
    }

    #[test]
    fn test_content_sub_path_mapping() {
        assert_eq!(content_sub_path(ContentType::Main, false, None), None);
        assert_eq!(
            content_sub_path(ContentType::Main, true, Some(2)),
            Some("Vol.2".to_string())
        );
        assert_eq!(
            content_sub_path(ContentType::Sp, false, None),
            Some("SP".to_string())
        );
        assert_eq!(
            content_sub_path(ContentType::Bonus, false, None),
            Some("Bonus".to_string())
        );
        assert_eq!(
            content_sub_path(ContentType::Other, false, None),
            Some("Other".to_string())
        );
    }

    #[test]
    fn test_build_listing_depth_bound() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::write(dir.path().join("a/file.mkv"), b"").unwrap();

        let listing = build_listing(dir.path(), 2);
        assert!(listing.contains("a/"));
        assert!(listing.contains("file.mkv"));
        assert!(listing.contains("b/"));
        assert!(!listing.contains("c/"));
    }

    #[test]
    fn test_classification_deserializes_llm_shape() {
        let json = r#"[
            {"type": "bdmv", "title": "Akira", "subFolderName": "AKIRA_VOL1",
             "mediaType": "movie", "isMultiDisc": true, "discNumber": 1,
             "contentType": "main", "year": 1988},
            {"title": "Akira", "subFolderName": "Extras", "contentType": "bonus"}
        ]"#;
        let entries: Vec<SpecialFolderClassification> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].folder_type, Some(FolderType::Bdmv));
        assert!(entries[0].is_multi_disc);
        assert_eq!(entries[0].content_type, ContentType::Main);
        assert_eq!(entries[1].content_type, ContentType::Bonus);
        assert!(!entries[1].is_multi_disc);
    }
}
