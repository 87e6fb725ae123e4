//! Filename parser for scene-style release names
//!
//! Deterministic extraction of title/season/episode/year from names like:
//! - "Severance.S02E03.1080p.WEB.h264-GROUP.mkv"
//! - "Dune Part Two (2024) 2160p BluRay x265.mkv"
//! - "Frieren 1x07 [1080p].mkv"

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parsed name information from a filename or folder name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedName {
    pub title: Option<String>,
    pub year: Option<i64>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub episode_title: Option<String>,
    pub original: String,
}

impl ParsedName {
    pub fn is_episode(&self) -> bool {
        self.season.is_some() && self.episode.is_some()
    }
}

/// Parse a filename to extract title and numbering
pub fn parse_name(name: &str) -> ParsedName {
    let mut result = ParsedName {
        original: name.to_string(),
        ..Default::default()
    };

    let stem = strip_extension(name);
    let cleaned = stem.replace(['.', '_'], " ");

    // S01E01 format (most common)
    let sxxexx_re =
        Regex::new(r"(?i)^(.+?)[\s\-]*[Ss](\d{1,2})[Ee](\d{1,3})(?:[\s\-]+(.*))?$").unwrap();
    // 1x01 format
    let nxnn_re = Regex::new(r"(?i)^(.+?)[\s\-]*(\d{1,2})x(\d{2,3})(?:[\s\-]+(.*))?$").unwrap();
    // Season X Episode Y format
    let verbose_re = Regex::new(r"(?i)^(.+?)\s*Season\s*(\d+).*?Episode\s*(\d+)").unwrap();

    if let Some(caps) = sxxexx_re.captures(&cleaned) {
        result.title = Some(clean_title(&caps[1]));
        result.season = caps[2].parse().ok();
        result.episode = caps[3].parse().ok();
        result.episode_title = caps
            .get(4)
            .map(|m| strip_release_tags(m.as_str()))
            .filter(|t| !t.is_empty());
    } else if let Some(caps) = nxnn_re.captures(&cleaned) {
        result.title = Some(clean_title(&caps[1]));
        result.season = caps[2].parse().ok();
        result.episode = caps[3].parse().ok();
        result.episode_title = caps
            .get(4)
            .map(|m| strip_release_tags(m.as_str()))
            .filter(|t| !t.is_empty());
    } else if let Some(caps) = verbose_re.captures(&cleaned) {
        result.title = Some(clean_title(&caps[1]));
        result.season = caps[2].parse().ok();
        result.episode = caps[3].parse().ok();
    } else {
        // No numbering - treat as a movie-style name
        result.title = Some(clean_title(&cleaned));
    }

    // Year, anywhere in the name, for catalog disambiguation
    let year_re = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    if let Some(caps) = year_re.captures(&cleaned) {
        result.year = caps[1].parse().ok();
    }

    result
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.len() <= 4 => stem,
        _ => name,
    }
}

/// Remove bracketed tags and year markers, truncate at the first quality token
fn clean_title(raw: &str) -> String {
    let brackets_re = Regex::new(r"\[[^\]]*\]|\([^)]*\)").unwrap();
    let mut title = brackets_re.replace_all(raw, " ").to_string();

    let trailing_year_re = Regex::new(r"\s*(19\d{2}|20\d{2})\s*$").unwrap();
    title = trailing_year_re.replace(&title, "").to_string();

    let quality_re = Regex::new(
        r"(?i)\b(2160p|1080p|720p|480p|4k|uhd|bluray|blu ray|bdrip|web ?dl|webrip|hdtv|x26[45]|h ?26[45]|hevc|av1|remux|proper|repack)\b",
    )
    .unwrap();
    if let Some(m) = quality_re.find(&title) {
        title.truncate(m.start());
    }

    let space_re = Regex::new(r"\s+").unwrap();
    space_re.replace_all(title.trim(), " ").trim().to_string()
}

/// Episode-title portion: cut quality tags and the trailing release group
fn strip_release_tags(raw: &str) -> String {
    let mut text = clean_title(raw);
    if let Some(idx) = text.rfind('-') {
        let group_re = Regex::new(r"^[A-Za-z0-9]+$").unwrap();
        if group_re.is_match(text[idx + 1..].trim()) {
            text.truncate(idx);
        }
    }
    text.trim().to_string()
}

/// Lowercase, strip articles and punctuation for comparison
pub fn normalize_title(name: &str) -> String {
    let mut normalized = name.to_lowercase();

    for article in ["the ", "a ", "an "] {
        if let Some(rest) = normalized.strip_prefix(article) {
            normalized = rest.to_string();
            break;
        }
    }

    let special_re = Regex::new(r"[^a-z0-9\s]").unwrap();
    normalized = special_re.replace_all(&normalized, "").to_string();

    let space_re = Regex::new(r"\s+").unwrap();
    space_re.replace_all(normalized.trim(), " ").to_string()
}

/// Similarity between two titles in [0.0, 1.0]
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a == b {
        return 1.0;
    }
    rapidfuzz::distance::levenshtein::normalized_similarity(a.chars(), b.chars())
}
