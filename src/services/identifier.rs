//! Title identification strategies
//!
//! Turns a filename (or folder name) into canonical catalog metadata. Two
//! implementations behind one trait, selected once at construction:
//! deterministic regex extraction, and LLM-assisted extraction with an LLM
//! disambiguation step that falls back to deterministic scoring when the
//! model's answer is unusable.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::error::ProcessingError;
use super::filename_parser::{self, ParsedName};
use super::llm::{extract_json, LlmClient};

/// Movie or episodic content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Movie,
    Tv,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
        }
    }
}

/// Canonical identification result
#[derive(Debug, Clone)]
pub struct IdentifiedMedia {
    pub external_id: i64,
    pub kind: MediaKind,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i64>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub episode_title: Option<String>,
}

/// Pluggable identification strategy consumed by the dispatcher
#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(
        &self,
        file_name: &str,
        is_directory: bool,
        full_path: &Path,
    ) -> Result<Option<IdentifiedMedia>, ProcessingError>;
}

/// One candidate from the external catalog
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub external_id: i64,
    pub kind: MediaKind,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i64>,
}

/// External catalog search, stubbed in tests
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    async fn search(&self, query: &str, year: Option<i64>) -> Result<Vec<CatalogEntry>>;
}

/// TMDB-style HTTP catalog client
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCatalog {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    original_title: Option<String>,
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    first_air_date: Option<String>,
}

#[async_trait]
impl CatalogSearch for HttpCatalog {
    async fn search(&self, query: &str, year: Option<i64>) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/search/multi", self.base_url.trim_end_matches('/'));
        let mut request = self.client.get(&url).query(&[("query", query)]);
        if let Some(year) = year {
            request = request.query(&[("year", year.to_string())]);
        }
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }

        let response: SearchResponse = request
            .send()
            .await
            .context("Catalog search request failed")?
            .error_for_status()
            .context("Catalog search returned an error status")?
            .json()
            .await
            .context("Failed to parse catalog search response")?;

        let entries = response
            .results
            .into_iter()
            .filter_map(|r| {
                let kind = match r.media_type.as_deref() {
                    Some("movie") => MediaKind::Movie,
                    Some("tv") => MediaKind::Tv,
                    _ => return None,
                };
                let title = r.title.or(r.name)?;
                let year = r
                    .release_date
                    .or(r.first_air_date)
                    .and_then(|d| d.get(..4).and_then(|y| y.parse().ok()));
                Some(CatalogEntry {
                    external_id: r.id,
                    kind,
                    title,
                    original_title: r.original_title.or(r.original_name),
                    year,
                })
            })
            .collect();

        Ok(entries)
    }
}

/// Deterministic scoring over catalog candidates: title similarity with a
/// year-agreement bonus. Used directly by the regex strategy and as the
/// fallback when LLM disambiguation is unusable.
pub fn score_candidates<'a>(
    candidates: &'a [CatalogEntry],
    parsed_title: &str,
    parsed_year: Option<i64>,
    want_kind: Option<MediaKind>,
) -> Option<&'a CatalogEntry> {
    let mut best: Option<(&CatalogEntry, f64)> = None;

    for candidate in candidates {
        if let Some(kind) = want_kind {
            if candidate.kind != kind {
                continue;
            }
        }

        let mut score = filename_parser::title_similarity(parsed_title, &candidate.title);
        if let Some(original) = &candidate.original_title {
            score = score.max(filename_parser::title_similarity(parsed_title, original));
        }
        if let (Some(wanted), Some(actual)) = (parsed_year, candidate.year) {
            if wanted == actual {
                score += 0.2;
            }
        }

        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((candidate, score));
        }
    }

    // Below this the match is more likely noise than a hit
    best.filter(|(_, score)| *score >= 0.5).map(|(c, _)| c)
}

fn build_identified(entry: &CatalogEntry, parsed: &ParsedName) -> IdentifiedMedia {
    IdentifiedMedia {
        external_id: entry.external_id,
        kind: entry.kind,
        title: entry.title.clone(),
        original_title: entry.original_title.clone(),
        year: entry.year.or(parsed.year),
        season: parsed.season,
        episode: parsed.episode,
        episode_title: parsed.episode_title.clone(),
    }
}

/// Regex extraction against known naming conventions, then a deterministic
/// scoring pick over catalog candidates
pub struct RegexIdentifier {
    catalog: Arc<dyn CatalogSearch>,
}

impl RegexIdentifier {
    pub fn new(catalog: Arc<dyn CatalogSearch>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Identifier for RegexIdentifier {
    async fn identify(
        &self,
        file_name: &str,
        _is_directory: bool,
        _full_path: &Path,
    ) -> Result<Option<IdentifiedMedia>, ProcessingError> {
        let parsed = filename_parser::parse_name(file_name);
        let Some(title) = parsed.title.clone().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };

        let candidates = self
            .catalog
            .search(&title, parsed.year)
            .await
            .map_err(|e| ProcessingError::retryable(format!("catalog search failed: {e:#}")))?;

        let want_kind = if parsed.is_episode() {
            Some(MediaKind::Tv)
        } else {
            None
        };

        match score_candidates(&candidates, &title, parsed.year, want_kind) {
            Some(entry) => Ok(Some(build_identified(entry, &parsed))),
            None => {
                debug!(file_name, title, "No catalog candidate scored high enough");
                Ok(None)
            }
        }
    }
}

/// Fields the extraction prompt asks the model to fill
#[derive(Debug, Deserialize)]
struct LlmExtraction {
    title: Option<String>,
    year: Option<i64>,
    season: Option<i64>,
    episode: Option<i64>,
    episode_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmPick {
    id: Option<i64>,
}

const EXTRACTION_PROMPT: &str = r#"Parse this media file or folder name. Reply with only a JSON object.
Clean the title (remove dots, underscores, quality tags, release groups). Use null for unknown fields.

Name: {name}

{"title":null,"year":null,"season":null,"episode":null,"episode_title":null}"#;

const DISAMBIGUATION_PROMPT: &str = r#"Which catalog entry matches "{title}"{year_hint}? Reply with only {"id": <number>} choosing from:
{candidates}"#;

/// LLM-assisted extraction: model parses the name, the catalog is searched,
/// and the model picks among the top candidates
pub struct LlmIdentifier {
    llm: Arc<LlmClient>,
    catalog: Arc<dyn CatalogSearch>,
}

impl LlmIdentifier {
    /// How many top candidates we show the model for disambiguation
    const MAX_CANDIDATES: usize = 5;

    pub fn new(llm: Arc<LlmClient>, catalog: Arc<dyn CatalogSearch>) -> Self {
        Self { llm, catalog }
    }

    async fn extract(&self, name: &str) -> Result<LlmExtraction, ProcessingError> {
        let prompt = EXTRACTION_PROMPT.replace("{name}", name);
        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| ProcessingError::retryable(format!("LLM extraction failed: {e:#}")))?;

        let json = extract_json(&response)
            .map_err(|e| ProcessingError::ClassifierParse(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| ProcessingError::ClassifierParse(e.to_string()))
    }

    /// Ask the model to pick among candidates; None when its answer is unusable
    async fn disambiguate(&self, title: &str, year: Option<i64>, candidates: &[CatalogEntry]) -> Option<i64> {
        let listing = candidates
            .iter()
            .take(Self::MAX_CANDIDATES)
            .map(|c| {
                format!(
                    "- id {}: {} ({}, {})",
                    c.external_id,
                    c.title,
                    c.kind.as_str(),
                    c.year.map(|y| y.to_string()).unwrap_or_else(|| "?".to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = DISAMBIGUATION_PROMPT
            .replace("{title}", title)
            .replace(
                "{year_hint}",
                &year.map(|y| format!(" ({y})")).unwrap_or_default(),
            )
            .replace("{candidates}", &listing);

        let response = match self.llm.complete(&prompt).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "LLM disambiguation call failed, falling back to scoring");
                return None;
            }
        };

        let pick: LlmPick = extract_json(&response)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())?;
        let id = pick.id?;

        // Only accept ids that were actually offered
        candidates
            .iter()
            .take(Self::MAX_CANDIDATES)
            .find(|c| c.external_id == id)
            .map(|c| c.external_id)
    }
}

#[async_trait]
impl Identifier for LlmIdentifier {
    async fn identify(
        &self,
        file_name: &str,
        _is_directory: bool,
        _full_path: &Path,
    ) -> Result<Option<IdentifiedMedia>, ProcessingError> {
        let extraction = self.extract(file_name).await?;
        let Some(title) = extraction.title.filter(|t| !t.trim().is_empty()) else {
            return Ok(None);
        };

        let parsed = ParsedName {
            title: Some(title.clone()),
            year: extraction.year,
            season: extraction.season,
            episode: extraction.episode,
            episode_title: extraction.episode_title,
            original: file_name.to_string(),
        };

        let candidates = self
            .catalog
            .search(&title, extraction.year)
            .await
            .map_err(|e| ProcessingError::retryable(format!("catalog search failed: {e:#}")))?;
        if candidates.is_empty() {
            return Ok(None);
        }

        if let Some(id) = self.disambiguate(&title, extraction.year, &candidates).await {
            if let Some(entry) = candidates.iter().find(|c| c.external_id == id) {
                return Ok(Some(build_identified(entry, &parsed)));
            }
        }

        // Deterministic scoring fallback when the model's answer was unusable
        let want_kind = if parsed.is_episode() {
            Some(MediaKind::Tv)
        } else {
            None
        };
        Ok(score_candidates(&candidates, &title, extraction.year, want_kind)
            .map(|entry| build_identified(entry, &parsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, kind: MediaKind, title: &str, year: Option<i64>) -> CatalogEntry {
        CatalogEntry {
            external_id: id,
            kind,
            title: title.to_string(),
            original_title: None,
            year,
        }
    }

    #[test]
    fn test_score_prefers_exact_title() {
        let candidates = vec![
            entry(1, MediaKind::Movie, "Dune", Some(1984)),
            entry(2, MediaKind::Movie, "Dune: Part Two", Some(2024)),
        ];
        let best = score_candidates(&candidates, "Dune Part Two", Some(2024), None).unwrap();
        assert_eq!(best.external_id, 2);
    }

    #[test]
    fn test_score_year_breaks_ties() {
        let candidates = vec![
            entry(1, MediaKind::Movie, "Suspiria", Some(1977)),
            entry(2, MediaKind::Movie, "Suspiria", Some(2018)),
        ];
        let best = score_candidates(&candidates, "Suspiria", Some(1977), None).unwrap();
        assert_eq!(best.external_id, 1);
    }

    #[test]
    fn test_score_filters_kind() {
        let candidates = vec![
            entry(1, MediaKind::Movie, "Fargo", Some(1996)),
            entry(2, MediaKind::Tv, "Fargo", Some(2014)),
        ];
        let best = score_candidates(&candidates, "Fargo", None, Some(MediaKind::Tv)).unwrap();
        assert_eq!(best.external_id, 2);
    }

    #[test]
    fn test_score_rejects_noise() {
        let candidates = vec![entry(1, MediaKind::Movie, "Completely Unrelated", None)];
        assert!(score_candidates(&candidates, "My Home Video", None, None).is_none());
    }
}
