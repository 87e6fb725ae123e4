//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Default extensions recognized as video content
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "flv", "webm", "mpeg", "mpg", "ts", "m2ts", "iso",
];

/// Default extensions recognized as subtitle sidecars
pub const DEFAULT_SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "sub", "sup", "vtt"];

/// Which identification strategy to construct at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierStrategy {
    Regex,
    Llm,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file path
    pub database_path: PathBuf,

    /// Source tree to watch and scan
    pub source_path: PathBuf,

    /// Root of the materialized target tree
    pub target_path: PathBuf,

    /// Number of concurrent worker loops
    pub concurrency: usize,

    /// Base delay for exponential retry backoff
    pub retry_delay: Duration,

    /// Cap on the computed retry backoff
    pub max_retry_delay: Duration,

    /// Retry budget for newly enqueued tasks
    pub default_max_retries: i64,

    /// Per-task processing deadline
    pub processing_timeout: Duration,

    /// Chunk size for batch enqueue
    pub batch_size: usize,

    /// Sleep between dequeue attempts when the queue is empty
    pub queue_poll_interval: Duration,

    /// Sleep after a dequeue error before polling again
    pub error_retry_interval: Duration,

    /// How often the stuck-RUNNING sweep runs
    pub timeout_cleanup_interval: Duration,

    /// Extensions treated as video content
    pub video_extensions: Vec<String>,

    /// Extensions treated as subtitle sidecars
    pub subtitle_extensions: Vec<String>,

    /// Maximum directory depth for the periodic scan
    pub scan_max_depth: usize,

    /// Cron expression for the periodic full scan
    pub scan_cron: String,

    /// Identification strategy selected once at startup
    pub identifier_strategy: IdentifierStrategy,

    /// Chat-completion endpoint for LLM-assisted identification/classification
    pub llm_url: String,

    /// Model name sent to the chat-completion endpoint
    pub llm_model: String,

    /// Optional bearer token for the LLM endpoint
    pub llm_api_key: Option<String>,

    /// External catalog API base URL
    pub catalog_url: String,

    /// External catalog API key
    pub catalog_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let source_path = PathBuf::from(
            env::var("SOURCE_PATH").context("SOURCE_PATH is required")?,
        );
        let target_path = PathBuf::from(
            env::var("TARGET_PATH").context("TARGET_PATH is required")?,
        );

        let identifier_strategy = match env::var("IDENTIFIER_STRATEGY")
            .unwrap_or_else(|_| "regex".to_string())
            .to_lowercase()
            .as_str()
        {
            "llm" => IdentifierStrategy::Llm,
            _ => IdentifierStrategy::Regex,
        };

        Ok(Self {
            database_path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/medialinker.db".to_string()),
            ),
            source_path,
            target_path,

            concurrency: env_parse("WORKER_CONCURRENCY", 4),
            retry_delay: Duration::from_millis(env_parse("RETRY_DELAY_MS", 1000)),
            max_retry_delay: Duration::from_millis(env_parse("MAX_RETRY_DELAY_MS", 300_000)),
            default_max_retries: env_parse("DEFAULT_MAX_RETRIES", 3),
            processing_timeout: Duration::from_secs(env_parse("PROCESSING_TIMEOUT_SECS", 300)),
            batch_size: env_parse("BATCH_SIZE", 100),
            queue_poll_interval: Duration::from_millis(env_parse("QUEUE_POLL_INTERVAL_MS", 1000)),
            error_retry_interval: Duration::from_millis(env_parse("ERROR_RETRY_INTERVAL_MS", 5000)),
            timeout_cleanup_interval: Duration::from_secs(env_parse(
                "TIMEOUT_CLEANUP_INTERVAL_SECS",
                60,
            )),

            video_extensions: env_list("VIDEO_EXTENSIONS", DEFAULT_VIDEO_EXTENSIONS),
            subtitle_extensions: env_list("SUBTITLE_EXTENSIONS", DEFAULT_SUBTITLE_EXTENSIONS),
            scan_max_depth: env_parse("SCAN_MAX_DEPTH", 6),
            scan_cron: env::var("SCAN_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),

            identifier_strategy,
            llm_url: env::var("LLM_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "qwen2.5:7b".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            catalog_url: env::var("CATALOG_URL")
                .unwrap_or_else(|_| "https://api.themoviedb.org/3".to_string()),
            catalog_api_key: env::var("CATALOG_API_KEY").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}
