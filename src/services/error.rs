//! Processing error taxonomy
//!
//! Every failure in the dispatch pipeline resolves to one of these variants,
//! which decides how the worker pool reports it back to the queue: retryable
//! errors go through exponential backoff, non-retryable ones terminate the
//! task immediately, timeouts are retryable but logged distinctly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Transient failure (network, identification, parse) - retried with backoff
    #[error("{0}")]
    Retryable(String),

    /// Validation failure, malformed name, link conflict - never retried
    #[error("{0}")]
    NonRetryable(String),

    /// Processing deadline exceeded - retryable, logged distinctly
    #[error("processing timeout")]
    Timeout,

    /// Unparseable classifier output - assumed transient, retried
    #[error("classifier output unparseable: {0}")]
    ClassifierParse(String),
}

impl ProcessingError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(self, Self::NonRetryable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}
