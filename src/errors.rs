// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared by the embedding, cache and indexing layers.

use thiserror::Error;

/// Errors produced by embedding providers.
///
/// `Clone` so that a single failed remote batch can be delivered to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    #[error("embed(text) requires a non-empty string")]
    InvalidInput,

    #[error("transient embedding failure: {0}")]
    TransientNetwork(String),

    #[error("embedding request failed ({status}): {message}")]
    NonRetryableRemote { status: u16, message: String },

    #[error("embedding count mismatch: expected={expected}, got={actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("invalid embeddings response: {0}")]
    InvalidResponse(String),

    #[error("embedding model artifacts are corrupted: {0}")]
    ModelCorruption(String),

    #[error("embedding model error: {0}")]
    Model(String),

    #[error("embedding request timed out")]
    Timeout,

    #[error("embedding provider has shut down")]
    Closed,

    #[error("invalid embedding configuration: {0}")]
    Config(String),
}

impl EmbedError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::TransientNetwork(_) | EmbedError::Timeout)
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EmbedError::Timeout
        } else if err.is_decode() {
            EmbedError::InvalidResponse(err.to_string())
        } else {
            EmbedError::TransientNetwork(err.to_string())
        }
    }
}

/// Errors produced by vector cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cache configuration error: {0}")]
    Config(String),

    #[error("vector store request failed: {0}")]
    Remote(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors that abort an indexing run as a whole.
///
/// Per-file and per-chunk embedding failures never surface here; they are
/// counted in the run summary instead.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to walk workspace: {0}")]
    Walk(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("indexing worker failed: {0}")]
    Worker(String),

    #[error("invalid indexing configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EmbedError::TransientNetwork("reset".into()).is_retryable());
        assert!(EmbedError::Timeout.is_retryable());
        assert!(!EmbedError::InvalidInput.is_retryable());
        assert!(!EmbedError::NonRetryableRemote {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn dimension_mismatch_message_names_both_sizes() {
        let err = CacheError::DimensionMismatch {
            expected: 768,
            actual: 3,
        };
        let text = err.to_string();
        assert!(text.contains("768"));
        assert!(text.contains('3'));
    }
}
