//! Error taxonomy for the retrieval pipeline.
//!
//! Every fallible core operation returns [`Result`]. Variants map onto the
//! failure classes callers handle differently: configuration problems are
//! fatal at startup, embedding failures are transient, an empty index is
//! recoverable by ingesting, and generation failures truncate the answer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid sizing or tuning parameters. Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding backend failed or returned a malformed response.
    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    /// No vectors exist for the requested embedding model.
    #[error("index not ready: no vectors indexed for model '{model}'")]
    IndexNotReady { model: String },

    /// The generation backend failed before or during streaming.
    #[error("generation backend error: {0}")]
    GenerationBackend(String),

    /// A vector did not match the dimensionality of its model.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A page handed over by the text extraction stage is malformed.
    #[error("invalid page: {0}")]
    InvalidPage(String),

    /// The vector storage capability failed.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Error::Storage(err.to_string())
    }

    pub fn embedding<E: std::fmt::Display>(err: E) -> Self {
        Error::EmbeddingBackend(err.to_string())
    }

    pub fn generation<E: std::fmt::Display>(err: E) -> Self {
        Error::GenerationBackend(err.to_string())
    }

    /// Whether a caller may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::EmbeddingBackend(_))
    }

    /// Text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration(msg) => format!("invalid configuration: {}", msg),
            Error::EmbeddingBackend(_) => "retrieval temporarily unavailable".to_string(),
            Error::IndexNotReady { .. } => "no codes indexed yet".to_string(),
            Error::GenerationBackend(_) => {
                "the answer could not be completed; the response was truncated".to_string()
            }
            Error::InvalidPage(msg) => format!("document rejected: {}", msg),
            Error::DimensionMismatch { .. } | Error::Storage(_) => {
                "internal error while searching the code index".to_string()
            }
        }
    }
}
