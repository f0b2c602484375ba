//! Error taxonomy for the memory substrate.
//!
//! Graph-integrity failures (`Validation`, `NotFound`, `Cycle`) reject the
//! single operation and surface unchanged. `ConcurrentModification` is retried
//! exactly once with a fresh read before surfacing. Backend failures
//! (`GenerationBackend`, `RetrievalBackend`) defer the owning task instead of
//! failing a scheduler cycle.

use thiserror::Error;

/// Result alias used across the crate.
pub type MnemaResult<T> = Result<T, MnemaError>;

#[derive(Debug, Error)]
pub enum MnemaError {
    /// Malformed node or edge payload.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// An operation referenced a node or edge that does not exist.
    #[error("not found: {id}")]
    NotFound { id: String },

    /// A SUPERSEDES edge would close a version cycle.
    #[error("supersedes edge {source_id} -> {target_id} would create a version cycle")]
    Cycle { source_id: String, target_id: String },

    /// Optimistic write lost the race against a foreground write.
    #[error("concurrent modification of {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// The text-generation collaborator failed or timed out.
    #[error("generation backend: {message}")]
    GenerationBackend { message: String },

    /// The similarity-search collaborator failed or is unavailable.
    #[error("retrieval backend: {message}")]
    RetrievalBackend { message: String },

    /// A task ran past its per-task timeout and was aborted.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("store: {0}")]
    Store(#[from] sled::Error),

    #[error("journal: {0}")]
    Journal(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
}

impl MnemaError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::GenerationBackend {
            message: message.into(),
        }
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::RetrievalBackend {
            message: message.into(),
        }
    }
}
