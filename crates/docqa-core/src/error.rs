use std::path::PathBuf;

use thiserror::Error;

/// Why a persisted index could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// Nothing is stored at the location.
    Missing,
    /// Something is stored but it cannot be read back.
    Corrupt(String),
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadFailure::Missing => f.write_str("missing"),
            LoadFailure::Corrupt(reason) => write!(f, "corrupt: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document '{doc_id}' contains no text")]
    EmptyDocument { doc_id: String },

    #[error("Unsupported file format: '{extension}' ({filename})")]
    UnsupportedFormat { filename: String, extension: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Failed to load index at {}: {failure}", path.display())]
    IndexLoad { path: PathBuf, failure: LoadFailure },

    #[error("Store consistency violated: {0}")]
    StoreConsistency(String),

    #[error("No index found for user '{0}'")]
    IndexNotFound(String),

    #[error("Index was built with embedder '{expected}', got '{actual}'")]
    EmbeddingModelMismatch { expected: String, actual: String },

    #[error("Answer generation failed: {0}")]
    Generation(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn missing_index(path: impl Into<PathBuf>) -> Self {
        Error::IndexLoad { path: path.into(), failure: LoadFailure::Missing }
    }

    pub fn corrupt_index(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::IndexLoad { path: path.into(), failure: LoadFailure::Corrupt(reason.to_string()) }
    }

    /// True only for an [`Error::IndexLoad`] caused by absence, the one case
    /// where creating a fresh index is allowed.
    pub fn is_missing_index(&self) -> bool {
        matches!(self, Error::IndexLoad { failure: LoadFailure::Missing, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
