//! Error taxonomy for the indexing pipeline.
//!
//! [`IndexError`] covers the fatal kinds that abort a reindex pass.
//! [`SkipReason`] covers per-file failures: the orchestrator logs them and
//! moves on to the next file.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Fatal errors raised by [`crate::indexer::reindex`].
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Root path does not exist: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("Temp path '{}' is not managed by Help Chat: {reason}", .path.display())]
    UnmanagedDirectory { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Embeddings store error ({}): {source}", .path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to commit embeddings store changes ({}): {source}", .path.display())]
    StoreCommit {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn store(path: impl Into<PathBuf>, source: sqlx::Error) -> Self {
        IndexError::Store {
            path: path.into(),
            source,
        }
    }
}

/// Why a single file was left out of this pass. Never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkipReason {
    #[error("unreadable file: {0}")]
    Io(String),

    #[error("archive exceeds size limit ({size} bytes)")]
    ArchiveTooLarge { size: u64 },

    #[error("unsupported file format: {0}")]
    ConversionUnsupported(String),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("conversion timeout ({}s)", .0.as_secs())]
    ConversionTimeout(Duration),

    #[error("empty content after conversion")]
    EmptyContent,

    #[error("embedding generation error: {0}")]
    EmbeddingError(String),

    #[error("embedding timeout ({}s)", .0.as_secs())]
    EmbeddingTimeout(Duration),
}
