//! Error taxonomy for engine operations.
//!
//! Per-file failures during indexing ([`MemoryError::FileRead`],
//! [`MemoryError::Parse`]) are isolated by the indexer and never abort a
//! pass. The remaining variants are fatal to the single call that raised them.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// A structured-fact file did not parse as a list of facts.
    #[error("malformed fact file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A discovered file could not be read (permissions, vanished, not UTF-8).
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another write (index, remember, reflect) holds the workspace lock.
    #[error("workspace is locked by another write; retry {operation}")]
    LockContention { operation: &'static str },

    /// A query filter value could not be interpreted.
    #[error("invalid {field} filter: '{value}'")]
    QueryFilter { field: &'static str, value: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("nothing to remember: content is empty")]
    EmptyContent,

    /// The entry would fall under the segmenter's body floor and never be indexed.
    #[error("memory too short to index: '{0}'")]
    ContentTooShort(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside the storage backend.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl MemoryError {
    pub fn query_filter(field: &'static str, value: impl Into<String>) -> Self {
        MemoryError::QueryFilter {
            field,
            value: value.into(),
        }
    }
}
