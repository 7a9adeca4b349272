//! Error types for mesh-store.

use std::path::PathBuf;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record body could not be encoded or decoded.
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },

    /// The store refused the operation (used by test doubles and wrappers).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
