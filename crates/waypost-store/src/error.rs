//! Error types for waypost-store.

use std::path::PathBuf;

use waypost_types::StorageError;

/// Result type for waypost-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in waypost-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database was written by a newer version of this crate.
    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for StorageError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => StorageError::Io(e),
            other => StorageError::backend(other),
        }
    }
}
