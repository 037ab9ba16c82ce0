//! Error types for waypost-types.

use thiserror::Error;

/// Errors raised when a value fails validation.
///
/// This error type is platform-agnostic and carries no transport or
/// storage detail (those belong in waypost-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// Latitude or longitude is out of range or not finite.
    #[error("Invalid coordinate: ({latitude}, {longitude})")]
    InvalidCoordinate {
        /// Offending latitude.
        latitude: f64,
        /// Offending longitude.
        longitude: f64,
    },

    /// Horizontal accuracy is negative or not finite.
    #[error("Invalid horizontal accuracy: {0}")]
    InvalidAccuracy(f64),

    /// A record's geometry cannot be evaluated.
    #[error("Invalid geometry for '{id}': {reason}")]
    InvalidGeometry {
        /// Identifier of the record.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ValidationError {
    /// Create an invalid geometry error.
    pub fn invalid_geometry(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using waypost-types' ValidationError type.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Errors reported by a [`KeyValueStore`](crate::storage::KeyValueStore) backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The backend could not be reached or refused the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The stored value under `key` could not be decoded.
    #[error("Corrupt value for key '{key}': {reason}")]
    Corrupt {
        /// Key whose value is unreadable.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Create a backend error from any displayable cause.
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend(message.to_string())
    }

    /// Create a corrupt-value error.
    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
