//! Error types for waypost-core.
//!
//! Two layers of errors exist:
//!
//! - [`SyncError`] describes why one call to the remote sync collaborator
//!   failed. The dispatcher uses [`SyncError::is_retryable`] to decide
//!   whether to try again.
//! - [`Error`] is what the engine's public operations return.
//!
//! ## Retry classification
//!
//! | Failure | Retryable | Rationale |
//! |---------|-----------|-----------|
//! | [`SyncError::Network`] | yes | Connectivity is transient |
//! | [`SyncError::Timeout`] | yes | Request may succeed on a quieter network |
//! | [`SyncError::Server`] (5xx) | yes | Server-side fault, usually transient |
//! | [`SyncError::RateLimited`] (429) | yes | Quota recovers after backing off |
//! | [`SyncError::BadRequest`] (other 4xx) | no | Same payload fails the same way |
//! | [`SyncError::Unauthorized`] (401) | no | Credentials must change first |
//! | [`SyncError::Forbidden`] (403) | no | Credentials must change first |
//! | [`SyncError::PaymentRequired`] (402) | no | Account must change first |
//! | [`SyncError::Cancelled`] | no | Tracking was stopped |
//!
//! A terminal failure on a live sync is reported once and never buffered;
//! retrying a rejected request only wastes quota.
//!
//! ## Non-errors
//!
//! Two conditions are deliberately *not* errors:
//!
//! - A full replay buffer evicts its oldest entry. The eviction is counted
//!   ([`crate::ReplayBuffer::evicted_count`]) and broadcast as
//!   [`crate::TrackingEvent::ReplayEvicted`].
//! - Completing a trip that started while tracking was stopped has no
//!   configuration to restore; the session moves to `Stopped`.

use std::time::Duration;

use thiserror::Error;

use waypost_types::{StorageError, ValidationError};

/// Why a single call to the remote sync collaborator failed.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new failure kinds
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The request never reached the server.
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete in time.
    #[error("Sync timed out after {0:?}")]
    Timeout(Duration),

    /// The server failed to process the request (5xx).
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The server asked the client to slow down (429).
    #[error("Rate limited{}", fmt_retry_after(.retry_after))]
    RateLimited {
        /// Server-suggested wait, if provided.
        retry_after: Option<Duration>,
    },

    /// The server rejected the request payload (4xx other than 401/402/403/429).
    #[error("Bad request {status}: {message}")]
    BadRequest {
        /// HTTP status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// Credentials were missing or invalid (401).
    #[error("Unauthorized")]
    Unauthorized,

    /// The account's plan does not cover the request (402).
    #[error("Payment required")]
    PaymentRequired,

    /// Credentials are valid but not allowed to make the request (403).
    #[error("Forbidden")]
    Forbidden,

    /// The dispatch was cancelled because tracking stopped.
    #[error("Sync cancelled")]
    Cancelled,
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {d:?})"))
        .unwrap_or_default()
}

impl SyncError {
    /// Map an HTTP status code to a sync error.
    ///
    /// Successful (2xx) codes are not errors; callers should not pass them.
    /// Any other unrecognized code is treated as a server fault.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => SyncError::Unauthorized,
            402 => SyncError::PaymentRequired,
            403 => SyncError::Forbidden,
            429 => SyncError::RateLimited { retry_after: None },
            400..=499 => SyncError::BadRequest { status, message },
            _ => SyncError::Server { status, message },
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::Network(message.into())
    }

    /// Returns `true` if the same request may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Timeout(_) => true,
            SyncError::Server { .. } => true,
            SyncError::RateLimited { .. } => true,
            SyncError::BadRequest { .. } => false,
            SyncError::Unauthorized => false,
            SyncError::PaymentRequired => false,
            SyncError::Forbidden => false,
            SyncError::Cancelled => false,
        }
    }

    /// Returns `true` if the server rejected the request outright.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable() && !matches!(self, SyncError::Cancelled)
    }

    /// Server-suggested minimum wait before the next attempt.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors returned by the tracking engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The remote sync collaborator failed.
    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    /// The durable storage collaborator failed.
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    /// Persisted state could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A fix failed validation.
    #[error("Invalid fix: {0}")]
    InvalidFix(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation is not allowed in the session's current state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// The session task has shut down.
    #[error("Tracking session is closed")]
    SessionClosed,
}

impl Error {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidConfig(msg) => Error::InvalidConfig(msg),
            // Everything else describes a bad observation
            other => Error::InvalidFix(other.to_string()),
        }
    }
}

/// Result type alias using waypost-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert_eq!(SyncError::from_status(401, ""), SyncError::Unauthorized);
        assert_eq!(SyncError::from_status(402, ""), SyncError::PaymentRequired);
        assert_eq!(SyncError::from_status(403, ""), SyncError::Forbidden);
        assert_eq!(
            SyncError::from_status(429, ""),
            SyncError::RateLimited { retry_after: None }
        );
        assert!(matches!(
            SyncError::from_status(404, "no route"),
            SyncError::BadRequest { status: 404, .. }
        ));
        assert!(matches!(
            SyncError::from_status(503, "down"),
            SyncError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn test_is_retryable() {
        assert!(SyncError::network("reset").is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(SyncError::from_status(500, "").is_retryable());
        assert!(SyncError::from_status(429, "").is_retryable());

        assert!(!SyncError::from_status(400, "").is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::Forbidden.is_retryable());
        assert!(!SyncError::PaymentRequired.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_is_terminal() {
        assert!(SyncError::Unauthorized.is_terminal());
        assert!(SyncError::from_status(422, "").is_terminal());
        assert!(!SyncError::Cancelled.is_terminal());
        assert!(!SyncError::network("down").is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(err.to_string().contains("30s"));
        assert_eq!(
            SyncError::RateLimited { retry_after: None }.to_string(),
            "Rate limited"
        );

        let err = Error::from(SyncError::Unauthorized);
        assert_eq!(err.to_string(), "Sync failed: Unauthorized");

        let err = Error::invalid_state("no trip in progress");
        assert!(err.to_string().contains("no trip"));
    }

    #[test]
    fn test_validation_error_conversion() {
        let err: Error = ValidationError::invalid_config("bad interval").into();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err: Error = ValidationError::InvalidAccuracy(-1.0).into();
        assert!(matches!(err, Error::InvalidFix(_)));
    }
}
