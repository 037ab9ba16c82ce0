//! Durable key-value storage collaborator.
//!
//! The tracking engine persists its replay queue, nearby cache, and session
//! state through this trait so they survive process restarts. Values are
//! opaque byte blobs; the engine owns the encoding.

use bytes::Bytes;

use crate::error::StorageError;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Key-value store with get/set/delete semantics.
///
/// Implementations must make a completed `set` durable before returning:
/// the engine treats a successful return as "survives restart".
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Bytes) -> StorageResult<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Bytes) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key)
    }
}
