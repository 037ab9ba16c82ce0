//! Data models for stored entries.

use time::OffsetDateTime;

/// Metadata about one stored key, without its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// The key.
    pub key: String,
    /// Value size in bytes.
    pub size: usize,
    /// When the value was last written.
    pub updated_at: OffsetDateTime,
}
