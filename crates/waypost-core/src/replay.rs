//! Durable FIFO buffer of observations that could not be delivered.
//!
//! Every mutation is written through to the [`KeyValueStore`] under
//! [`REPLAY_KEY`] as one JSON document holding the entries and the eviction
//! counter. [`ReplayBuffer::load`] rehydrates that document on startup.
//!
//! The buffer is bounded. When an entry is enqueued into a full buffer the
//! oldest entry is dropped first; this is the only way observations are
//! lost, and every such drop is counted by [`ReplayBuffer::evicted_count`].

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use waypost_types::{KeyValueStore, StorageError, SyncRequest};

use crate::error::{Error, Result};

/// Storage key for the persisted buffer.
pub const REPLAY_KEY: &str = "waypost.replay";

/// Default number of entries kept.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Capacity for hosts that opt into extended offline buffering.
pub const EXTENDED_REPLAY_CAPACITY: usize = 1000;

/// A buffered sync request and when it was buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// The request exactly as it would have been sent live.
    pub request: SyncRequest,
    /// When the request entered the buffer.
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl ReplayEntry {
    /// Wrap `request`, stamped with the current time.
    pub fn new(request: SyncRequest) -> Self {
        Self {
            request,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    entries: &'a VecDeque<ReplayEntry>,
    evicted: u64,
}

#[derive(Deserialize)]
struct Persisted {
    #[serde(default)]
    entries: VecDeque<ReplayEntry>,
    #[serde(default)]
    evicted: u64,
}

/// Bounded, persistent FIFO of undelivered sync requests.
pub struct ReplayBuffer {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
    evicted: u64,
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("evicted", &self.evicted)
            .finish_non_exhaustive()
    }
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(Error::invalid_config("replay capacity must be > 0"));
    }
    Ok(())
}

impl ReplayBuffer {
    /// Create an empty buffer without reading the store.
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            entries: VecDeque::new(),
            capacity,
            evicted: 0,
            store,
        })
    }

    /// Rehydrate the buffer from the store.
    ///
    /// A missing key yields an empty buffer. If more entries were persisted
    /// than `capacity` allows, the oldest are evicted.
    pub fn load(store: Arc<dyn KeyValueStore>, capacity: usize) -> Result<Self> {
        let mut buffer = Self::new(store, capacity)?;
        let Some(bytes) = buffer.store.get(REPLAY_KEY)? else {
            return Ok(buffer);
        };

        let persisted: Persisted = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::corrupt(REPLAY_KEY, e))?;
        buffer.entries = persisted.entries;
        buffer.evicted = persisted.evicted;
        debug!("Rehydrated {} replay entries", buffer.entries.len());

        if buffer.trim_to_capacity() > 0 {
            buffer.persist()?;
        }
        Ok(buffer)
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries dropped to make room since the buffer was created.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Iterate entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter()
    }

    /// Append `request` at the tail.
    ///
    /// Returns the entry evicted from the head to make room, if any.
    pub fn enqueue(&mut self, request: SyncRequest) -> Result<Option<ReplayEntry>> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        if let Some(entry) = &evicted {
            warn!(
                "Replay buffer full ({}), evicted request {} from {}",
                self.capacity, entry.request.request_id, entry.enqueued_at
            );
        }

        self.entries.push_back(ReplayEntry::new(request));
        self.persist()?;
        Ok(evicted)
    }

    /// Copies of up to `n` entries from the head, oldest first.
    pub fn peek_batch(&self, n: usize) -> Vec<ReplayEntry> {
        self.entries.iter().take(n).cloned().collect()
    }

    /// Remove and return up to `n` entries from the head, oldest first.
    pub fn dequeue(&mut self, n: usize) -> Result<Vec<ReplayEntry>> {
        let n = n.min(self.entries.len());
        if n == 0 {
            return Ok(Vec::new());
        }
        let removed: Vec<_> = self.entries.drain(..n).collect();
        self.persist()?;
        Ok(removed)
    }

    /// Drop every entry. The eviction counter is kept.
    pub fn clear(&mut self) -> Result<()> {
        debug!("Clearing {} replay entries", self.entries.len());
        self.entries.clear();
        self.persist()
    }

    /// Change the capacity, evicting the oldest entries if it shrinks.
    ///
    /// Returns the number of entries evicted.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<usize> {
        check_capacity(capacity)?;
        self.capacity = capacity;
        let evicted = self.trim_to_capacity();
        if evicted > 0 {
            self.persist()?;
        }
        Ok(evicted)
    }

    fn trim_to_capacity(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess > 0 {
            warn!("Evicting {} replay entries over capacity {}", excess, self.capacity);
            self.entries.drain(..excess);
            self.evicted += excess as u64;
        }
        excess
    }

    fn persist(&self) -> Result<()> {
        let snapshot = PersistedRef {
            entries: &self.entries,
            evicted: self.evicted,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        self.store.set(REPLAY_KEY, Bytes::from(bytes))?;
        Ok(())
    }
}
