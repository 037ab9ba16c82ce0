//! Mock collaborators for testing.
//!
//! This module provides an in-memory sync server and key-value store so the
//! engine can be exercised without a network or a database.
//!
//! # Features
//!
//! - **Scripted replies**: queue responses or failures for upcoming calls
//! - **Echo fallback**: with an empty script the server confirms whatever
//!   membership the device reported
//! - **Failure injection**: take the server offline or make storage fail
//! - **Latency simulation**: delay each sync to test in-flight cancellation
//! - **Call log**: every request with the (tokio) instant it arrived

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use waypost_types::{
    KeyValueStore, NearbyUpdate, StorageError, StorageResult, SyncRequest, SyncResponse,
};

use crate::error::SyncError;
use crate::traits::SyncClient;

/// How the mock server answers one call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Confirm the membership the request carried.
    Echo,
    /// Return this response verbatim.
    Respond(SyncResponse),
    /// Fail with this error.
    Fail(SyncError),
}

/// A request received by the mock server.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// The request as sent.
    pub request: SyncRequest,
    /// When the call started.
    pub at: Instant,
}

/// A scriptable in-memory sync server.
///
/// Implements [`SyncClient`].
///
/// # Example
///
/// ```
/// use waypost_core::{MockSyncClient, SyncError};
///
/// let server = MockSyncClient::new();
/// server.push_failure(SyncError::network("down"));
/// server.push_failure(SyncError::network("down"));
/// // third call falls back to echoing the request's membership
/// ```
pub struct MockSyncClient {
    script: std::sync::Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<MockCall>>,
    call_count: AtomicU64,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    echo_nearby: std::sync::Mutex<Option<NearbyUpdate>>,
}

impl std::fmt::Debug for MockSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSyncClient")
            .field("call_count", &self.call_count.load(Ordering::Relaxed))
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockSyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSyncClient {
    /// Create a server that echoes every request.
    pub fn new() -> Self {
        Self {
            script: std::sync::Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            echo_nearby: std::sync::Mutex::new(None),
        }
    }

    /// Queue a reply for an upcoming call.
    pub fn push_reply(&self, reply: MockReply) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Queue a response for an upcoming call.
    pub fn push_response(&self, response: SyncResponse) {
        self.push_reply(MockReply::Respond(response));
    }

    /// Queue a failure for an upcoming call.
    pub fn push_failure(&self, error: SyncError) {
        self.push_reply(MockReply::Fail(error));
    }

    /// Number of scripted replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// While offline, every call fails with a network error and the script
    /// is left untouched.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Nearby update attached to every echoed response.
    pub fn set_echo_nearby(&self, nearby: Option<NearbyUpdate>) {
        *self
            .echo_nearby
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = nearby;
    }

    /// Delay each call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total calls received.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every call received so far.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<SyncRequest> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|c| c.request.clone())
            .collect()
    }

    fn next_reply(&self) -> MockReply {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(MockReply::Echo)
    }
}

#[async_trait]
impl SyncClient for MockSyncClient {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().await.push(MockCall {
            request: request.clone(),
            at: Instant::now(),
        });

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.offline.load(Ordering::Relaxed) {
            return Err(SyncError::network("mock server offline"));
        }

        match self.next_reply() {
            MockReply::Echo => {
                let mut response = SyncResponse::confirming(request.membership.clone());
                response.nearby = self
                    .echo_nearby
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                Ok(response)
            }
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(error) => Err(error),
        }
    }
}

/// An in-memory [`KeyValueStore`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Bytes>>,
    should_fail: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn check(&self) -> StorageResult<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(StorageError::backend("mock storage failure"));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: Bytes) -> StorageResult<()> {
        self.check()?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check()?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
