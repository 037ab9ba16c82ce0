//! Trait abstraction for the remote sync collaborator.
//!
//! [`SyncClient`] is the single logical operation the engine needs from the
//! server. The HTTP client (behind the `http-client` feature) and
//! [`MockSyncClient`](crate::MockSyncClient) both implement it.

use std::sync::Arc;

use async_trait::async_trait;

use waypost_types::{SyncRequest, SyncResponse};

use crate::error::SyncError;

/// Sends one observation to the server and returns its verdict.
///
/// Implementations perform exactly one attempt; retrying is the
/// [`RetryingDispatcher`](crate::RetryingDispatcher)'s job. Failures must be
/// classified into the right [`SyncError`] variant since that decides
/// whether the request is retried.
///
/// # Example
///
/// ```ignore
/// use waypost_core::{SyncClient, SyncError};
/// use waypost_types::SyncRequest;
///
/// async fn send<C: SyncClient>(client: &C, request: &SyncRequest) -> Result<(), SyncError> {
///     let response = client.sync(request).await?;
///     println!("inside {} geofences", response.membership.geofences.len());
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Send `request` once.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError>;
}

#[async_trait]
impl<T: SyncClient + ?Sized> SyncClient for Arc<T> {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        (**self).sync(request).await
    }
}
