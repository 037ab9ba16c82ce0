//! Tracking decision and sync engine for device-side location tracking.
//!
//! This crate decides, for every location fix a device produces, whether the
//! fix changes anything the server needs to know about, and delivers the ones
//! that do reliably, even across network outages and process restarts.
//!
//! # Features
//!
//! - **Local classification**: geofence, beacon, and place membership from a
//!   cache of nearby records, with no network round trip
//! - **Sync suppression**: only membership changes, fixes outside the synced
//!   region, or an explicit "sync everything" config reach the server
//! - **Bounded retry**: exponential backoff with jitter, honoring `Retry-After`
//! - **Offline replay**: undeliverable observations are buffered durably and
//!   flushed oldest first once the server is reachable again
//! - **Trips**: temporary tracking configs that restore the previous one
//!   exactly when the trip ends
//! - **Stop detection**: dwell-based stopped/moving state
//! - **Events and metrics**: broadcast session events and atomic counters
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypost_core::{MemoryStore, MockSyncClient, SessionOptions, TrackingSession};
//! use waypost_types::{Coordinate, FixSource, LocationFix, TrackingConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(MockSyncClient::new());
//! let store = Arc::new(MemoryStore::new());
//! let mut session = TrackingSession::restore(server, store, SessionOptions::default())?;
//!
//! session.start_tracking(TrackingConfig::responsive())?;
//! let fix = LocationFix::new(Coordinate::new(52.52, 13.405), 10.0, FixSource::ForegroundPoll);
//! let outcome = session.on_fix(fix).await?;
//! println!("{}", outcome.label());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod classifier;
pub mod decision;
pub mod detector;
pub mod error;
pub mod events;
pub mod handle;
#[cfg(feature = "http-client")]
pub mod http_client;
pub mod metrics;
pub mod mock;
pub mod replay;
pub mod retry;
pub mod session;
pub mod stop;
pub mod traits;

// Core exports
pub use error::{Error, Result, SyncError};
pub use session::{
    CACHE_KEY, DEFAULT_FLUSH_BATCH_SIZE, FixOutcome, SESSION_KEY, SessionOptions, SessionState,
    SessionStatus, TrackingSession,
};
pub use traits::SyncClient;

pub use cache::NearbyCache;
pub use classifier::{classify, is_outside_synced_region};
pub use decision::{Decision, derive_events, evaluate, evaluate_membership, should_sync};
pub use detector::{MembershipChanges, SyncTrigger, has_changed, sync_triggers};
pub use events::{DEFAULT_EVENT_CAPACITY, EventDispatcher, EventReceiver, TrackingEvent};
pub use handle::{DEFAULT_COMMAND_CAPACITY, SessionHandle};
#[cfg(feature = "http-client")]
pub use http_client::HttpSyncClient;
pub use metrics::{MetricsSnapshot, TrackingMetrics};
pub use mock::{MemoryStore, MockCall, MockReply, MockSyncClient};
pub use replay::{
    DEFAULT_REPLAY_CAPACITY, EXTENDED_REPLAY_CAPACITY, REPLAY_KEY, ReplayBuffer, ReplayEntry,
};
pub use retry::{RetryConfig, RetryingDispatcher};
pub use stop::StopDetector;

// Re-export from waypost-types
pub use waypost_types::{
    Coordinate, DeviceMetadata, FixSource, GeofenceRecord, KeyValueStore, LocationFix, Membership,
    NearbyUpdate, RecordKind, SyncRequest, SyncResponse, TrackEvent, TrackingConfig, TripOptions,
};
