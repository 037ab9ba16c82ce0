//! Platform-agnostic types for the Waypost location tracking engine.
//!
//! This crate provides the data model shared by the tracking engine
//! (waypost-core), storage backends (waypost-store), and tooling.
//!
//! # Features
//!
//! - Location fixes, coordinates, and fix sources
//! - Geofence, beacon, and place records with their geometries
//! - Membership sets and entry/exit events
//! - Tracking configuration and presets
//! - Sync request/response records for the remote collaborator
//! - Haversine and ray-casting containment tests
//! - The durable key-value storage trait
//!
//! # Example
//!
//! ```
//! use waypost_types::{Coordinate, GeofenceRecord};
//!
//! let fence = GeofenceRecord::circle("home", Coordinate::new(52.52, 13.405), 150.0);
//! assert!(fence.geometry.contains(&Coordinate::new(52.5201, 13.4051)));
//! ```

pub mod config;
pub mod error;
pub mod geometry;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{DesiredAccuracy, ReplayPolicy, TrackingConfig};
pub use error::{StorageError, ValidationError, ValidationResult};
pub use storage::{KeyValueStore, StorageResult};
pub use sync::{DeviceMetadata, NearbyUpdate, SyncRequest, SyncResponse, TripMode, TripOptions};
pub use types::{
    BeaconRecord, Coordinate, FixSource, GeofenceRecord, Geometry, LocationFix, Membership,
    Metadata, PlaceRecord, RecordKind, SyncedRegion, TrackEvent, Transition,
};
