//! Records exchanged with the remote sync collaborator.

use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::TrackingConfig;
use crate::types::{
    BeaconRecord, GeofenceRecord, LocationFix, Membership, Metadata, PlaceRecord, SyncedRegion,
    TrackEvent,
};

/// Identity and descriptive data for the tracked device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceMetadata {
    /// Stable per-install device identifier.
    pub device_id: String,
    /// Host application's user identifier.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub user_id: Option<String>,
    /// Human-readable description.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub description: Option<String>,
    /// Arbitrary metadata.
    pub metadata: Metadata,
    /// Version of this library, reported to the server.
    pub sdk_version: String,
}

impl DeviceMetadata {
    /// Create metadata for a device, stamping the library version.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// Set the user ID.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Travel mode of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TripMode {
    /// Driving.
    #[default]
    Car,
    /// Walking.
    Foot,
    /// Cycling.
    Bike,
    /// Public transit.
    Transit,
}

/// Options describing an explicit trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TripOptions {
    /// Identifier in the host application's system.
    pub external_id: String,
    /// Tag of the destination geofence, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub destination_geofence_tag: Option<String>,
    /// Travel mode.
    pub mode: TripMode,
    /// Arbitrary metadata.
    pub metadata: Metadata,
}

impl TripOptions {
    /// Create trip options with an external ID.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Default::default()
        }
    }

    /// Set the destination geofence tag.
    #[must_use]
    pub fn with_destination(mut self, tag: impl Into<String>) -> Self {
        self.destination_geofence_tag = Some(tag.into());
        self
    }

    /// Set the travel mode.
    #[must_use]
    pub fn with_mode(mut self, mode: TripMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Everything the server needs to process one observation.
///
/// Replay entries store this verbatim, so it must be self-contained.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncRequest {
    /// Unique request identifier, used by the server to de-duplicate replays.
    pub request_id: Uuid,
    /// The observation.
    pub fix: LocationFix,
    /// Whether the device was stopped at the time of the fix.
    pub stopped: bool,
    /// Membership computed locally for this fix.
    pub membership: Membership,
    /// Entries and exits relative to the confirmed membership.
    #[cfg_attr(feature = "serde", serde(default))]
    pub events: Vec<TrackEvent>,
    /// Device identity.
    pub device: DeviceMetadata,
    /// Active trip, if any.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub trip: Option<TripOptions>,
    /// `true` when sent from the replay buffer rather than live.
    #[cfg_attr(feature = "serde", serde(default))]
    pub replayed: bool,
}

impl SyncRequest {
    /// Create a live request with a fresh identifier.
    pub fn new(
        fix: LocationFix,
        stopped: bool,
        membership: Membership,
        events: Vec<TrackEvent>,
        device: DeviceMetadata,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            fix,
            stopped,
            membership,
            events,
            device,
            trip: None,
            replayed: false,
        }
    }

    /// Attach the active trip.
    #[must_use]
    pub fn with_trip(mut self, trip: Option<TripOptions>) -> Self {
        self.trip = trip;
        self
    }

    /// Copy of this request marked as a replay.
    #[must_use]
    pub fn as_replay(&self) -> Self {
        Self {
            replayed: true,
            ..self.clone()
        }
    }
}

/// A fresh nearby set pushed by the server.
///
/// Each present field replaces the corresponding cached set wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NearbyUpdate {
    /// Nearby geofences.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub geofences: Option<Vec<GeofenceRecord>>,
    /// Nearby beacons.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub beacons: Option<Vec<BeaconRecord>>,
    /// Beacon UUIDs to monitor at the platform level.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub beacon_uuids: Option<Vec<Uuid>>,
    /// Nearby places.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub places: Option<Vec<PlaceRecord>>,
    /// Region within which the new geofence set is authoritative.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub synced_region: Option<SyncedRegion>,
}

/// Server reply to a successful sync.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SyncResponse {
    /// Membership the server now considers authoritative.
    pub membership: Membership,
    /// Replacement nearby sets, if the server sent any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub nearby: Option<NearbyUpdate>,
    /// Replacement tracking config, if the server sent one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub config: Option<TrackingConfig>,
}

impl SyncResponse {
    /// A response confirming `membership` with no cache or config changes.
    #[must_use]
    pub fn confirming(membership: Membership) -> Self {
        Self {
            membership,
            ..Default::default()
        }
    }

    /// Attach a nearby update.
    #[must_use]
    pub fn with_nearby(mut self, nearby: NearbyUpdate) -> Self {
        self.nearby = Some(nearby);
        self
    }

    /// Attach a config update.
    #[must_use]
    pub fn with_config(mut self, config: TrackingConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, FixSource};

    fn fix() -> LocationFix {
        LocationFix::new(Coordinate::new(1.0, 2.0), 5.0, FixSource::Mock)
    }

    #[test]
    fn test_device_metadata_stamps_version() {
        let device = DeviceMetadata::new("dev-1").with_user_id("user-9");
        assert_eq!(device.device_id, "dev-1");
        assert_eq!(device.user_id.as_deref(), Some("user-9"));
        assert!(!device.sdk_version.is_empty());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = SyncRequest::new(fix(), false, Membership::new(), vec![], DeviceMetadata::default());
        let b = SyncRequest::new(fix(), false, Membership::new(), vec![], DeviceMetadata::default());
        assert_ne!(a.request_id, b.request_id);
        assert!(!a.replayed);
    }

    #[test]
    fn test_as_replay_keeps_request_id() {
        let req = SyncRequest::new(fix(), true, Membership::new(), vec![], DeviceMetadata::default())
            .with_trip(Some(TripOptions::new("trip-1")));
        let replay = req.as_replay();
        assert!(replay.replayed);
        assert_eq!(replay.request_id, req.request_id);
        assert_eq!(replay.trip, req.trip);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_response_parses_minimal_json() {
        use crate::types::RecordKind;

        let json = r#"{"membership": {"geofences": ["g1"]}}"#;
        let response: SyncResponse = serde_json::from_str(json).unwrap();
        assert!(response.membership.ids(RecordKind::Geofence).contains("g1"));
        assert!(response.nearby.is_none());
        assert!(response.config.is_none());
    }
}
