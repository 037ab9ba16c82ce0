//! Local cache of nearby records and server-confirmed membership.
//!
//! The cache holds the most recently synced geofence, beacon, and place
//! sets plus the membership the server last confirmed. Record sets are only
//! ever replaced wholesale. Whenever a set is replaced, confirmed IDs that no
//! longer refer to a cached record are dropped, so confirmed membership is
//! always a subset of the cached record IDs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use waypost_types::{
    BeaconRecord, GeofenceRecord, Membership, NearbyUpdate, PlaceRecord, RecordKind, SyncedRegion,
};

/// Nearby records, synced region, and confirmed membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NearbyCache {
    geofences: Vec<GeofenceRecord>,
    beacons: Vec<BeaconRecord>,
    beacon_uuids: Vec<Uuid>,
    places: Vec<PlaceRecord>,
    synced_region: Option<SyncedRegion>,
    confirmed: Membership,
}

impl NearbyCache {
    /// Create an empty cache with no synced region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached geofences.
    pub fn geofences(&self) -> &[GeofenceRecord] {
        &self.geofences
    }

    /// Cached beacons.
    pub fn beacons(&self) -> &[BeaconRecord] {
        &self.beacons
    }

    /// Beacon UUIDs to monitor at the platform level.
    pub fn beacon_uuids(&self) -> &[Uuid] {
        &self.beacon_uuids
    }

    /// Cached places.
    pub fn places(&self) -> &[PlaceRecord] {
        &self.places
    }

    /// Region within which the cache is authoritative, if any sync has happened.
    pub fn synced_region(&self) -> Option<&SyncedRegion> {
        self.synced_region.as_ref()
    }

    /// Returns `true` if no records of any kind are cached.
    pub fn is_empty(&self) -> bool {
        self.geofences.is_empty() && self.beacons.is_empty() && self.places.is_empty()
    }

    /// Replace the geofence set and the synced region together.
    pub fn replace_geofences(&mut self, records: Vec<GeofenceRecord>, synced_region: SyncedRegion) {
        self.swap_geofences(records);
        self.synced_region = Some(synced_region);
    }

    /// Replace only the synced region.
    pub fn set_synced_region(&mut self, synced_region: SyncedRegion) {
        self.synced_region = Some(synced_region);
    }

    /// Replace the beacon set.
    pub fn replace_beacons(&mut self, records: Vec<BeaconRecord>) {
        debug!("Replacing {} cached beacons with {}", self.beacons.len(), records.len());
        self.beacons = records;
        self.prune_confirmed(RecordKind::Beacon);
    }

    /// Replace the monitored beacon UUIDs.
    pub fn replace_beacon_uuids(&mut self, uuids: Vec<Uuid>) {
        self.beacon_uuids = uuids;
    }

    /// Replace the place set.
    pub fn replace_places(&mut self, records: Vec<PlaceRecord>) {
        debug!("Replacing {} cached places with {}", self.places.len(), records.len());
        self.places = records;
        self.prune_confirmed(RecordKind::Place);
    }

    /// Apply every set present in a server nearby update.
    pub fn apply_nearby_update(&mut self, update: NearbyUpdate) {
        match (update.geofences, update.synced_region) {
            (Some(records), Some(region)) => self.replace_geofences(records, region),
            (Some(records), None) => self.swap_geofences(records),
            (None, Some(region)) => self.set_synced_region(region),
            (None, None) => {}
        }
        if let Some(records) = update.beacons {
            self.replace_beacons(records);
        }
        if let Some(uuids) = update.beacon_uuids {
            self.replace_beacon_uuids(uuids);
        }
        if let Some(records) = update.places {
            self.replace_places(records);
        }
    }

    /// The last server-confirmed membership snapshot.
    pub fn confirmed_membership(&self) -> &Membership {
        &self.confirmed
    }

    /// Overwrite confirmed membership after a successful sync.
    ///
    /// IDs the cache holds no record for are discarded to keep confirmed
    /// membership a subset of the cached records.
    pub fn apply_server_membership(&mut self, membership: Membership) {
        self.confirmed = membership;
        for kind in RecordKind::ALL {
            self.prune_confirmed(kind);
        }
    }

    /// IDs of all cached records of one kind.
    pub fn record_ids(&self, kind: RecordKind) -> BTreeSet<&str> {
        match kind {
            RecordKind::Geofence => self.geofences.iter().map(|r| r.id.as_str()).collect(),
            RecordKind::Beacon => self.beacons.iter().map(|r| r.id.as_str()).collect(),
            RecordKind::Place => self.places.iter().map(|r| r.id.as_str()).collect(),
        }
    }

    /// Returns `true` if a record of `kind` with `id` is cached.
    pub fn contains_record(&self, kind: RecordKind, id: &str) -> bool {
        match kind {
            RecordKind::Geofence => self.geofences.iter().any(|r| r.id == id),
            RecordKind::Beacon => self.beacons.iter().any(|r| r.id == id),
            RecordKind::Place => self.places.iter().any(|r| r.id == id),
        }
    }

    /// Drop all records, the synced region, and confirmed membership.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn swap_geofences(&mut self, records: Vec<GeofenceRecord>) {
        debug!(
            "Replacing {} cached geofences with {}",
            self.geofences.len(),
            records.len()
        );
        self.geofences = records;
        self.prune_confirmed(RecordKind::Geofence);
    }

    fn prune_confirmed(&mut self, kind: RecordKind) {
        let known: BTreeSet<String> = self
            .record_ids(kind)
            .into_iter()
            .map(str::to_string)
            .collect();
        self.confirmed.ids_mut(kind).retain(|id| known.contains(id));
    }
}
