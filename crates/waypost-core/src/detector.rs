//! State change detection.
//!
//! Compares locally computed membership with the server-confirmed snapshot
//! and combines the per-kind results with the active [`TrackingConfig`]
//! into the set of reasons a sync is required.

use std::collections::BTreeSet;
use std::fmt;

use waypost_types::{Membership, RecordKind, TrackingConfig};

/// Returns `true` if the two ID sets differ.
///
/// Only identifiers are compared; a record whose metadata or geometry
/// changed under the same ID is not a state change.
#[must_use]
pub fn has_changed(current: &BTreeSet<String>, confirmed: &BTreeSet<String>) -> bool {
    current.symmetric_difference(confirmed).next().is_some()
}

/// Which record kinds differ between current and confirmed membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipChanges {
    /// Geofence membership differs.
    pub geofences: bool,
    /// Beacon membership differs.
    pub beacons: bool,
    /// Place membership differs.
    pub places: bool,
}

impl MembershipChanges {
    /// Diff `current` against `confirmed` for every record kind.
    #[must_use]
    pub fn between(current: &Membership, confirmed: &Membership) -> Self {
        Self {
            geofences: has_changed(&current.geofences, &confirmed.geofences),
            beacons: has_changed(&current.beacons, &confirmed.beacons),
            places: has_changed(&current.places, &confirmed.places),
        }
    }

    /// Whether membership of `kind` changed.
    #[must_use]
    pub fn changed(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Geofence => self.geofences,
            RecordKind::Beacon => self.beacons,
            RecordKind::Place => self.places,
        }
    }

    /// Returns `true` if any kind changed.
    #[must_use]
    pub fn any(&self) -> bool {
        self.geofences || self.beacons || self.places
    }
}

/// A reason the current fix must be sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// The fix is outside the region where the cache is authoritative.
    OutsideSyncedRegion,
    /// Membership of a kind whose sync flag is enabled changed.
    MembershipChanged(RecordKind),
    /// The config syncs every location.
    AllLocations,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::OutsideSyncedRegion => f.write_str("outside synced region"),
            SyncTrigger::MembershipChanged(kind) => write!(f, "{kind} membership changed"),
            SyncTrigger::AllLocations => f.write_str("sync all locations"),
        }
    }
}

fn sync_flag(config: &TrackingConfig, kind: RecordKind) -> bool {
    match kind {
        RecordKind::Geofence => config.sync_geofences,
        RecordKind::Beacon => config.sync_beacons,
        RecordKind::Place => config.sync_places,
    }
}

/// Apply the trigger policy.
///
/// Leaving the synced region always triggers. A membership change triggers
/// only when the matching sync flag is enabled. `sync_all_locations`
/// triggers unconditionally. An empty result means the fix can be
/// handled locally.
#[must_use]
pub fn sync_triggers(
    outside_synced_region: bool,
    changes: &MembershipChanges,
    config: &TrackingConfig,
) -> Vec<SyncTrigger> {
    let mut triggers = Vec::new();
    if outside_synced_region {
        triggers.push(SyncTrigger::OutsideSyncedRegion);
    }
    for kind in RecordKind::ALL {
        if changes.changed(kind) && sync_flag(config, kind) {
            triggers.push(SyncTrigger::MembershipChanged(kind));
        }
    }
    if config.sync_all_locations {
        triggers.push(SyncTrigger::AllLocations);
    }
    triggers
}
