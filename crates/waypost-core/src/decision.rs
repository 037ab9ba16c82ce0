//! Track decisions: should this fix be synced, and what changed?
//!
//! Combines [`classify`](crate::classifier::classify) and the detector's
//! trigger policy. Everything here is a pure function of its inputs, so
//! asking twice about the same fix gives the same answer.

use waypost_types::{LocationFix, Membership, RecordKind, TrackEvent, TrackingConfig};

use crate::cache::NearbyCache;
use crate::classifier::{classify, is_outside_synced_region};
use crate::detector::{MembershipChanges, SyncTrigger, sync_triggers};

/// The outcome of evaluating one fix against the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Membership computed for the fix.
    pub membership: Membership,
    /// Entries and exits relative to the confirmed membership.
    pub events: Vec<TrackEvent>,
    /// Reasons a sync is required; empty when the fix can be handled locally.
    pub triggers: Vec<SyncTrigger>,
}

impl Decision {
    /// Returns `true` if the fix must be sent to the server.
    #[must_use]
    pub fn should_sync(&self) -> bool {
        !self.triggers.is_empty()
    }

    /// Returns `true` if the fix left the synced region.
    #[must_use]
    pub fn outside_synced_region(&self) -> bool {
        self.triggers.contains(&SyncTrigger::OutsideSyncedRegion)
    }
}

/// Decide whether `fix` must be synced under `config`.
#[must_use]
pub fn should_sync(fix: &LocationFix, cache: &NearbyCache, config: &TrackingConfig) -> bool {
    evaluate(fix, cache, config).should_sync()
}

/// Classify `fix` and evaluate it against the confirmed membership.
#[must_use]
pub fn evaluate(fix: &LocationFix, cache: &NearbyCache, config: &TrackingConfig) -> Decision {
    evaluate_membership(fix, classify(fix, cache), cache, config)
}

/// Evaluate an already computed membership for `fix`.
///
/// Used when membership has inputs beyond geometry, such as beacons
/// reported in range by the sensor.
#[must_use]
pub fn evaluate_membership(
    fix: &LocationFix,
    membership: Membership,
    cache: &NearbyCache,
    config: &TrackingConfig,
) -> Decision {
    let confirmed = cache.confirmed_membership();
    let changes = MembershipChanges::between(&membership, confirmed);
    let triggers = sync_triggers(is_outside_synced_region(fix, cache), &changes, config);
    let events = derive_events(&membership, confirmed);
    Decision {
        membership,
        events,
        triggers,
    }
}

/// Derive entry and exit events from two membership snapshots.
///
/// IDs only in `current` are entries, IDs only in `confirmed` are exits.
/// All entries come before all exits. Within each group events are sorted
/// by identifier, then by record kind (geofence, beacon, place).
#[must_use]
pub fn derive_events(current: &Membership, confirmed: &Membership) -> Vec<TrackEvent> {
    let mut entries = Vec::new();
    let mut exits = Vec::new();

    for kind in RecordKind::ALL {
        let now = current.ids(kind);
        let before = confirmed.ids(kind);
        entries.extend(
            now.difference(before)
                .map(|id| TrackEvent::entered(kind, id.as_str())),
        );
        exits.extend(
            before
                .difference(now)
                .map(|id| TrackEvent::exited(kind, id.as_str())),
        );
    }

    let by_id = |a: &TrackEvent, b: &TrackEvent| a.id.cmp(&b.id).then(a.kind.cmp(&b.kind));
    entries.sort_by(by_id);
    exits.sort_by(by_id);
    entries.extend(exits);
    entries
}
