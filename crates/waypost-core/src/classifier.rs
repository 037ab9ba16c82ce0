//! Local proximity classification.
//!
//! Computes which cached records contain a fix without calling the server.
//! Both functions are pure: identical inputs always give identical outputs,
//! and an empty cache simply yields empty membership.

use waypost_types::{LocationFix, Membership};

use crate::cache::NearbyCache;

/// Compute the membership of `fix` against the cached records.
///
/// Geofences are tested with their declared geometry (circle or polygon);
/// beacons and places with their proximity radius. The result only ever
/// contains IDs present in `cache`.
pub fn classify(fix: &LocationFix, cache: &NearbyCache) -> Membership {
    let point = &fix.coordinate;
    let mut membership = Membership::new();

    membership.geofences = cache
        .geofences()
        .iter()
        .filter(|g| g.geometry.contains(point))
        .map(|g| g.id.clone())
        .collect();

    membership.beacons = cache
        .beacons()
        .iter()
        .filter(|b| b.contains(point))
        .map(|b| b.id.clone())
        .collect();

    membership.places = cache
        .places()
        .iter()
        .filter(|p| p.contains(point))
        .map(|p| p.id.clone())
        .collect();

    membership
}

/// Returns `true` if `fix` lies outside the cache's synced region.
///
/// A cache that has never been synced has no region, so every fix is
/// outside it: with no local knowledge the server must be consulted.
pub fn is_outside_synced_region(fix: &LocationFix, cache: &NearbyCache) -> bool {
    match cache.synced_region() {
        Some(region) => !region.contains(&fix.coordinate),
        None => true,
    }
}
