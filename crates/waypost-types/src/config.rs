//! Tracking configuration.
//!
//! A [`TrackingConfig`] is an immutable value: the session swaps whole
//! configs rather than mutating one in place. Three presets cover the
//! usual battery/latency trade-offs:
//!
//! | Preset | Moving interval | Stopped interval | Replay |
//! |--------|-----------------|------------------|--------|
//! | [`continuous`](TrackingConfig::continuous) | 30 s | 30 s | none |
//! | [`responsive`](TrackingConfig::responsive) (default) | 150 s | 0 (off) | all |
//! | [`efficient`](TrackingConfig::efficient) | 1200 s | 3600 s | stops |

use core::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Requested sensor accuracy, passed through to the sensor collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DesiredAccuracy {
    /// Best available (GPS).
    High,
    /// Balanced (Wi-Fi / cell assisted).
    #[default]
    Medium,
    /// Coarse (cell only).
    Low,
}

/// Which observations are kept for replay when a sync cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ReplayPolicy {
    /// Buffer every undeliverable observation.
    #[default]
    All,
    /// Buffer only observations that carry state: a stop, or an entry/exit.
    Stops,
    /// Never buffer; undeliverable observations are dropped.
    None,
}

impl ReplayPolicy {
    /// Returns `true` if an observation with the given properties should be buffered.
    #[must_use]
    pub fn admits(&self, stopped: bool, has_events: bool) -> bool {
        match self {
            ReplayPolicy::All => true,
            ReplayPolicy::Stops => stopped || has_events,
            ReplayPolicy::None => false,
        }
    }
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayPolicy::All => f.write_str("all"),
            ReplayPolicy::Stops => f.write_str("stops"),
            ReplayPolicy::None => f.write_str("none"),
        }
    }
}

/// Options that control when fixes are collected and synced.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrackingConfig {
    /// Update interval while stopped, in seconds (0 disables updates while stopped).
    pub stopped_update_interval: u64,
    /// Update interval while moving, in seconds.
    pub moving_update_interval: u64,
    /// Requested sensor accuracy.
    pub desired_accuracy: DesiredAccuracy,
    /// How long the device must stay put before it counts as stopped, in seconds.
    pub stop_duration: u64,
    /// How far the device may drift and still count as stopped, in meters.
    pub stop_distance: f64,
    /// Sync when geofence membership changes.
    pub sync_geofences: bool,
    /// Sync when beacon membership changes.
    pub sync_beacons: bool,
    /// Sync when place membership changes.
    pub sync_places: bool,
    /// Sync every fix regardless of membership.
    pub sync_all_locations: bool,
    /// Which undeliverable observations to buffer.
    pub replay: ReplayPolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::responsive()
    }
}

impl TrackingConfig {
    /// Frequent updates; every fix is synced and nothing is replayed.
    #[must_use]
    pub fn continuous() -> Self {
        Self {
            stopped_update_interval: 30,
            moving_update_interval: 30,
            desired_accuracy: DesiredAccuracy::High,
            stop_duration: 140,
            stop_distance: 70.0,
            sync_geofences: true,
            sync_beacons: true,
            sync_places: true,
            sync_all_locations: true,
            replay: ReplayPolicy::None,
        }
    }

    /// Balanced updates; membership changes are synced and all failures replayed.
    #[must_use]
    pub fn responsive() -> Self {
        Self {
            stopped_update_interval: 0,
            moving_update_interval: 150,
            desired_accuracy: DesiredAccuracy::Medium,
            stop_duration: 140,
            stop_distance: 70.0,
            sync_geofences: true,
            sync_beacons: true,
            sync_places: true,
            sync_all_locations: false,
            replay: ReplayPolicy::All,
        }
    }

    /// Sparse updates; only geofence changes are synced and only stops replayed.
    #[must_use]
    pub fn efficient() -> Self {
        Self {
            stopped_update_interval: 3600,
            moving_update_interval: 1200,
            desired_accuracy: DesiredAccuracy::Low,
            stop_duration: 0,
            stop_distance: 0.0,
            sync_geofences: true,
            sync_beacons: false,
            sync_places: false,
            sync_all_locations: false,
            replay: ReplayPolicy::Stops,
        }
    }

    /// Look up a preset by name (`continuous`, `responsive`, `efficient`).
    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "continuous" => Some(Self::continuous()),
            "responsive" => Some(Self::responsive()),
            "efficient" => Some(Self::efficient()),
            _ => None,
        }
    }

    /// Enable or disable syncing every location.
    #[must_use]
    pub fn sync_all_locations(mut self, enabled: bool) -> Self {
        self.sync_all_locations = enabled;
        self
    }

    /// Set the replay policy.
    #[must_use]
    pub fn replay(mut self, policy: ReplayPolicy) -> Self {
        self.replay = policy;
        self
    }

    /// Set stop detection thresholds.
    #[must_use]
    pub fn stop_detection(mut self, duration_secs: u64, distance_m: f64) -> Self {
        self.stop_duration = duration_secs;
        self.stop_distance = distance_m;
        self
    }

    /// Stop duration as a [`Duration`].
    #[must_use]
    pub fn stop_duration(&self) -> Duration {
        Duration::from_secs(self.stop_duration)
    }

    /// Returns `true` if stop detection is enabled.
    #[must_use]
    pub fn detects_stops(&self) -> bool {
        self.stop_duration > 0 && self.stop_distance > 0.0
    }

    /// Update interval for the current motion state.
    ///
    /// Returns `None` when updates are disabled in that state.
    #[must_use]
    pub fn update_interval(&self, stopped: bool) -> Option<Duration> {
        let secs = if stopped {
            self.stopped_update_interval
        } else {
            self.moving_update_interval
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Validate the configuration.
    ///
    /// Checks that:
    /// - the moving interval is non-zero
    /// - `stop_distance` is a finite, non-negative number
    /// - stop duration and distance are either both set or both zero
    pub fn validate(&self) -> ValidationResult<()> {
        if self.moving_update_interval == 0 {
            return Err(ValidationError::invalid_config(
                "moving_update_interval must be > 0",
            ));
        }
        if !self.stop_distance.is_finite() || self.stop_distance < 0.0 {
            return Err(ValidationError::invalid_config(
                "stop_distance must be a non-negative number",
            ));
        }
        if (self.stop_duration == 0) != (self.stop_distance == 0.0) {
            return Err(ValidationError::invalid_config(
                "stop_duration and stop_distance must both be set or both be zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            TrackingConfig::continuous(),
            TrackingConfig::responsive(),
            TrackingConfig::efficient(),
        ] {
            config.validate().unwrap();
        }
        assert_eq!(TrackingConfig::default(), TrackingConfig::responsive());
    }

    #[test]
    fn test_preset_lookup() {
        assert_eq!(
            TrackingConfig::preset("Efficient"),
            Some(TrackingConfig::efficient())
        );
        assert!(TrackingConfig::preset("turbo").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrackingConfig::responsive();
        config.moving_update_interval = 0;
        assert!(config.validate().is_err());

        let config = TrackingConfig::responsive().stop_detection(0, 50.0);
        assert!(config.validate().is_err());

        let config = TrackingConfig::responsive().stop_detection(60, f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_interval() {
        let config = TrackingConfig::responsive();
        assert_eq!(config.update_interval(false), Some(Duration::from_secs(150)));
        assert_eq!(config.update_interval(true), None);

        let config = TrackingConfig::efficient();
        assert_eq!(config.update_interval(true), Some(Duration::from_secs(3600)));
        assert!(!config.detects_stops());
    }

    #[test]
    fn test_replay_policy_admits() {
        assert!(ReplayPolicy::All.admits(false, false));
        assert!(ReplayPolicy::Stops.admits(true, false));
        assert!(ReplayPolicy::Stops.admits(false, true));
        assert!(!ReplayPolicy::Stops.admits(false, false));
        assert!(!ReplayPolicy::None.admits(true, true));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"sync_all_locations": true, "replay": "stops"}"#;
        let config: TrackingConfig = serde_json::from_str(json).unwrap();
        assert!(config.sync_all_locations);
        assert_eq!(config.replay, ReplayPolicy::Stops);
        assert_eq!(config.moving_update_interval, 150);
    }
}
