//! Stop detection.
//!
//! The detector anchors on a fix. The device counts as stopped once it has
//! stayed within `stop_distance` meters of the anchor for at least
//! `stop_duration`. Any fix farther than `stop_distance` from the anchor
//! becomes the new anchor and clears the stopped flag.

use tracing::debug;
use waypost_types::{Coordinate, LocationFix, TrackingConfig};

/// Tracks whether the device has come to rest.
#[derive(Debug, Clone, Default)]
pub struct StopDetector {
    anchor: Option<LocationFix>,
    stopped: bool,
}

impl StopDetector {
    /// Create a detector with no anchor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device is currently considered stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Position the detector is measuring drift from.
    pub fn anchor(&self) -> Option<&Coordinate> {
        self.anchor.as_ref().map(|fix| &fix.coordinate)
    }

    /// Feed a fix and return the updated stopped flag.
    ///
    /// With stop detection disabled in `config` the device is never stopped.
    /// Fixes older than the anchor are ignored.
    pub fn update(&mut self, fix: &LocationFix, config: &TrackingConfig) -> bool {
        if !config.detects_stops() {
            self.anchor = Some(fix.clone());
            self.stopped = false;
            return false;
        }

        let Some(anchor) = &self.anchor else {
            self.anchor = Some(fix.clone());
            self.stopped = false;
            return false;
        };

        if fix.timestamp < anchor.timestamp {
            return self.stopped;
        }

        let drift = anchor.coordinate.distance_to(&fix.coordinate);
        if drift > config.stop_distance {
            if self.stopped {
                debug!("Moved {:.0} m from stop anchor, now moving", drift);
            }
            self.anchor = Some(fix.clone());
            self.stopped = false;
            return false;
        }

        let dwell = fix.timestamp - anchor.timestamp;
        if !self.stopped && dwell >= config.stop_duration() {
            debug!("Stationary for {} within {:.0} m, now stopped", dwell, drift);
            self.stopped = true;
        }
        self.stopped
    }

    /// Forget the anchor.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
