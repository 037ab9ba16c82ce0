//! Trace and server-script files for `waypost simulate`.
//!
//! A trace is a JSON array of steps fed to the session in order:
//!
//! ```json
//! [
//!   {"type": "fix", "lat": 52.52, "lon": 13.405, "accuracy": 10, "offset_secs": 0},
//!   {"type": "beacon", "id": "front-door", "entered": true},
//!   {"type": "start_trip", "trip": {"external_id": "order-1"}, "preset": "continuous"},
//!   {"type": "complete_trip"},
//!   {"type": "stop"}
//! ]
//! ```
//!
//! A server script lists the mock server's replies, one per call. Once the
//! list runs out the mock echoes the request's membership.
//!
//! ```json
//! {
//!   "echo_nearby": {"geofences": [], "synced_region": {"center": {"latitude": 0, "longitude": 0}, "radius": 5000}},
//!   "replies": [{"reply": "offline"}, {"reply": "fail", "status": 503}, {"reply": "echo"}]
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use waypost_core::{MockReply, MockSyncClient, SyncError};
use waypost_types::{
    Coordinate, FixSource, LocationFix, NearbyUpdate, SyncResponse, TrackingConfig, TripOptions,
};

fn default_accuracy() -> f64 {
    10.0
}

/// One step of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Start tracking, optionally with a preset other than the configured one.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset: Option<String>,
    },
    /// A location fix.
    Fix {
        lat: f64,
        lon: f64,
        #[serde(default = "default_accuracy")]
        accuracy: f64,
        /// Seconds after the start of the simulation. Defaults to the wall clock.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset_secs: Option<i64>,
        #[serde(default)]
        source: FixSource,
    },
    /// A beacon entering or leaving range.
    Beacon { id: String, entered: bool },
    /// Start a trip with an optional preset or full config.
    StartTrip {
        trip: TripOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<TrackingConfig>,
    },
    CompleteTrip,
    CancelTrip,
    /// Replace the config in effect.
    UpdateConfig { config: TrackingConfig },
    /// Flush the replay buffer.
    Flush,
    /// Take the server offline or bring it back.
    Offline { offline: bool },
    Stop,
}

impl Step {
    /// Short name for output.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Start { .. } => "start",
            Step::Fix { .. } => "fix",
            Step::Beacon { .. } => "beacon",
            Step::StartTrip { .. } => "start_trip",
            Step::CompleteTrip => "complete_trip",
            Step::CancelTrip => "cancel_trip",
            Step::UpdateConfig { .. } => "update_config",
            Step::Flush => "flush",
            Step::Offline { .. } => "offline",
            Step::Stop => "stop",
        }
    }
}

/// Build the fix for a `fix` step relative to `start`.
pub fn fix_at(
    start: OffsetDateTime,
    lat: f64,
    lon: f64,
    accuracy: f64,
    offset_secs: Option<i64>,
    source: FixSource,
) -> LocationFix {
    let timestamp = match offset_secs {
        Some(secs) => start + time::Duration::seconds(secs),
        None => OffsetDateTime::now_utc(),
    };
    LocationFix::at(timestamp, Coordinate::new(lat, lon), accuracy, source)
}

/// Resolve the config a `start_trip` step asks for.
pub fn trip_config(
    preset: Option<&str>,
    config: Option<&TrackingConfig>,
) -> Result<Option<TrackingConfig>> {
    match (config, preset) {
        (Some(config), _) => Ok(Some(config.clone())),
        (None, Some(name)) => TrackingConfig::preset(name)
            .map(Some)
            .ok_or_else(|| anyhow!("Unknown tracking preset '{}'", name)),
        (None, None) => Ok(None),
    }
}

/// Parse a trace file.
pub fn load_trace(path: &Path) -> Result<Vec<Step>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse trace: {}", path.display()))
}

/// One scripted reply from the mock server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ScriptedReply {
    /// Confirm the request's membership.
    Echo,
    /// Return this response.
    Respond { response: SyncResponse },
    /// Fail with an HTTP status.
    Fail {
        status: u16,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Fail as if the network were down.
    Offline,
    /// Fail as if the request timed out.
    Timeout {
        #[serde(default = "default_timeout_secs")]
        secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    10
}

impl From<ScriptedReply> for MockReply {
    fn from(reply: ScriptedReply) -> Self {
        match reply {
            ScriptedReply::Echo => MockReply::Echo,
            ScriptedReply::Respond { response } => MockReply::Respond(response),
            ScriptedReply::Fail {
                status,
                message,
                retry_after_secs,
            } => match SyncError::from_status(status, message) {
                SyncError::RateLimited { .. } => MockReply::Fail(SyncError::RateLimited {
                    retry_after: retry_after_secs.map(Duration::from_secs),
                }),
                other => MockReply::Fail(other),
            },
            ScriptedReply::Offline => MockReply::Fail(SyncError::network("offline")),
            ScriptedReply::Timeout { secs } => {
                MockReply::Fail(SyncError::Timeout(Duration::from_secs(secs)))
            }
        }
    }
}

/// Behavior of the mock server for a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerScript {
    /// Nearby sets attached to every echoed response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo_nearby: Option<NearbyUpdate>,
    /// Replies consumed one per call.
    pub replies: Vec<ScriptedReply>,
    /// Simulated round-trip time in milliseconds.
    pub latency_ms: u64,
}

impl ServerScript {
    /// Parse a script file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read server script: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse server script: {}", path.display()))
    }

    /// Build a mock server that follows this script.
    pub fn into_mock(self) -> MockSyncClient {
        let server = MockSyncClient::new();
        server.set_echo_nearby(self.echo_nearby);
        server.set_latency(Duration::from_millis(self.latency_ms));
        for reply in self.replies {
            server.push_reply(reply.into());
        }
        server
    }
}
