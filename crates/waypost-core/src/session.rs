//! The tracking session state machine.
//!
//! A [`TrackingSession`] exclusively owns the [`NearbyCache`], the
//! [`ReplayBuffer`], and the session state. Fixes are processed one at a
//! time through `&mut self`, so fix N is fully classified, dispatched, and
//! applied before fix N+1 is looked at.
//!
//! # States
//!
//! ```text
//!            start_tracking(c)              start_trip(t, o)
//!  Stopped ────────────────────▶ Tracking(c) ───────────────▶ OnTrip(t, o ?: c, Some(c))
//!     ▲  ◀──────────────────────     ▲                             │
//!     │        stop_tracking         └──── complete/cancel_trip ───┘
//!     │                                                            │
//!     └──────────── complete/cancel_trip when saved is None ───────┘
//! ```
//!
//! The trip config and the config to restore travel together in
//! [`SessionState::OnTrip`], so they can never disagree.
//!
//! # Cancellation
//!
//! Each active period owns a [`CancellationToken`]. Stopping cancels it,
//! which ends pending retry waits immediately. An attempt already in flight
//! may still complete, but its result is discarded because the token it
//! was started with is cancelled.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use waypost_types::{
    DeviceMetadata, KeyValueStore, LocationFix, Membership, RecordKind, StorageError, SyncRequest,
    SyncResponse, TrackEvent, TrackingConfig, TripOptions,
};

use crate::cache::NearbyCache;
use crate::classifier::classify;
use crate::decision::{derive_events, evaluate_membership};
use crate::error::{Error, Result, SyncError};
use crate::events::{DEFAULT_EVENT_CAPACITY, EventDispatcher, EventReceiver, TrackingEvent};
use crate::metrics::TrackingMetrics;
use crate::replay::{DEFAULT_REPLAY_CAPACITY, ReplayBuffer};
use crate::retry::{RetryConfig, RetryingDispatcher};
use crate::stop::StopDetector;
use crate::traits::SyncClient;

/// Storage key for the persisted session state.
pub const SESSION_KEY: &str = "waypost.session";

/// Storage key for the persisted nearby cache.
pub const CACHE_KEY: &str = "waypost.cache";

/// Default number of replay entries sent per flush batch.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 10;

/// Shared slot holding the current active period's cancellation token.
pub(crate) type CancelSlot = Arc<Mutex<CancellationToken>>;

/// Coarse session status, used in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Not tracking.
    Stopped,
    /// Tracking with a regular config.
    Tracking,
    /// Tracking with a trip config.
    OnTrip,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Stopped => f.write_str("stopped"),
            SessionStatus::Tracking => f.write_str("tracking"),
            SessionStatus::OnTrip => f.write_str("on trip"),
        }
    }
}

/// Full session state, including the configs each state carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Not tracking.
    #[default]
    Stopped,
    /// Tracking with `config`.
    Tracking {
        /// Config in effect.
        config: TrackingConfig,
    },
    /// On a trip.
    OnTrip {
        /// The trip.
        trip: TripOptions,
        /// Config in effect for the trip.
        trip_config: TrackingConfig,
        /// Config to restore when the trip ends; `None` if tracking was
        /// stopped when the trip started.
        saved: Option<TrackingConfig>,
    },
}

impl SessionState {
    /// Coarse status.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Stopped => SessionStatus::Stopped,
            SessionState::Tracking { .. } => SessionStatus::Tracking,
            SessionState::OnTrip { .. } => SessionStatus::OnTrip,
        }
    }

    /// Returns `true` when fixes are being processed.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Stopped)
    }

    /// Config in effect, if active.
    pub fn active_config(&self) -> Option<&TrackingConfig> {
        match self {
            SessionState::Stopped => None,
            SessionState::Tracking { config } => Some(config),
            SessionState::OnTrip { trip_config, .. } => Some(trip_config),
        }
    }

    /// Active trip, if any.
    pub fn trip(&self) -> Option<&TripOptions> {
        match self {
            SessionState::OnTrip { trip, .. } => Some(trip),
            _ => None,
        }
    }
}

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Identity reported with every sync.
    pub device: DeviceMetadata,
    /// Maximum buffered observations.
    pub replay_capacity: usize,
    /// Replay entries read from the buffer per flush step.
    pub flush_batch_size: usize,
    /// Retry settings for live fixes.
    pub live_retry: RetryConfig,
    /// Retry settings for replayed entries.
    pub replay_retry: RetryConfig,
    /// Broadcast buffer size for [`TrackingEvent`]s.
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(DeviceMetadata::new(Uuid::new_v4().to_string()))
    }
}

impl SessionOptions {
    /// Default options for `device`.
    pub fn new(device: DeviceMetadata) -> Self {
        Self {
            device,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            live_retry: RetryConfig::for_live_sync(),
            replay_retry: RetryConfig::for_replay(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the replay capacity.
    #[must_use]
    pub fn replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Set the live retry config.
    #[must_use]
    pub fn live_retry(mut self, retry: RetryConfig) -> Self {
        self.live_retry = retry;
        self
    }

    /// Set the replay retry config.
    #[must_use]
    pub fn replay_retry(mut self, retry: RetryConfig) -> Self {
        self.replay_retry = retry;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.replay_capacity == 0 {
            return Err(Error::invalid_config("replay_capacity must be > 0"));
        }
        if self.flush_batch_size == 0 {
            return Err(Error::invalid_config("flush_batch_size must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        self.live_retry.validate()?;
        self.replay_retry.validate()?;
        Ok(())
    }
}

/// What happened to one fix or beacon detection.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// Nothing was evaluated: the session is stopped or had no fix to
    /// re-evaluate.
    Ignored,
    /// Handled locally; no network call and no buffer write.
    Skipped,
    /// Delivered. `events` are the transitions the server confirmed and
    /// `flushed` the replay entries delivered afterwards.
    Synced {
        /// Confirmed transitions.
        events: Vec<TrackEvent>,
        /// Replay entries delivered after the live sync.
        flushed: usize,
    },
    /// Retries were exhausted and the observation was buffered.
    Queued {
        /// Entries now waiting in the buffer.
        pending: usize,
    },
    /// Retries were exhausted and the replay policy did not keep it.
    Dropped {
        /// The last failure.
        error: SyncError,
    },
    /// The server rejected the request; it is neither retried nor buffered.
    Rejected {
        /// The terminal failure.
        error: SyncError,
    },
    /// Tracking stopped while the dispatch was pending; its result was
    /// thrown away.
    Discarded,
}

impl FixOutcome {
    /// Short label for logs and CLI output.
    pub fn label(&self) -> &'static str {
        match self {
            FixOutcome::Ignored => "ignored",
            FixOutcome::Skipped => "skipped",
            FixOutcome::Synced { .. } => "synced",
            FixOutcome::Queued { .. } => "queued",
            FixOutcome::Dropped { .. } => "dropped",
            FixOutcome::Rejected { .. } => "rejected",
            FixOutcome::Discarded => "discarded",
        }
    }
}

fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::corrupt(key, e))?;
    Ok(Some(value))
}

fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, Bytes::from(bytes))?;
    Ok(())
}

/// Load `key`, falling back to the default when the stored value is corrupt.
fn load_or_default<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> Result<T> {
    match load_json(store, key) {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(Error::Storage(e @ StorageError::Corrupt { .. })) => {
            warn!("Discarding persisted {}: {}", key, e);
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}

/// Device-side tracking engine.
///
/// Owns all mutable tracking state. Drive it directly through `&mut self`
/// or move it onto a task with [`TrackingSession::spawn`].
pub struct TrackingSession {
    state: SessionState,
    cache: NearbyCache,
    replay: ReplayBuffer,
    stop: StopDetector,
    ranged_beacons: BTreeSet<String>,
    last_fix: Option<LocationFix>,
    dispatcher: RetryingDispatcher,
    store: Arc<dyn KeyValueStore>,
    options: SessionOptions,
    events: EventDispatcher,
    metrics: Arc<TrackingMetrics>,
    cancel: CancelSlot,
}

impl fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingSession")
            .field("state", &self.state.status())
            .field("replay", &self.replay)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl TrackingSession {
    /// Build a session, rehydrating state, cache, and replay buffer from
    /// `store`.
    ///
    /// A session persisted while tracking resumes tracking with the same
    /// config. Corrupt persisted values are logged and replaced with
    /// defaults.
    pub fn restore(
        client: Arc<dyn SyncClient>,
        store: Arc<dyn KeyValueStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        options.validate()?;

        let state: SessionState = load_or_default(store.as_ref(), SESSION_KEY)?;
        let cache: NearbyCache = load_or_default(store.as_ref(), CACHE_KEY)?;
        let replay = match ReplayBuffer::load(store.clone(), options.replay_capacity) {
            Err(Error::Storage(e @ StorageError::Corrupt { .. })) => {
                warn!("Discarding persisted replay buffer: {}", e);
                ReplayBuffer::new(store.clone(), options.replay_capacity)?
            }
            other => other?,
        };

        let token = CancellationToken::new();
        if !state.is_active() {
            token.cancel();
        }

        let metrics = Arc::new(TrackingMetrics::new());
        info!(
            "Restored session: {}, {} cached geofences, {} replay entries",
            state.status(),
            cache.geofences().len(),
            replay.len()
        );

        Ok(Self {
            state,
            cache,
            replay,
            stop: StopDetector::new(),
            ranged_beacons: BTreeSet::new(),
            last_fix: None,
            dispatcher: RetryingDispatcher::new(client).with_metrics(metrics.clone()),
            events: EventDispatcher::new(options.event_capacity),
            store,
            options,
            metrics,
            cancel: Arc::new(Mutex::new(token)),
        })
    }

    // ==================== Accessors ====================

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Coarse status.
    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// Config in effect, if active.
    pub fn active_config(&self) -> Option<&TrackingConfig> {
        self.state.active_config()
    }

    /// Read-only view of the nearby cache.
    pub fn cache(&self) -> &NearbyCache {
        &self.cache
    }

    /// Read-only view of the replay buffer.
    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    /// Options the session was built with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<TrackingMetrics> {
        self.metrics.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Whether the device is currently considered stopped.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Beacons the sensor currently reports in range.
    pub fn ranged_beacons(&self) -> &BTreeSet<String> {
        &self.ranged_beacons
    }

    /// How often the sensor should deliver fixes now.
    ///
    /// `None` when the session is stopped or the active config disables
    /// updates in the current motion state.
    pub fn desired_interval(&self) -> Option<Duration> {
        self.active_config()?.update_interval(self.stop.is_stopped())
    }

    pub(crate) fn cancel_slot(&self) -> CancelSlot {
        self.cancel.clone()
    }

    pub(crate) fn event_dispatcher(&self) -> EventDispatcher {
        self.events.clone()
    }

    // ==================== Lifecycle ====================

    /// Start tracking with `config`.
    ///
    /// While tracking, replaces the config in effect. While on a trip,
    /// replaces the config restored when the trip ends.
    pub fn start_tracking(&mut self, config: TrackingConfig) -> Result<()> {
        config.validate()?;
        let state = std::mem::take(&mut self.state);
        match state {
            SessionState::Stopped => {
                self.arm();
                self.transition(SessionState::Tracking {
                    config: config.clone(),
                })?;
                self.events.send(TrackingEvent::ConfigUpdated { config });
            }
            SessionState::Tracking { .. } => {
                self.state = SessionState::Tracking {
                    config: config.clone(),
                };
                self.persist_state()?;
                self.events.send(TrackingEvent::ConfigUpdated { config });
            }
            SessionState::OnTrip {
                trip, trip_config, ..
            } => {
                debug!("Tracking config will apply when trip {} ends", trip.external_id);
                self.state = SessionState::OnTrip {
                    trip,
                    trip_config,
                    saved: Some(config),
                };
                self.persist_state()?;
            }
        }
        Ok(())
    }

    /// Stop tracking, ending any trip.
    ///
    /// Pending retry waits are cancelled. The replay buffer and nearby cache
    /// are kept for the next start.
    pub fn stop_tracking(&mut self) -> Result<()> {
        self.disarm();
        if !self.state.is_active() {
            return Ok(());
        }
        if let Some(trip) = self.state.trip() {
            info!("Stopping tracking during trip {}", trip.external_id);
        }
        self.stop.reset();
        self.ranged_beacons.clear();
        self.last_fix = None;
        self.transition(SessionState::Stopped)
    }

    /// Start a trip.
    ///
    /// `config` overrides the tracking config for the trip's duration. It
    /// is required when tracking is stopped. Starting a trip while on a
    /// trip replaces the trip but keeps the config saved by the first one.
    pub fn start_trip(&mut self, trip: TripOptions, config: Option<TrackingConfig>) -> Result<()> {
        if let Some(config) = &config {
            config.validate()?;
        }

        let next = match (&self.state, config) {
            (SessionState::Stopped, None) => {
                return Err(Error::invalid_state(
                    "starting a trip while stopped requires a tracking config",
                ));
            }
            (SessionState::Stopped, Some(trip_config)) => SessionState::OnTrip {
                trip,
                trip_config,
                saved: None,
            },
            (SessionState::Tracking { config: current }, trip_config) => SessionState::OnTrip {
                trip,
                trip_config: trip_config.unwrap_or_else(|| current.clone()),
                saved: Some(current.clone()),
            },
            (
                SessionState::OnTrip {
                    trip_config: current,
                    saved,
                    ..
                },
                trip_config,
            ) => SessionState::OnTrip {
                trip,
                trip_config: trip_config.unwrap_or_else(|| current.clone()),
                saved: saved.clone(),
            },
        };

        if let Some(trip) = next.trip() {
            info!("Starting trip {} ({:?})", trip.external_id, trip.mode);
        }
        let config_changed = self.state.active_config() != next.active_config();
        if !self.state.is_active() {
            self.arm();
        }
        self.transition(next)?;
        if config_changed {
            if let Some(config) = self.state.active_config() {
                self.events.send(TrackingEvent::ConfigUpdated {
                    config: config.clone(),
                });
            }
        }
        Ok(())
    }

    /// Complete the current trip and restore the pre-trip config.
    ///
    /// If tracking was stopped when the trip started, the session stops.
    pub fn complete_trip(&mut self) -> Result<TripOptions> {
        self.finish_trip("completed")
    }

    /// Cancel the current trip and restore the pre-trip config.
    ///
    /// If tracking was stopped when the trip started, the session stops.
    pub fn cancel_trip(&mut self) -> Result<TripOptions> {
        self.finish_trip("cancelled")
    }

    fn finish_trip(&mut self, how: &str) -> Result<TripOptions> {
        let SessionState::OnTrip { trip, saved, .. } = &self.state else {
            return Err(Error::invalid_state("no trip in progress"));
        };
        let trip = trip.clone();
        let saved = saved.clone();
        info!("Trip {} {}", trip.external_id, how);

        match saved {
            Some(config) => {
                self.transition(SessionState::Tracking {
                    config: config.clone(),
                })?;
                self.events.send(TrackingEvent::ConfigUpdated { config });
            }
            None => {
                info!("No pre-trip tracking to restore, stopping");
                self.disarm();
                self.stop.reset();
                self.ranged_beacons.clear();
                self.last_fix = None;
                self.transition(SessionState::Stopped)?;
            }
        }
        Ok(trip)
    }

    /// Replace the config in effect; it applies from the next fix.
    ///
    /// On a trip this replaces the trip config. Buffered replay entries are
    /// kept.
    pub fn update_config(&mut self, config: TrackingConfig) -> Result<()> {
        config.validate()?;
        match &mut self.state {
            SessionState::Stopped => {
                return Err(Error::invalid_state(
                    "cannot update config while stopped; start tracking instead",
                ));
            }
            SessionState::Tracking { config: current } => *current = config.clone(),
            SessionState::OnTrip { trip_config, .. } => *trip_config = config.clone(),
        }
        self.persist_state()?;
        self.events.send(TrackingEvent::ConfigUpdated { config });
        Ok(())
    }

    /// Change the replay capacity, evicting the oldest entries if it shrinks.
    pub fn set_replay_capacity(&mut self, capacity: usize) -> Result<()> {
        let evicted = self.replay.set_capacity(capacity)?;
        self.options.replay_capacity = capacity;
        self.metrics.record_evicted(evicted as u64);
        Ok(())
    }

    /// Forget everything: stop, clear the cache and replay buffer, and
    /// delete all persisted state.
    pub fn reset(&mut self) -> Result<()> {
        self.stop_tracking()?;
        self.cache.clear();
        self.replay.clear()?;
        self.store.delete(SESSION_KEY)?;
        self.store.delete(CACHE_KEY)?;
        info!("Session reset");
        Ok(())
    }

    // ==================== Sensor input ====================

    /// Process one location fix.
    pub async fn on_fix(&mut self, fix: LocationFix) -> Result<FixOutcome> {
        fix.validate()?;
        let Some(config) = self.state.active_config().cloned() else {
            debug!("Ignoring fix at {} while stopped", fix.coordinate);
            return Ok(FixOutcome::Ignored);
        };

        let stopped = self.stop.update(&fix, &config);
        self.last_fix = Some(fix.clone());
        self.evaluate_and_sync(fix, stopped, &config).await
    }

    /// Record a beacon ranging change and re-evaluate the last fix.
    ///
    /// Detections of beacons that are not cached are ignored.
    pub async fn on_beacon_detected(&mut self, beacon_id: &str, entered: bool) -> Result<FixOutcome> {
        let Some(config) = self.state.active_config().cloned() else {
            return Ok(FixOutcome::Ignored);
        };
        if !self.cache.contains_record(RecordKind::Beacon, beacon_id) {
            debug!("Ignoring detection of unknown beacon {}", beacon_id);
            return Ok(FixOutcome::Ignored);
        }

        let changed = if entered {
            self.ranged_beacons.insert(beacon_id.to_string())
        } else {
            self.ranged_beacons.remove(beacon_id)
        };
        if !changed {
            return Ok(FixOutcome::Skipped);
        }
        debug!(
            "Beacon {} {}",
            beacon_id,
            if entered { "in range" } else { "out of range" }
        );

        let Some(fix) = self.last_fix.clone() else {
            return Ok(FixOutcome::Ignored);
        };
        let stopped = self.stop.is_stopped();
        self.evaluate_and_sync(fix, stopped, &config).await
    }

    fn current_membership(&self, fix: &LocationFix) -> Membership {
        let mut membership = classify(fix, &self.cache);
        membership
            .beacons
            .extend(self.ranged_beacons.iter().cloned());
        membership
    }

    async fn evaluate_and_sync(
        &mut self,
        fix: LocationFix,
        stopped: bool,
        config: &TrackingConfig,
    ) -> Result<FixOutcome> {
        let membership = self.current_membership(&fix);
        let decision = evaluate_membership(&fix, membership, &self.cache, config);
        self.metrics.record_fix(decision.should_sync());

        if !decision.should_sync() {
            debug!("No sync needed for fix at {}", fix.coordinate);
            return Ok(FixOutcome::Skipped);
        }
        for trigger in &decision.triggers {
            debug!("Sync triggered: {}", trigger);
        }

        let has_events = !decision.events.is_empty();
        let request = SyncRequest::new(
            fix,
            stopped,
            decision.membership,
            decision.events,
            self.options.device.clone(),
        )
        .with_trip(self.state.trip().cloned());

        let token = self.current_token();
        let result = self
            .dispatcher
            .dispatch(&request, &self.options.live_retry, &token)
            .await;

        if token.is_cancelled() || !self.state.is_active() {
            debug!("Discarding result of {}: tracking stopped", request.request_id);
            self.metrics.record_discarded();
            return Ok(FixOutcome::Discarded);
        }

        match result {
            Ok(response) => {
                let events = self.apply_response(response)?;
                self.events.send(TrackingEvent::SyncSucceeded {
                    request_id: request.request_id,
                    events: events.len(),
                });
                let flushed = self.flush_replays().await?;
                Ok(FixOutcome::Synced { events, flushed })
            }
            Err(SyncError::Cancelled) => {
                self.metrics.record_discarded();
                Ok(FixOutcome::Discarded)
            }
            Err(error) if error.is_retryable() => {
                if !config.replay.admits(stopped, has_events) {
                    debug!(
                        "Replay policy {} drops undeliverable {}",
                        config.replay, request.request_id
                    );
                    return Ok(FixOutcome::Dropped { error });
                }
                let pending = self.enqueue_replay(request)?;
                Ok(FixOutcome::Queued { pending })
            }
            Err(error) => {
                warn!("Sync {} rejected: {}", request.request_id, error);
                self.events
                    .send(TrackingEvent::rejected(request.request_id, &error));
                Ok(FixOutcome::Rejected { error })
            }
        }
    }

    fn enqueue_replay(&mut self, request: SyncRequest) -> Result<usize> {
        let request_id = request.request_id;
        let evicted = self.replay.enqueue(request)?;
        self.metrics.record_queued(evicted.is_some());
        if let Some(entry) = evicted {
            self.events.send(TrackingEvent::ReplayEvicted {
                request_id: entry.request.request_id,
                total_evicted: self.replay.evicted_count(),
            });
        }
        let pending = self.replay.len();
        debug!("Buffered {} for replay ({} pending)", request_id, pending);
        self.events.send(TrackingEvent::Queued {
            request_id,
            pending,
        });
        Ok(pending)
    }

    /// Apply a live response: nearby sets, then membership, then config.
    ///
    /// Returns the transitions between the old and new confirmed membership.
    fn apply_response(&mut self, response: SyncResponse) -> Result<Vec<TrackEvent>> {
        if let Some(nearby) = response.nearby {
            self.cache.apply_nearby_update(nearby);
            let known = self.cache.record_ids(RecordKind::Beacon);
            self.ranged_beacons.retain(|id| known.contains(id.as_str()));
        }

        let before = self.cache.confirmed_membership().clone();
        self.cache.apply_server_membership(response.membership);
        let events = derive_events(self.cache.confirmed_membership(), &before);
        self.persist_cache()?;

        for event in &events {
            info!("Server confirmed: {}", event);
            self.events.send(TrackingEvent::from_track_event(event));
        }

        if let Some(config) = response.config {
            self.apply_remote_config(config)?;
        }
        Ok(events)
    }

    fn apply_remote_config(&mut self, config: TrackingConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!("Ignoring invalid remote config: {}", e);
            return Ok(());
        }
        match &mut self.state {
            SessionState::Stopped => return Ok(()),
            SessionState::Tracking { config: current } => {
                if *current == config {
                    return Ok(());
                }
                *current = config.clone();
                info!("Applied remote tracking config");
                self.events.send(TrackingEvent::ConfigUpdated { config });
            }
            SessionState::OnTrip { saved, .. } => match saved {
                Some(current) => {
                    *current = config;
                    info!("Remote tracking config will apply after the trip");
                }
                None => debug!("Ignoring remote config: nothing to restore after trip"),
            },
        }
        self.persist_state()
    }

    // ==================== Replay ====================

    /// Send buffered observations oldest first.
    ///
    /// Entries go one at a time, in order. A retryable failure stops the
    /// flush so later entries never overtake earlier ones. An entry the
    /// server rejects outright can never succeed and is dropped. Responses
    /// to replayed entries describe past observations and are not applied
    /// to the cache. Does nothing while stopped.
    ///
    /// Returns the number of entries delivered.
    pub async fn flush_replays(&mut self) -> Result<usize> {
        if self.replay.is_empty() {
            return Ok(0);
        }
        let token = self.current_token();
        let mut delivered = 0;
        let mut rejected = 0;

        'flush: loop {
            let batch = self.replay.peek_batch(self.options.flush_batch_size);
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if token.is_cancelled() {
                    break 'flush;
                }
                let request = entry.request.as_replay();
                match self
                    .dispatcher
                    .dispatch(&request, &self.options.replay_retry, &token)
                    .await
                {
                    Ok(_) => {
                        self.replay.dequeue(1)?;
                        delivered += 1;
                    }
                    Err(error) if error.is_terminal() => {
                        warn!(
                            "Dropping replay entry {} from {}: {}",
                            request.request_id, entry.enqueued_at, error
                        );
                        self.replay.dequeue(1)?;
                        rejected += 1;
                    }
                    Err(error) => {
                        debug!("Replay flush paused: {}", error);
                        break 'flush;
                    }
                }
            }
        }

        if delivered > 0 || rejected > 0 {
            self.metrics.record_flushed(delivered as u64);
            info!(
                "Flushed {} replay entries ({} rejected, {} remaining)",
                delivered,
                rejected,
                self.replay.len()
            );
            self.events.send(TrackingEvent::ReplayFlushed {
                delivered,
                remaining: self.replay.len(),
            });
        }
        Ok(delivered)
    }

    // ==================== Internals ====================

    fn transition(&mut self, next: SessionState) -> Result<()> {
        let from = self.state.status();
        self.state = next;
        let to = self.state.status();
        self.persist_state()?;
        if from != to {
            info!("Session {} -> {}", from, to);
            self.events.send(TrackingEvent::StateChanged { from, to });
        }
        Ok(())
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a fresh token for a new active period.
    fn arm(&self) {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_cancelled() {
            *slot = CancellationToken::new();
        }
    }

    fn disarm(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn persist_state(&self) -> Result<()> {
        save_json(self.store.as_ref(), SESSION_KEY, &self.state)
    }

    fn persist_cache(&self) -> Result<()> {
        save_json(self.store.as_ref(), CACHE_KEY, &self.cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryStore, MockSyncClient};
    use waypost_types::{
        Coordinate, FixSource, GeofenceRecord, NearbyUpdate, ReplayPolicy, SyncedRegion,
    };

    struct Harness {
        server: Arc<MockSyncClient>,
        store: Arc<MemoryStore>,
        session: TrackingSession,
    }

    fn options() -> SessionOptions {
        SessionOptions::new(DeviceMetadata::new("test-device"))
            .live_retry(RetryConfig::new(2).base_delay(Duration::from_millis(10)))
            .replay_retry(RetryConfig::none())
    }

    fn harness() -> Harness {
        let server = Arc::new(MockSyncClient::new());
        let store = Arc::new(MemoryStore::new());
        let session = TrackingSession::restore(server.clone(), store.clone(), options()).unwrap();
        Harness {
            server,
            store,
            session,
        }
    }

    fn fix_at(lat: f64, lon: f64) -> LocationFix {
        LocationFix::new(Coordinate::new(lat, lon), 5.0, FixSource::Mock)
    }

    fn home_nearby() -> NearbyUpdate {
        NearbyUpdate {
            geofences: Some(vec![GeofenceRecord::circle(
                "home",
                Coordinate::new(0.0, 0.0),
                100.0,
            )]),
            synced_region: Some(SyncedRegion::new(Coordinate::new(0.0, 0.0), 10_000.0)),
            ..Default::default()
        }
    }

    fn config_a() -> TrackingConfig {
        TrackingConfig::responsive().stop_detection(300, 50.0)
    }

    #[test]
    fn test_options_validation() {
        assert!(options().validate().is_ok());
        assert!(options().replay_capacity(0).validate().is_err());
        let mut bad = options();
        bad.flush_batch_size = 0;
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_stopped_session_ignores_fixes() {
        let mut h = harness();
        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(outcome, FixOutcome::Ignored);
        assert_eq!(h.server.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_fix_is_rejected() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        let err = h.session.on_fix(fix_at(95.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFix(_)));
    }

    #[tokio::test]
    async fn test_first_fix_syncs_then_steady_state_is_local() {
        let mut h = harness();
        h.server.set_echo_nearby(Some(home_nearby()));
        h.session.start_tracking(config_a()).unwrap();

        // empty cache: outside any synced region
        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert!(matches!(outcome, FixOutcome::Synced { .. }));
        assert_eq!(h.session.cache().geofences().len(), 1);

        // inside home now but not yet confirmed
        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(
            outcome,
            FixOutcome::Synced {
                events: vec![TrackEvent::entered(RecordKind::Geofence, "home")],
                flushed: 0,
            }
        );

        for _ in 0..5 {
            let outcome = h.session.on_fix(fix_at(0.0001, 0.0)).await.unwrap();
            assert_eq!(outcome, FixOutcome::Skipped);
        }
        assert_eq!(h.server.call_count(), 2);
        assert_eq!(h.session.metrics().snapshot().syncs_skipped, 5);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_reported_not_buffered() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.push_failure(SyncError::Forbidden);

        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(
            outcome,
            FixOutcome::Rejected {
                error: SyncError::Forbidden
            }
        );
        assert!(h.session.replay().is_empty());
        assert_eq!(h.server.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_failure_is_queued_then_flushed() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        let mut events = h.session.subscribe();

        h.server.set_offline(true);
        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(outcome, FixOutcome::Queued { pending: 1 });
        let outcome = h.session.on_fix(fix_at(1.0, 0.0)).await.unwrap();
        assert_eq!(outcome, FixOutcome::Queued { pending: 2 });

        h.server.set_offline(false);
        let outcome = h.session.on_fix(fix_at(2.0, 0.0)).await.unwrap();
        assert!(matches!(outcome, FixOutcome::Synced { flushed: 2, .. }));
        assert!(h.session.replay().is_empty());

        let requests = h.server.requests().await;
        let replayed: Vec<_> = requests.iter().filter(|r| r.replayed).collect();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].fix.coordinate.latitude, 0.0);
        assert_eq!(replayed[1].fix.coordinate.latitude, 1.0);

        let mut saw_flush = false;
        while let Ok(event) = events.try_recv() {
            if let TrackingEvent::ReplayFlushed {
                delivered,
                remaining,
            } = event
            {
                assert_eq!((delivered, remaining), (2, 0));
                saw_flush = true;
            }
        }
        assert!(saw_flush);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_policy_none_drops() {
        let mut h = harness();
        h.session
            .start_tracking(config_a().replay(ReplayPolicy::None))
            .unwrap();
        h.server.set_offline(true);

        let outcome = h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert!(matches!(outcome, FixOutcome::Dropped { .. }));
        assert!(h.session.replay().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_stops_at_first_retryable_failure() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.set_offline(true);
        for lat in [0.0, 1.0, 2.0] {
            h.session.on_fix(fix_at(lat, 0.0)).await.unwrap();
        }
        h.server.set_offline(false);

        // live succeeds, first replay succeeds, second fails
        h.server.push_reply(crate::mock::MockReply::Echo);
        h.server.push_reply(crate::mock::MockReply::Echo);
        h.server.push_failure(SyncError::network("flaky"));

        let outcome = h.session.on_fix(fix_at(3.0, 0.0)).await.unwrap();
        assert!(matches!(outcome, FixOutcome::Synced { flushed: 1, .. }));
        let remaining: Vec<_> = h
            .session
            .replay()
            .iter()
            .map(|e| e.request.fix.coordinate.latitude)
            .collect();
        assert_eq!(remaining, vec![1.0, 2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drops_rejected_entry_and_continues() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.set_offline(true);
        for lat in [0.0, 1.0] {
            h.session.on_fix(fix_at(lat, 0.0)).await.unwrap();
        }
        h.server.set_offline(false);
        h.server.push_reply(crate::mock::MockReply::Echo);
        h.server.push_failure(SyncError::from_status(422, "stale"));

        let outcome = h.session.on_fix(fix_at(2.0, 0.0)).await.unwrap();
        assert!(matches!(outcome, FixOutcome::Synced { flushed: 1, .. }));
        assert!(h.session.replay().is_empty());
    }

    #[tokio::test]
    async fn test_replay_response_does_not_touch_cache() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.push_failure(SyncError::network("down"));
        h.server.push_failure(SyncError::network("down"));
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(h.session.replay().len(), 1);

        // live response carries the nearby set; the replay echo carries none
        h.server
            .push_response(SyncResponse::default().with_nearby(home_nearby()));
        h.server.push_response(
            SyncResponse::confirming(Membership::new().with(RecordKind::Geofence, "ghost"))
                .with_nearby(NearbyUpdate::default()),
        );
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        assert_eq!(h.session.cache().geofences().len(), 1);
        assert!(h.session.cache().confirmed_membership().is_empty());
    }

    #[tokio::test]
    async fn test_trip_restores_exact_config() {
        let mut h = harness();
        let a = config_a().sync_all_locations(true);
        h.session.start_tracking(a.clone()).unwrap();

        h.session
            .start_trip(TripOptions::new("trip-1"), Some(TrackingConfig::continuous()))
            .unwrap();
        assert_eq!(h.session.status(), SessionStatus::OnTrip);
        assert_eq!(
            h.session.active_config(),
            Some(&TrackingConfig::continuous())
        );

        let trip = h.session.complete_trip().unwrap();
        assert_eq!(trip.external_id, "trip-1");
        assert_eq!(h.session.state(), &SessionState::Tracking { config: a });
    }

    #[tokio::test]
    async fn test_trip_from_stopped_needs_config_and_ends_stopped() {
        let mut h = harness();
        let err = h
            .session
            .start_trip(TripOptions::new("t"), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        h.session
            .start_trip(TripOptions::new("t"), Some(TrackingConfig::continuous()))
            .unwrap();
        assert!(h.session.state().is_active());
        h.session.cancel_trip().unwrap();
        assert_eq!(h.session.state(), &SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_nested_trip_keeps_original_saved_config() {
        let mut h = harness();
        let a = config_a();
        h.session.start_tracking(a.clone()).unwrap();
        h.session
            .start_trip(TripOptions::new("first"), Some(TrackingConfig::continuous()))
            .unwrap();
        h.session
            .start_trip(TripOptions::new("second"), None)
            .unwrap();

        assert_eq!(
            h.session.state().trip().map(|t| t.external_id.as_str()),
            Some("second")
        );
        assert_eq!(
            h.session.active_config(),
            Some(&TrackingConfig::continuous())
        );
        h.session.complete_trip().unwrap();
        assert_eq!(h.session.active_config(), Some(&a));
    }

    #[test]
    fn test_complete_without_trip_is_invalid() {
        let mut h = harness();
        assert!(matches!(
            h.session.complete_trip(),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_trip_is_attached_to_requests() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.session
            .start_trip(TripOptions::new("trip-9").with_destination("office"), None)
            .unwrap();
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        let requests = h.server.requests().await;
        assert_eq!(
            requests[0].trip.as_ref().map(|t| t.external_id.as_str()),
            Some("trip-9")
        );
    }

    #[tokio::test]
    async fn test_remote_config_during_trip_replaces_saved() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.session
            .start_trip(TripOptions::new("t"), Some(TrackingConfig::continuous()))
            .unwrap();

        let remote = TrackingConfig::efficient();
        h.server
            .push_response(SyncResponse::default().with_config(remote.clone()));
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        assert_eq!(
            h.session.active_config(),
            Some(&TrackingConfig::continuous())
        );
        h.session.complete_trip().unwrap();
        assert_eq!(h.session.active_config(), Some(&remote));
    }

    #[tokio::test]
    async fn test_update_config_keeps_replay_entries() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.push_failure(SyncError::network("down"));
        h.server.push_failure(SyncError::network("down"));
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        h.session
            .update_config(TrackingConfig::continuous())
            .unwrap();
        assert_eq!(h.session.replay().len(), 1);
        assert_eq!(
            h.session.active_config(),
            Some(&TrackingConfig::continuous())
        );

        h.session.stop_tracking().unwrap();
        assert!(h.session.update_config(config_a()).is_err());
    }

    #[tokio::test]
    async fn test_beacon_ranging_triggers_sync() {
        let mut h = harness();
        let mut nearby = home_nearby();
        nearby.beacons = Some(vec![waypost_types::BeaconRecord::new(
            "desk",
            Uuid::nil(),
            Coordinate::new(1.0, 1.0),
        )]);
        h.server.set_echo_nearby(Some(nearby));
        h.session.start_tracking(config_a()).unwrap();
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        assert_eq!(
            h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap(),
            FixOutcome::Skipped
        );

        let outcome = h.session.on_beacon_detected("desk", true).await.unwrap();
        assert_eq!(
            outcome,
            FixOutcome::Synced {
                events: vec![TrackEvent::entered(RecordKind::Beacon, "desk")],
                flushed: 0,
            }
        );
        assert_eq!(
            h.session.on_beacon_detected("desk", true).await.unwrap(),
            FixOutcome::Skipped
        );
        assert_eq!(
            h.session.on_beacon_detected("unknown", true).await.unwrap(),
            FixOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_state_persists_across_restore() {
        let mut h = harness();
        h.server.set_echo_nearby(Some(home_nearby()));
        let a = config_a();
        h.session.start_tracking(a.clone()).unwrap();
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        let restored =
            TrackingSession::restore(h.server.clone(), h.store.clone(), options()).unwrap();
        assert_eq!(restored.state(), &SessionState::Tracking { config: a });
        assert!(
            restored
                .cache()
                .confirmed_membership()
                .geofences
                .contains("home")
        );
    }

    #[test]
    fn test_corrupt_persisted_state_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.set(SESSION_KEY, Bytes::from_static(b"{oops")).unwrap();
        let session =
            TrackingSession::restore(Arc::new(MockSyncClient::new()), store, options()).unwrap();
        assert_eq!(session.state(), &SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_desired_interval_follows_stop_state() {
        let mut h = harness();
        assert_eq!(h.session.desired_interval(), None);
        h.session
            .start_tracking(TrackingConfig::continuous())
            .unwrap();
        assert_eq!(h.session.desired_interval(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let mut h = harness();
        h.session.start_tracking(config_a()).unwrap();
        h.server.push_failure(SyncError::network("down"));
        h.server.push_failure(SyncError::network("down"));
        h.session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

        h.session.reset().unwrap();
        assert_eq!(h.session.status(), SessionStatus::Stopped);
        assert!(h.session.replay().is_empty());
        assert!(h.store.get(SESSION_KEY).unwrap().is_none());
    }
}
