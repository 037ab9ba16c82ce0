//! Run a [`TrackingSession`] on its own task.
//!
//! [`TrackingSession::spawn`] moves the session into a background task and
//! returns a cloneable [`SessionHandle`]. Commands are processed strictly in
//! the order they arrive, so fixes sent from several producers are still
//! handled one at a time.
//!
//! Stopping is the one exception to queue order: [`SessionHandle::stop_tracking`]
//! cancels the active token before queueing the command, so a fix stuck in
//! retry waits ends immediately instead of holding up the stop.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use waypost_types::{LocationFix, TrackingConfig, TripOptions};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::metrics::TrackingMetrics;
use crate::session::{CancelSlot, FixOutcome, SessionState, TrackingSession};

/// Default depth of the command queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands accepted by the session task.
#[derive(Debug)]
enum Command {
    Fix(LocationFix, Reply<FixOutcome>),
    Beacon {
        id: String,
        entered: bool,
        reply: Reply<FixOutcome>,
    },
    StartTracking(TrackingConfig, Reply<()>),
    StopTracking(Reply<()>),
    StartTrip(TripOptions, Option<TrackingConfig>, Reply<()>),
    CompleteTrip(Reply<TripOptions>),
    CancelTrip(Reply<TripOptions>),
    UpdateConfig(TrackingConfig, Reply<()>),
    FlushReplays(Reply<usize>),
    State(oneshot::Sender<SessionState>),
    DesiredInterval(oneshot::Sender<Option<Duration>>),
    Reset(Reply<()>),
    Shutdown,
}

impl TrackingSession {
    /// Move the session onto a background task.
    ///
    /// The task ends when every handle is dropped or
    /// [`SessionHandle::shutdown`] is called.
    pub fn spawn(self) -> SessionHandle {
        let (tx, rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);
        let handle = SessionHandle {
            commands: tx,
            cancel: self.cancel_slot(),
            events: self.event_dispatcher(),
            metrics: self.metrics(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Tracking session task started");
        loop {
            match commands.recv().await {
                Some(Command::Shutdown) => {
                    info!("Tracking session received shutdown command");
                    break;
                }
                Some(cmd) => self.handle_command(cmd).await,
                None => {
                    info!("All session handles dropped, shutting down");
                    break;
                }
            }
        }
        info!("Tracking session task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match cmd {
            Command::Fix(fix, reply) => {
                let _ = reply.send(self.on_fix(fix).await);
            }
            Command::Beacon { id, entered, reply } => {
                let _ = reply.send(self.on_beacon_detected(&id, entered).await);
            }
            Command::StartTracking(config, reply) => {
                let _ = reply.send(self.start_tracking(config));
            }
            Command::StopTracking(reply) => {
                let _ = reply.send(self.stop_tracking());
            }
            Command::StartTrip(trip, config, reply) => {
                let _ = reply.send(self.start_trip(trip, config));
            }
            Command::CompleteTrip(reply) => {
                let _ = reply.send(self.complete_trip());
            }
            Command::CancelTrip(reply) => {
                let _ = reply.send(self.cancel_trip());
            }
            Command::UpdateConfig(config, reply) => {
                let _ = reply.send(self.update_config(config));
            }
            Command::FlushReplays(reply) => {
                let _ = reply.send(self.flush_replays().await);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state().clone());
            }
            Command::DesiredInterval(reply) => {
                let _ = reply.send(self.desired_interval());
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle to a session running on a background task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancelSlot,
    events: EventDispatcher,
    metrics: Arc<TrackingMetrics>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Process a location fix.
    pub async fn on_fix(&self, fix: LocationFix) -> Result<FixOutcome> {
        self.request(|reply| Command::Fix(fix, reply)).await
    }

    /// Report a beacon entering or leaving range.
    pub async fn on_beacon_detected(
        &self,
        beacon_id: impl Into<String>,
        entered: bool,
    ) -> Result<FixOutcome> {
        let id = beacon_id.into();
        self.request(|reply| Command::Beacon { id, entered, reply })
            .await
    }

    /// Start tracking, or replace the tracking config.
    pub async fn start_tracking(&self, config: TrackingConfig) -> Result<()> {
        self.request(|reply| Command::StartTracking(config, reply))
            .await
    }

    /// Stop tracking.
    ///
    /// Pending retry waits are cancelled right away, even if the session
    /// task is busy with a fix.
    pub async fn stop_tracking(&self) -> Result<()> {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        debug!("Cancelled active dispatches");
        self.request(Command::StopTracking).await
    }

    /// Start a trip, optionally with its own config.
    pub async fn start_trip(&self, trip: TripOptions, config: Option<TrackingConfig>) -> Result<()> {
        self.request(|reply| Command::StartTrip(trip, config, reply))
            .await
    }

    /// Complete the current trip.
    pub async fn complete_trip(&self) -> Result<TripOptions> {
        self.request(Command::CompleteTrip).await
    }

    /// Cancel the current trip.
    pub async fn cancel_trip(&self) -> Result<TripOptions> {
        self.request(Command::CancelTrip).await
    }

    /// Replace the config in effect.
    pub async fn update_config(&self, config: TrackingConfig) -> Result<()> {
        self.request(|reply| Command::UpdateConfig(config, reply))
            .await
    }

    /// Send buffered observations now.
    pub async fn flush_replays(&self) -> Result<usize> {
        self.request(Command::FlushReplays).await
    }

    /// Current session state.
    pub async fn state(&self) -> Result<SessionState> {
        self.query(Command::State).await
    }

    /// How often the sensor should deliver fixes now.
    pub async fn desired_interval(&self) -> Result<Option<Duration>> {
        self.query(Command::DesiredInterval).await
    }

    /// Forget all tracking state.
    pub async fn reset(&self) -> Result<()> {
        self.request(Command::Reset).await
    }

    /// Stop the session task after the commands already queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<TrackingMetrics> {
        self.metrics.clone()
    }

    /// Returns `true` once the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
