//! Session event fan-out.
//!
//! Every interested party gets its own receiver from
//! [`EventDispatcher::subscribe`]; there is no single delegate. Sending with
//! no subscribers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use waypost_types::{RecordKind, TrackEvent, TrackingConfig, Transition};

use crate::error::SyncError;
use crate::session::SessionStatus;

/// Events emitted by a tracking session.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TrackingEvent {
    /// The session moved between stopped, tracking, and on-trip.
    StateChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// The server confirmed an entry.
    Entered { kind: RecordKind, id: String },
    /// The server confirmed an exit.
    Exited { kind: RecordKind, id: String },
    /// A live sync was delivered.
    SyncSucceeded { request_id: Uuid, events: usize },
    /// A live sync was rejected and dropped.
    SyncRejected { request_id: Uuid, error: String },
    /// An undeliverable observation was buffered.
    Queued { request_id: Uuid, pending: usize },
    /// A buffered observation was dropped to make room.
    ReplayEvicted { request_id: Uuid, total_evicted: u64 },
    /// Buffered observations were delivered.
    ReplayFlushed { delivered: usize, remaining: usize },
    /// The tracking configuration in effect changed.
    ConfigUpdated { config: TrackingConfig },
}

impl TrackingEvent {
    /// Event for a confirmed transition.
    pub fn from_track_event(event: &TrackEvent) -> Self {
        match event.transition {
            Transition::Entered => TrackingEvent::Entered {
                kind: event.kind,
                id: event.id.clone(),
            },
            Transition::Exited => TrackingEvent::Exited {
                kind: event.kind,
                id: event.id.clone(),
            },
        }
    }

    /// Event for a rejected live sync.
    pub fn rejected(request_id: Uuid, error: &SyncError) -> Self {
        TrackingEvent::SyncRejected {
            request_id,
            error: error.to_string(),
        }
    }
}

/// Receiver for tracking events.
pub type EventReceiver = broadcast::Receiver<TrackingEvent>;

/// Default broadcast buffer size.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<TrackingEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: TrackingEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives() {
        let dispatcher = EventDispatcher::default();
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        let event = TrackingEvent::from_track_event(&TrackEvent::entered(RecordKind::Place, "p"));
        dispatcher.send(event.clone());

        assert_eq!(first.try_recv().unwrap(), event);
        assert_eq!(second.try_recv().unwrap(), event);
    }

    #[test]
    fn test_send_without_subscribers() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(TrackingEvent::ReplayFlushed {
            delivered: 0,
            remaining: 0,
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = TrackingEvent::StateChanged {
            from: SessionStatus::Stopped,
            to: SessionStatus::Tracking,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state_changed\""));
        assert!(json.contains("\"to\":\"tracking\""));
    }
}
