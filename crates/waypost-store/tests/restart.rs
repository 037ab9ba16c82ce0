//! Restart tests: a tracking session backed by SQLite picks up where the
//! previous process left off.

use std::sync::Arc;
use std::time::Duration;

use waypost_core::{
    FixOutcome, MockSyncClient, REPLAY_KEY, RetryConfig, SESSION_KEY, SessionOptions,
    SessionStatus, TrackingSession,
};
use waypost_store::SqliteStore;
use waypost_types::{Coordinate, DeviceMetadata, FixSource, LocationFix, TrackingConfig};

fn options() -> SessionOptions {
    SessionOptions::new(DeviceMetadata::new("restart-test"))
        .live_retry(RetryConfig::new(2).base_delay(Duration::from_millis(50)))
        .replay_retry(RetryConfig::none())
}

fn fix(lat: f64) -> LocationFix {
    LocationFix::new(Coordinate::new(lat, 0.0), 5.0, FixSource::Mock)
}

#[tokio::test(start_paused = true)]
async fn test_replay_buffer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let server = Arc::new(MockSyncClient::new());

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let mut session = TrackingSession::restore(server.clone(), store, options()).unwrap();
        session
            .start_tracking(TrackingConfig::responsive().sync_all_locations(true))
            .unwrap();
        server.set_offline(true);
        for lat in [1.0, 2.0] {
            assert!(matches!(
                session.on_fix(fix(lat)).await.unwrap(),
                FixOutcome::Queued { .. }
            ));
        }
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let keys = store.keys().unwrap();
    assert!(keys.contains(&SESSION_KEY.to_string()));
    assert!(keys.contains(&REPLAY_KEY.to_string()));

    let mut session = TrackingSession::restore(server.clone(), store, options()).unwrap();
    assert_eq!(session.status(), SessionStatus::Tracking);
    assert_eq!(session.replay().len(), 2);

    server.set_offline(false);
    assert_eq!(session.flush_replays().await.unwrap(), 2);
    let replayed: Vec<f64> = server
        .requests()
        .await
        .iter()
        .filter(|r| r.replayed)
        .map(|r| r.fix.coordinate.latitude)
        .collect();
    assert_eq!(replayed, vec![1.0, 2.0]);
}

#[tokio::test]
async fn test_stopped_session_stays_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let server = Arc::new(MockSyncClient::new());

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let mut session = TrackingSession::restore(server.clone(), store, options()).unwrap();
        session.start_tracking(TrackingConfig::efficient()).unwrap();
        session.stop_tracking().unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let mut session = TrackingSession::restore(server.clone(), store, options()).unwrap();
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert_eq!(session.on_fix(fix(0.0)).await.unwrap(), FixOutcome::Ignored);
    assert_eq!(server.call_count(), 0);
}
