//! End-to-end tests for the tracking session against the mock server and
//! in-memory storage.
//!
//! Run with `cargo test --package waypost-core --test session_flow`.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;
use waypost_core::{
    FixOutcome, MemoryStore, MockSyncClient, RetryConfig, SessionOptions, SessionState,
    SessionStatus, SyncError, TrackingEvent, TrackingSession,
};
use waypost_types::{
    BeaconRecord, Coordinate, DeviceMetadata, FixSource, GeofenceRecord, LocationFix, Membership,
    NearbyUpdate, PlaceRecord, RecordKind, SyncResponse, SyncedRegion, TrackEvent, TrackingConfig,
    TripOptions,
};

/// Roughly 50 km north of the origin.
const FAR_LATITUDE: f64 = 0.45;

fn options() -> SessionOptions {
    SessionOptions::new(DeviceMetadata::new("integration-device"))
        .live_retry(
            RetryConfig::new(3)
                .base_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(2)),
        )
        .replay_retry(RetryConfig::none())
}

fn fix_at(lat: f64, lon: f64) -> LocationFix {
    LocationFix::new(Coordinate::new(lat, lon), 8.0, FixSource::BackgroundUpdate)
}

/// A geofence and a place at the origin, and a beacon about 1.5 km away.
fn origin_nearby() -> NearbyUpdate {
    NearbyUpdate {
        geofences: Some(vec![GeofenceRecord::circle(
            "home",
            Coordinate::new(0.0, 0.0),
            100.0,
        )]),
        beacons: Some(vec![BeaconRecord::new(
            "front-door",
            Uuid::nil(),
            Coordinate::new(0.01, 0.01),
        )]),
        places: Some(vec![
            PlaceRecord::new("cafe", "Corner Cafe", Coordinate::new(0.0, 0.0)).with_radius(30.0),
        ]),
        beacon_uuids: Some(vec![Uuid::nil()]),
        synced_region: Some(SyncedRegion::new(Coordinate::new(0.0, 0.0), 5_000.0)),
    }
}

struct World {
    server: Arc<MockSyncClient>,
    store: Arc<MemoryStore>,
}

impl World {
    fn new() -> Self {
        Self {
            server: Arc::new(MockSyncClient::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn session(&self) -> TrackingSession {
        TrackingSession::restore(self.server.clone(), self.store.clone(), options()).unwrap()
    }
}

/// Sync once at the origin so the cache holds `origin_nearby`.
async fn prime(world: &World, session: &mut TrackingSession) {
    world.server.push_response(
        SyncResponse::confirming(Membership::new()).with_nearby(origin_nearby()),
    );
    let outcome = session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    assert!(matches!(outcome, FixOutcome::Synced { .. }));
}

#[tokio::test]
async fn entering_a_geofence_at_the_origin() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    prime(&world, &mut session).await;
    let mut events = session.subscribe();

    let outcome = session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    let FixOutcome::Synced { events: confirmed, .. } = outcome else {
        panic!("expected a sync, got {outcome:?}");
    };
    assert_eq!(
        confirmed,
        vec![
            TrackEvent::entered(RecordKind::Place, "cafe"),
            TrackEvent::entered(RecordKind::Geofence, "home"),
        ]
    );

    let requests = world.server.requests().await;
    let last = requests.last().unwrap();
    assert!(last.membership.geofences.contains("home"));
    // the beacon is installed well away from the fix
    assert!(last.membership.beacons.is_empty());

    let mut entered = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TrackingEvent::Entered { kind, id } = event {
            entered.push((kind, id));
        }
    }
    assert_eq!(
        entered,
        vec![
            (RecordKind::Place, "cafe".to_string()),
            (RecordKind::Geofence, "home".to_string()),
        ]
    );
}

#[tokio::test]
async fn steady_state_fixes_stay_local() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    prime(&world, &mut session).await;
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    let calls_before = world.server.call_count();

    for i in 0..20 {
        let jitter = f64::from(i) * 0.000_01;
        let outcome = session.on_fix(fix_at(jitter, 0.0)).await.unwrap();
        assert_eq!(outcome, FixOutcome::Skipped);
    }
    assert_eq!(world.server.call_count(), calls_before);
    assert!(session.replay().is_empty());

    let snapshot = session.metrics().snapshot();
    assert!(snapshot.skip_ratio().unwrap() > 0.5);
}

#[tokio::test]
async fn leaving_the_synced_region_forces_a_sync() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    // region around the origin but no records at all
    world.server.push_response(
        SyncResponse::default().with_nearby(NearbyUpdate {
            geofences: Some(vec![]),
            synced_region: Some(SyncedRegion::new(Coordinate::new(0.0, 0.0), 10_000.0)),
            ..Default::default()
        }),
    );
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    assert_eq!(
        session.on_fix(fix_at(0.001, 0.0)).await.unwrap(),
        FixOutcome::Skipped
    );

    let outcome = session.on_fix(fix_at(FAR_LATITUDE, 0.0)).await.unwrap();
    assert_eq!(
        outcome,
        FixOutcome::Synced {
            events: vec![],
            flushed: 0,
        }
    );
    let requests = world.server.requests().await;
    assert!(requests.last().unwrap().membership.is_empty());
}

#[tokio::test]
async fn trip_restores_the_exact_pre_trip_config() {
    let world = World::new();
    let mut session = world.session();
    let mut config_a = TrackingConfig::efficient().sync_all_locations(true);
    config_a.moving_update_interval = 917;
    config_a.stopped_update_interval = 4211;
    session.start_tracking(config_a.clone()).unwrap();

    session
        .start_trip(
            TripOptions::new("delivery-42").with_destination("warehouse"),
            Some(TrackingConfig::continuous()),
        )
        .unwrap();
    assert_eq!(session.status(), SessionStatus::OnTrip);
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

    let trip = session.complete_trip().unwrap();
    assert_eq!(trip.external_id, "delivery-42");
    assert_eq!(
        session.state(),
        &SessionState::Tracking {
            config: config_a.clone()
        }
    );

    // survives a restart too
    drop(session);
    let restored = world.session();
    assert_eq!(restored.active_config(), Some(&config_a));
}

#[tokio::test(start_paused = true)]
async fn offline_fixes_are_buffered_and_flushed_in_order() {
    let world = World::new();
    let mut session = world.session();
    session
        .start_tracking(TrackingConfig::responsive().sync_all_locations(true))
        .unwrap();

    world.server.set_offline(true);
    for (i, lat) in [0.1, 0.2, 0.3].into_iter().enumerate() {
        let outcome = session.on_fix(fix_at(lat, 0.0)).await.unwrap();
        assert_eq!(outcome, FixOutcome::Queued { pending: i + 1 });
    }
    // 3 attempts per fix
    assert_eq!(world.server.call_count(), 9);

    world.server.set_offline(false);
    let outcome = session.on_fix(fix_at(0.4, 0.0)).await.unwrap();
    assert!(matches!(outcome, FixOutcome::Synced { flushed: 3, .. }));

    let requests = world.server.requests().await;
    let delivered: Vec<f64> = requests
        .iter()
        .skip(9)
        .map(|r| r.fix.coordinate.latitude)
        .collect();
    assert_eq!(delivered, vec![0.4, 0.1, 0.2, 0.3]);
    assert!(requests[10..].iter().all(|r| r.replayed));
    assert_eq!(session.metrics().snapshot().flushed, 3);
}

#[tokio::test(start_paused = true)]
async fn full_buffer_evicts_oldest_and_counts_it() {
    let world = World::new();
    let mut session = world.session();
    session.set_replay_capacity(2).unwrap();
    session
        .start_tracking(TrackingConfig::responsive().sync_all_locations(true))
        .unwrap();
    let mut events = session.subscribe();

    world.server.set_offline(true);
    for lat in [0.1, 0.2, 0.3] {
        session.on_fix(fix_at(lat, 0.0)).await.unwrap();
    }

    let kept: Vec<f64> = session
        .replay()
        .iter()
        .map(|e| e.request.fix.coordinate.latitude)
        .collect();
    assert_eq!(kept, vec![0.2, 0.3]);
    assert_eq!(session.replay().evicted_count(), 1);
    assert_eq!(session.metrics().snapshot().evicted, 1);

    let mut evictions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TrackingEvent::ReplayEvicted { total_evicted: 1, .. }) {
            evictions += 1;
        }
    }
    assert_eq!(evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_rejection_is_not_retried_or_buffered() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    world.server.push_failure(SyncError::PaymentRequired);

    let outcome = session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    assert_eq!(
        outcome,
        FixOutcome::Rejected {
            error: SyncError::PaymentRequired
        }
    );
    assert_eq!(world.server.call_count(), 1);
    assert!(session.replay().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stopping_discards_an_in_flight_result() {
    let world = World::new();
    world.server.set_latency(Duration::from_secs(5));
    let handle = world.session().spawn();
    handle
        .start_tracking(TrackingConfig::responsive())
        .await
        .unwrap();

    let producer = handle.clone();
    let pending = tokio::spawn(async move { producer.on_fix(fix_at(0.0, 0.0)).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.stop_tracking().await.unwrap();

    // the attempt completed, but nothing it returned was applied
    assert_eq!(pending.await.unwrap().unwrap(), FixOutcome::Discarded);
    assert_eq!(world.server.call_count(), 1);
    assert_eq!(handle.state().await.unwrap(), SessionState::Stopped);

    let restored = world.session();
    assert!(restored.cache().synced_region().is_none());
    assert!(restored.replay().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_rehydrates_buffer_cache_and_state() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    prime(&world, &mut session).await;
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

    world.server.set_offline(true);
    session.on_fix(fix_at(FAR_LATITUDE, 0.0)).await.unwrap();
    assert_eq!(session.replay().len(), 1);
    drop(session);

    let mut restored = world.session();
    assert_eq!(restored.status(), SessionStatus::Tracking);
    assert_eq!(restored.replay().len(), 1);
    assert_eq!(restored.cache().geofences().len(), 1);
    assert!(
        restored
            .cache()
            .confirmed_membership()
            .geofences
            .contains("home")
    );

    // first fix after restart at home is local, then an explicit flush delivers
    world.server.set_offline(false);
    assert_eq!(
        restored.on_fix(fix_at(0.0, 0.0)).await.unwrap(),
        FixOutcome::Skipped
    );
    assert_eq!(restored.flush_replays().await.unwrap(), 1);
    assert!(restored.replay().is_empty());
}

#[tokio::test]
async fn beacon_ranging_enters_and_exits() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    prime(&world, &mut session).await;
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();

    let outcome = session.on_beacon_detected("front-door", true).await.unwrap();
    assert_eq!(
        outcome,
        FixOutcome::Synced {
            events: vec![TrackEvent::entered(RecordKind::Beacon, "front-door")],
            flushed: 0,
        }
    );

    let outcome = session.on_beacon_detected("front-door", false).await.unwrap();
    assert_eq!(
        outcome,
        FixOutcome::Synced {
            events: vec![TrackEvent::exited(RecordKind::Beacon, "front-door")],
            flushed: 0,
        }
    );
}

#[tokio::test]
async fn remote_config_during_trip_applies_after_the_trip() {
    let world = World::new();
    let mut session = world.session();
    session.start_tracking(TrackingConfig::responsive()).unwrap();
    session
        .start_trip(TripOptions::new("commute"), Some(TrackingConfig::continuous()))
        .unwrap();

    let remote = TrackingConfig::efficient();
    world
        .server
        .push_response(SyncResponse::default().with_config(remote.clone()));
    session.on_fix(fix_at(0.0, 0.0)).await.unwrap();
    assert_eq!(session.active_config(), Some(&TrackingConfig::continuous()));

    session.cancel_trip().unwrap();
    assert_eq!(session.active_config(), Some(&remote));
}

#[tokio::test]
async fn stop_detection_reports_stopped_fixes() {
    let world = World::new();
    let mut session = world.session();
    let config = TrackingConfig::responsive()
        .stop_detection(120, 50.0)
        .sync_all_locations(true);
    session.start_tracking(config).unwrap();

    let start = OffsetDateTime::now_utc();
    for minutes in [0, 1, 3] {
        let fix = LocationFix::at(
            start + time::Duration::minutes(minutes),
            Coordinate::new(0.0, 0.0),
            8.0,
            FixSource::BackgroundUpdate,
        );
        session.on_fix(fix).await.unwrap();
    }

    let stopped: Vec<bool> = world
        .server
        .requests()
        .await
        .iter()
        .map(|r| r.stopped)
        .collect();
    assert_eq!(stopped, vec![false, false, true]);
    assert!(session.is_stopped());
    // responsive disables updates while stopped
    assert_eq!(session.desired_interval(), None);
}
