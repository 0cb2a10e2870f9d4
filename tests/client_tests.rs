#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration-style client tests for the session synchronizer.
//!
//! Single-device tests script the store with `ScriptedStore` from
//! `tests/common`. Multi-device tests share a `MemoryBackend` whose server
//! clock differs from the device clocks. All tests run on paused tokio time, so
//! `TokioClock` readings and the tick interval advance together.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use botb_session_sync::protocol::{Cell, Millis, PendingSound};
use botb_session_sync::{
    MemoryBackend, Passover, Primary, RoundId, SessionClient, SessionConfig, SessionEvent,
    SessionPatch, SyncError, Team, TimerState, TokioClock, Totals,
};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use common::{confirmed, drain, init_tracing, running_document, wait_for, ScriptedStore};

const UID: &str = "user-123";
const T0: Millis = 1_700_000_000_000;

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn device(
    backend: &MemoryBackend,
    skew_ms: Millis,
) -> (SessionClient, mpsc::Receiver<SessionEvent>) {
    let config = SessionConfig::new().with_clock(TokioClock::starting_at(T0 + skew_ms));
    SessionClient::connect(backend.subscribe(UID), config)
}

fn backend() -> MemoryBackend {
    MemoryBackend::new(Arc::new(TokioClock::starting_at(T0)))
}

async fn calibrated(events: &mut mpsc::Receiver<SessionEvent>) -> Millis {
    match wait_for(events, |e| matches!(e, SessionEvent::Calibrated { .. })).await {
        SessionEvent::Calibrated { offset_ms, .. } => offset_ms,
        other => panic!("expected Calibrated, got {other:?}"),
    }
}

/// Poll `cond` every 10 ms of paused time, for at most 5 seconds.
async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ════════════════════════════════════════════════════════════════════
// Scripted store
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn connect_emits_connected_and_writes_handshake() {
    init_tracing();
    let (store, merged, _closed) = ScriptedStore::new(vec![]);
    let (mut client, mut events) = SessionClient::connect(store, SessionConfig::new());

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    assert!(client.is_synced());

    let writes = merged.lock().unwrap().clone();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].calib_id.is_some());
    assert!(writes[0].calib_at.is_some());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_running_snapshot_is_adopted() {
    let (store, _merged, _closed) =
        ScriptedStore::new(vec![confirmed(running_document("seg-1", T0, 30.0))]);
    let config = SessionConfig::new().with_clock(TokioClock::starting_at(T0));
    let (mut client, _events) = SessionClient::connect(store, config);

    // Off the 50 ms tick grid so the last tick is unambiguous.
    tokio::time::sleep(Duration::from_millis(10_025)).await;
    let view = client.timer();
    assert_eq!(view.state, TimerState::Running);
    assert_eq!(view.remaining_seconds, 20);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn store_error_disconnects_and_continues_local() {
    let (store, _merged, closed) = ScriptedStore::new(vec![Some(Err(SyncError::StoreReceive(
        "boom".into(),
    )))]);
    let (mut client, mut events) = SessionClient::connect(store, SessionConfig::new());

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            reason: Some("store receive error: boom".into())
        }
    );
    assert!(closed.load(Ordering::Relaxed));
    assert!(!client.is_synced());
    assert!(client.is_running());

    assert_ok!(client.start_timer(10.0));
    assert_eq!(client.timer().state, TimerState::Running);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_end_disconnects_without_reason() {
    let (store, _merged, _closed) = ScriptedStore::new(vec![None]);
    let (mut client, mut events) = SessionClient::connect(store, SessionConfig::new());

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Disconnected { reason: None }
    );

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_store() {
    let (store, _merged, closed) = ScriptedStore::new(vec![]);
    let (mut client, mut events) = SessionClient::connect(store, SessionConfig::new());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);

    client.shutdown().await;

    assert!(closed.load(Ordering::Relaxed));
    assert!(!client.is_running());
    assert!(matches!(
        client.broadcast_sound(Some("horn.mp3".into())),
        Err(SyncError::ClientShutDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn local_pause_writes_remaining_time() {
    let (store, merged, _closed) = ScriptedStore::new(vec![]);
    let config = SessionConfig::new().with_clock(TokioClock::starting_at(T0));
    let (mut client, _events) = SessionClient::connect(store, config);

    client.start_timer(20.0).unwrap();
    tokio::time::sleep(Duration::from_millis(5_025)).await;
    client.pause_timer().unwrap();
    tokio::task::yield_now().await;

    let writes = merged.lock().unwrap().clone();
    let start = &writes[1];
    assert_eq!(start.is_active, Some(true));
    assert_eq!(start.is_paused, Some(false));
    assert_eq!(start.original_total, Some(20.0));
    assert_eq!(start.remaining_on_pause, Some(0.0));
    assert!(start.started_at.is_some());
    assert!(start.segment_id.is_some());

    let pause = writes.last().unwrap();
    assert_eq!(pause.is_paused, Some(true));
    let remaining = pause.remaining_on_pause.unwrap();
    assert!((remaining - 14.975).abs() < 0.001, "remaining {remaining}");
    assert_eq!(client.timer().state, TimerState::Paused);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn passover_without_wrong_primary_writes_nothing() {
    let (store, merged, _closed) = ScriptedStore::new(vec![]);
    let (mut client, mut events) = SessionClient::connect(store, SessionConfig::new());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);

    assert_ok!(client.set_passover(RoundId::R2, Passover::AwardedTwo));
    client.set_primary(RoundId::R3, Primary::AwardedTwo).unwrap();
    assert_ok!(client.set_passover(RoundId::R3, Passover::AwardedTwo));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Handshake plus the primary mark only.
    let writes = merged.lock().unwrap().clone();
    assert_eq!(writes.len(), 2);
    assert_eq!(client.scoreboard().cell(RoundId::R2), Cell::default());
    assert_eq!(client.scoreboard().cell(RoundId::R3).passover, Passover::Unanswered);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn attach_subscribes_a_local_client() {
    let (mut client, mut events) = SessionClient::local(SessionConfig::new());
    assert!(!client.is_synced());

    let (store, merged, _closed) = ScriptedStore::new(vec![]);
    client.attach(store).unwrap();

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    assert!(client.is_synced());
    tokio::task::yield_now().await;
    assert!(merged.lock().unwrap()[0].calib_id.is_some());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_event_channel_drops_pulses() {
    let config = SessionConfig::new()
        .with_clock(TokioClock::starting_at(T0))
        .with_event_channel_capacity(1);
    let (mut client, mut events) = SessionClient::local(config);

    client.start_timer(6.0).unwrap();
    tokio::time::sleep(Duration::from_secs(7)).await;

    // The warning filled the channel; the finish pulse was dropped.
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::FiveSecondWarning { seq: 1, .. }
    ));
    assert!(events.try_recv().is_err());
    assert_eq!(client.timer().state, TimerState::Idle);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Shared memory backend
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn skewed_devices_show_the_same_countdown() {
    init_tracing();
    let backend = backend();
    let (mut one, mut events_one) = device(&backend, 0);
    let (mut two, mut events_two) = device(&backend, 3_000);

    assert_eq!(calibrated(&mut events_one).await, 0);
    assert_eq!(calibrated(&mut events_two).await, -3_000);
    assert_eq!(two.clock_offset_ms(), -3_000);

    one.start_timer(20.0).unwrap();
    tokio::time::sleep(Duration::from_millis(7_025)).await;

    let (a, b) = (one.timer(), two.timer());
    assert_eq!(a.state, TimerState::Running);
    assert_eq!(b.state, TimerState::Running);
    assert_eq!(a.remaining_seconds, 13);
    assert_eq!(b.remaining_seconds, 13);
    assert!((a.progress - b.progress).abs() < 0.25);

    wait_for(&mut events_one, |e| {
        matches!(e, SessionEvent::FiveSecondWarning { .. })
    })
    .await;
    wait_for(&mut events_two, |e| {
        matches!(e, SessionEvent::FiveSecondWarning { .. })
    })
    .await;
    wait_for(&mut events_one, |e| matches!(e, SessionEvent::Finished { .. })).await;
    wait_for(&mut events_two, |e| matches!(e, SessionEvent::Finished { .. })).await;

    assert_eq!(one.timer().state, TimerState::Idle);
    assert_eq!(two.timer().state, TimerState::Idle);
    eventually(|| backend.document(UID).is_some_and(|doc| !doc.is_active)).await;

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_propagate() {
    let backend = backend();
    let (mut one, mut events_one) = device(&backend, 0);
    let (mut two, mut events_two) = device(&backend, -2_000);
    calibrated(&mut events_one).await;
    calibrated(&mut events_two).await;

    one.start_timer(20.0).unwrap();
    tokio::time::sleep(Duration::from_millis(5_025)).await;
    one.pause_timer().unwrap();

    eventually(|| two.timer().state == TimerState::Paused).await;
    assert_eq!(two.timer().remaining_seconds, 15);

    two.resume_timer().unwrap();
    eventually(|| one.timer().state == TimerState::Running).await;
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let (a, b) = (one.timer(), two.timer());
    assert!(a.remaining_seconds.abs_diff(b.remaining_seconds) <= 1);
    assert!((a.progress - b.progress).abs() < 0.5);

    one.reset_timer().unwrap();
    eventually(|| two.timer().state == TimerState::Idle).await;
    assert_eq!(two.timer().remaining_seconds, 0);

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn broadcast_sound_reaches_others_but_not_sender() {
    let backend = backend();
    let (mut one, mut events_one) = device(&backend, 0);
    let (mut two, mut events_two) = device(&backend, 0);
    calibrated(&mut events_one).await;
    calibrated(&mut events_two).await;

    one.broadcast_sound(Some("horn.mp3".into())).unwrap();
    let event = wait_for(&mut events_two, |e| {
        matches!(e, SessionEvent::RemoteSound { .. })
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::RemoteSound { url: Some(ref url), .. } if url == "horn.mp3"
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!drain(&mut events_one)
        .iter()
        .any(|e| matches!(e, SessionEvent::RemoteSound { .. })));

    two.broadcast_sound(None).unwrap();
    let event = wait_for(&mut events_one, |e| {
        matches!(e, SessionEvent::RemoteSound { .. })
    })
    .await;
    assert!(matches!(event, SessionEvent::RemoteSound { url: None, .. }));

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn existing_sound_is_not_replayed_on_connect() {
    let backend = backend();
    backend.write(
        UID,
        SessionPatch {
            pending_sound: Some(PendingSound {
                id: "earlier".into(),
                url: Some("old.mp3".into()),
            }),
            ..Default::default()
        },
    );

    let (mut quiet, mut quiet_events) = device(&backend, 0);
    calibrated(&mut quiet_events).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!drain(&mut quiet_events)
        .iter()
        .any(|e| matches!(e, SessionEvent::RemoteSound { .. })));

    let config = SessionConfig::new()
        .with_clock(TokioClock::starting_at(T0))
        .with_replay_sound_on_connect(true);
    let (mut replaying, mut replay_events) =
        SessionClient::connect(backend.subscribe(UID), config);
    let event = wait_for(&mut replay_events, |e| {
        matches!(e, SessionEvent::RemoteSound { .. })
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::RemoteSound { url: Some(ref url), .. } if url == "old.mp3"
    ));

    quiet.shutdown().await;
    replaying.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn passover_scores_for_the_other_team() {
    let backend = backend();
    let (mut one, _events_one) = device(&backend, 0);
    let (mut two, _events_two) = device(&backend, 0);

    one.set_primary(RoundId::R1, Primary::Wrong).unwrap();
    eventually(|| two.scoreboard().cell(RoundId::R1).primary == Primary::Wrong).await;

    two.set_passover(RoundId::R1, Passover::AwardedTwo).unwrap();
    eventually(|| one.totals() == Totals { team_a: 0, team_b: 2 }).await;

    one.set_primary(RoundId::R1, Primary::AwardedThree).unwrap();
    eventually(|| {
        two.scoreboard().cell(RoundId::R1)
            == Cell {
                primary: Primary::AwardedThree,
                passover: Passover::Unanswered,
            }
    })
    .await;
    assert_eq!(two.totals(), Totals { team_a: 3, team_b: 0 });

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn team_names_and_page_sync() {
    let backend = backend();
    let (mut one, _events_one) = device(&backend, 0);
    let (mut two, _events_two) = device(&backend, 0);

    two.set_team_name(Team::A, "Owls").unwrap();
    one.set_page(2).unwrap();
    eventually(|| one.scoreboard().team_name(Team::A) == "Owls").await;
    eventually(|| two.scoreboard().page() == 2).await;

    let record = one.to_record();
    assert_eq!(record.team_a, "Owls");
    assert_eq!(record.team_b, "Team B");

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restored_record_reaches_other_devices() {
    let backend = backend();
    let (mut one, _events_one) = device(&backend, 0);
    let (mut two, _events_two) = device(&backend, 0);

    one.set_primary(RoundId::R2, Primary::AwardedTwo).unwrap();
    one.set_team_name(Team::B, "Foxes").unwrap();
    let record = one.to_record();
    assert_eq!(record.score_b, 2);

    eventually(|| two.totals().team_b == 2).await;

    one.reset_scores().unwrap();
    eventually(|| two.totals() == Totals::default()).await;

    two.restore_record(&record).unwrap();
    eventually(|| one.totals() == Totals { team_a: 0, team_b: 2 }).await;
    assert_eq!(one.scoreboard().team_name(Team::B), "Foxes");
    assert_eq!(one.scoreboard().page(), 0);

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_then_reattach_rebuilds_shadow() {
    let backend = backend();
    let (mut client, mut events) = device(&backend, 0);
    calibrated(&mut events).await;

    backend.disconnect_all();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert!(!client.is_synced());

    // Local-only mode still counts down on this device.
    client.start_timer(10.0).unwrap();
    assert_eq!(client.timer().state, TimerState::Running);
    assert!(backend.document(UID).is_some_and(|doc| !doc.is_active));

    client.attach(backend.subscribe(UID)).unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Connected)).await;
    calibrated(&mut events).await;
    assert!(client.is_synced());

    // The backend never saw the local start, so the shadow follows the backend.
    assert_eq!(client.timer().state, TimerState::Idle);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_writes_do_not_reach_the_backend() {
    let backend = backend();
    let (mut client, mut events) = device(&backend, 0);
    calibrated(&mut events).await;

    backend.fail_writes(true);
    client.start_timer(10.0).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(backend.document(UID).is_some_and(|doc| !doc.is_active));
    assert_eq!(client.timer().state, TimerState::Running);
    assert!(client.is_synced());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn held_start_counts_down_locally_until_confirmed() {
    let backend = backend();
    let (mut one, mut events_one) = device(&backend, 0);
    let (mut two, mut events_two) = device(&backend, 0);
    calibrated(&mut events_one).await;
    calibrated(&mut events_two).await;

    backend.hold_writes();
    one.start_timer(20.0).unwrap();
    tokio::time::sleep(Duration::from_millis(2_025)).await;

    assert_eq!(one.timer().remaining_seconds, 18);
    assert_eq!(two.timer().state, TimerState::Idle);

    backend.release_writes();
    eventually(|| two.timer().state == TimerState::Running).await;

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn start_survives_a_snapshot_queued_before_it() {
    for _ in 0..8 {
        let backend = backend();
        let (mut one, mut events_one) = device(&backend, 0);
        calibrated(&mut events_one).await;

        backend.hold_writes();
        // Another writer's change is already queued for device one when it starts.
        backend.write(
            UID,
            SessionPatch {
                team_b: Some("Foxes".into()),
                ..Default::default()
            },
        );
        one.start_timer(20.0).unwrap();
        tokio::time::sleep(Duration::from_millis(2_025)).await;

        let view = one.timer();
        assert_eq!(view.state, TimerState::Running);
        assert_eq!(view.remaining_seconds, 18);
        assert!(view.progress > 0.0);
        assert_eq!(one.scoreboard().team_name(Team::B), "Foxes");

        backend.release_writes();
        one.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn watch_timer_follows_remote_changes() {
    let backend = backend();
    let (mut one, mut events_one) = device(&backend, 0);
    let (mut two, _events_two) = device(&backend, 0);
    calibrated(&mut events_one).await;

    let mut rx = two.watch_timer();
    one.start_timer(30.0).unwrap();
    let running = rx.wait_for(|view| view.state == TimerState::Running);
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    one.shutdown().await;
    two.shutdown().await;
}
