#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the session sync integration tests.
//!
//! Provides a scripted [`ScriptedStore`], an event-waiting helper and
//! constructors for common session documents.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use botb_session_sync::protocol::{Millis, Nonce, PendingSound, SessionDocument, SessionPatch};
use botb_session_sync::{SessionEvent, SessionStore, Snapshot, SyncError};
use tokio::sync::mpsc;

// ── ScriptedStore ───────────────────────────────────────────────────

/// A mock store for integration testing.
///
/// Scripted snapshots are consumed in order by `next_snapshot()`.
/// All writes merged by the client are recorded in `merged`.
pub struct ScriptedStore {
    /// Scripted deliveries (consumed in order by `next_snapshot`).
    incoming: VecDeque<Option<Result<Snapshot, SyncError>>>,
    /// Recorded writes from the client.
    pub merged: Arc<StdMutex<Vec<SessionPatch>>>,
    /// Whether `close()` has been called.
    pub closed: Arc<AtomicBool>,
}

impl ScriptedStore {
    /// Create a store with the given scripted deliveries.
    ///
    /// Returns the store plus shared handles for inspecting merged writes and
    /// whether close was called.
    pub fn new(
        incoming: Vec<Option<Result<Snapshot, SyncError>>>,
    ) -> (Self, Arc<StdMutex<Vec<SessionPatch>>>, Arc<AtomicBool>) {
        let merged = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let store = Self {
            incoming: VecDeque::from(incoming),
            merged: Arc::clone(&merged),
            closed: Arc::clone(&closed),
        };
        (store, merged, closed)
    }
}

#[async_trait]
impl SessionStore for ScriptedStore {
    async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError> {
        self.merged.lock().unwrap().push(patch);
        Ok(())
    }

    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            // No more scripted deliveries; hang so the session loop stays
            // subscribed until shutdown.
            std::future::pending().await
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one satisfies `pred`, discarding the rest.
///
/// Panics if no matching event arrives within 60 seconds of (paused) time.
pub async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain every event currently queued.
pub fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Install a test log subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Document helpers ────────────────────────────────────────────────

/// A running segment as the backend stores it.
pub fn running_document(segment: &str, started_at: Millis, total_secs: f64) -> SessionDocument {
    SessionDocument {
        is_active: true,
        started_at: Some(started_at),
        segment_id: Some(Nonce::from(segment)),
        original_total: total_secs,
        ..Default::default()
    }
}

/// A document holding only a pending sound.
pub fn sound_document(id: &str, url: Option<&str>) -> SessionDocument {
    SessionDocument {
        pending_sound: Some(PendingSound {
            id: Nonce::from(id),
            url: url.map(str::to_owned),
        }),
        ..Default::default()
    }
}

/// A confirmed delivery of `document`.
pub fn confirmed(document: SessionDocument) -> Option<Result<Snapshot, SyncError>> {
    Some(Ok(Snapshot::confirmed(Some(document))))
}
