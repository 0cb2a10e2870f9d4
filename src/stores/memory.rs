//! In-process document backend.
//!
//! [`MemoryBackend`] keeps one [`SessionDocument`] per user and resolves server
//! timestamps from its own [`Clock`], which may differ from any device clock.
//! Each [`MemoryStore`] is one device's subscription. Writes show up first as an
//! unconfirmed snapshot on the writing device, then as a confirmed snapshot on
//! every subscriber of the same user.
//!
//! Fault injection: [`hold_writes`](MemoryBackend::hold_writes) delays
//! confirmation until [`release_writes`](MemoryBackend::release_writes),
//! [`fail_writes`](MemoryBackend::fail_writes) refuses writes, and
//! [`disconnect_all`](MemoryBackend::disconnect_all) ends every subscription.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::SyncError;
use crate::protocol::{SessionDocument, SessionPatch};
use crate::store::{PendingWrites, SessionStore, Snapshot};

#[derive(Debug)]
struct Delivery {
    document: Option<SessionDocument>,
    acknowledged: Option<u64>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    uid: String,
    acknowledged: Option<u64>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct Write {
    uid: String,
    origin: Option<(u64, u64)>,
    patch: SessionPatch,
}

#[derive(Debug)]
struct Inner {
    clock: Arc<dyn Clock>,
    documents: HashMap<String, SessionDocument>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    holding: bool,
    held: VecDeque<Write>,
    failing: bool,
}

impl Inner {
    fn apply(&mut self, write: Write) {
        let now = self.clock.now_ms();
        self.documents
            .entry(write.uid.clone())
            .or_default()
            .apply_patch(&write.patch, Some(now));
        if let Some((subscriber, write_id)) = write.origin {
            if let Some(sub) = self.subscribers.iter_mut().find(|s| s.id == subscriber) {
                sub.acknowledged = Some(write_id);
            }
        }
        self.broadcast(&write.uid);
    }

    fn broadcast(&mut self, uid: &str) {
        let document = self.documents.get(uid).cloned();
        self.subscribers.retain(|sub| {
            if sub.uid != uid {
                return true;
            }
            sub.tx
                .send(Delivery {
                    document: document.clone(),
                    acknowledged: sub.acknowledged,
                })
                .is_ok()
        });
    }
}

/// A shared in-memory document store.
///
/// Clones share the same documents and subscribers.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    /// A backend whose server timestamps come from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                clock,
                documents: HashMap::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                holding: false,
                held: VecDeque::new(),
                failing: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to `uid`'s document. The current document is delivered first.
    pub fn subscribe(&self, uid: impl Into<String>) -> MemoryStore {
        let uid = uid.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        let _ = tx.send(Delivery {
            document: inner.documents.get(&uid).cloned(),
            acknowledged: None,
        });
        inner.subscribers.push(Subscriber {
            id,
            uid: uid.clone(),
            acknowledged: None,
            tx,
        });
        debug!(uid = %uid, subscriber = id, "memory subscription opened");
        drop(inner);

        MemoryStore {
            backend: self.clone(),
            uid,
            id,
            ledger: PendingWrites::new(),
            outbox: VecDeque::new(),
            rx,
            closed: false,
        }
    }

    /// The confirmed document of `uid`.
    pub fn document(&self, uid: &str) -> Option<SessionDocument> {
        self.lock().documents.get(uid).cloned()
    }

    /// Write directly as the backend, e.g. to simulate a device without a store.
    pub fn write(&self, uid: &str, patch: SessionPatch) {
        self.lock().apply(Write {
            uid: uid.to_owned(),
            origin: None,
            patch,
        });
    }

    /// Queue writes instead of confirming them.
    pub fn hold_writes(&self) {
        self.lock().holding = true;
    }

    /// Confirm every held write in arrival order and stop holding.
    pub fn release_writes(&self) {
        let mut inner = self.lock();
        inner.holding = false;
        while let Some(write) = inner.held.pop_front() {
            inner.apply(write);
        }
    }

    /// Refuse (`true`) or accept (`false`) subsequent writes.
    pub fn fail_writes(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// End every subscription.
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();
        debug!(count = inner.subscribers.len(), "dropping all memory subscriptions");
        inner.subscribers.clear();
    }

    /// Number of live subscriptions to `uid`.
    pub fn subscriber_count(&self, uid: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| sub.uid == uid)
            .count()
    }

    fn submit(
        &self,
        subscriber: u64,
        uid: &str,
        write_id: u64,
        patch: SessionPatch,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(SyncError::StoreWrite("backend refused the write".into()));
        }
        if !inner.subscribers.iter().any(|sub| sub.id == subscriber) {
            return Err(SyncError::StoreClosed);
        }
        let write = Write {
            uid: uid.to_owned(),
            origin: Some((subscriber, write_id)),
            patch,
        };
        if inner.holding {
            inner.held.push_back(write);
        } else {
            inner.apply(write);
        }
        Ok(())
    }

    fn unsubscribe(&self, subscriber: u64) {
        self.lock().subscribers.retain(|sub| sub.id != subscriber);
    }
}

/// One device's subscription to a [`MemoryBackend`] document.
#[derive(Debug)]
pub struct MemoryStore {
    backend: MemoryBackend,
    uid: String,
    id: u64,
    ledger: PendingWrites,
    outbox: VecDeque<Snapshot>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl MemoryStore {
    /// The user this subscription belongs to.
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::StoreClosed);
        }
        let write_id = self.ledger.record(patch.clone());
        if let Err(e) = self.backend.submit(self.id, &self.uid, write_id, patch) {
            let _ = self.ledger.reject(write_id);
            return Err(e);
        }
        if let Some(overlay) = self.ledger.overlay() {
            self.outbox.push_back(overlay);
        }
        Ok(())
    }

    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>> {
        if self.closed {
            return None;
        }
        if let Some(snapshot) = self.outbox.pop_front() {
            return Some(Ok(snapshot));
        }
        let delivery = self.rx.recv().await?;
        Some(Ok(self.ledger.confirm(delivery.document, delivery.acknowledged)))
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.backend.unsubscribe(self.id);
        debug!(uid = %self.uid, subscriber = self.id, "memory subscription closed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::ServerTimestamp;

    fn backend(start_ms: i64) -> (MemoryBackend, ManualClock) {
        let clock = ManualClock::new(start_ms);
        (MemoryBackend::new(Arc::new(clock.clone())), clock)
    }

    fn start_patch() -> SessionPatch {
        SessionPatch {
            is_active: Some(true),
            started_at: Some(ServerTimestamp::new()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn subscription_starts_with_current_document() {
        let (backend, _) = backend(0);
        let mut store = backend.subscribe("u1");
        let first = store.next_snapshot().await.unwrap().unwrap();
        assert_eq!(first, Snapshot::confirmed(None));
    }

    #[tokio::test]
    async fn write_is_pending_then_confirmed_with_server_time() {
        let (backend, clock) = backend(7_000);
        let mut store = backend.subscribe("u1");
        let _ = store.next_snapshot().await;

        clock.advance(25);
        store.merge(start_patch()).await.unwrap();

        let pending = store.next_snapshot().await.unwrap().unwrap();
        assert!(pending.has_pending_writes);
        assert_eq!(pending.document.as_ref().unwrap().started_at, None);

        let confirmed = store.next_snapshot().await.unwrap().unwrap();
        assert!(!confirmed.has_pending_writes);
        assert_eq!(confirmed.document.unwrap().started_at, Some(7_025));
    }

    #[tokio::test]
    async fn other_subscribers_only_see_confirmed_documents() {
        let (backend, _) = backend(100);
        let mut writer = backend.subscribe("u1");
        let mut reader = backend.subscribe("u1");
        let _ = writer.next_snapshot().await;
        let _ = reader.next_snapshot().await;

        writer.merge(start_patch()).await.unwrap();
        let seen = reader.next_snapshot().await.unwrap().unwrap();
        assert!(!seen.has_pending_writes);
        assert_eq!(seen.document.unwrap().started_at, Some(100));
    }

    #[tokio::test]
    async fn held_writes_stay_pending_until_released() {
        let (backend, clock) = backend(0);
        let mut store = backend.subscribe("u1");
        let _ = store.next_snapshot().await;

        backend.hold_writes();
        store.merge(start_patch()).await.unwrap();
        assert!(store.next_snapshot().await.unwrap().unwrap().has_pending_writes);
        assert!(backend.document("u1").is_none());

        clock.advance(500);
        backend.release_writes();
        let confirmed = store.next_snapshot().await.unwrap().unwrap();
        assert!(!confirmed.has_pending_writes);
        assert_eq!(confirmed.document.unwrap().started_at, Some(500));
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_not_kept() {
        let (backend, _) = backend(0);
        let mut store = backend.subscribe("u1");
        let _ = store.next_snapshot().await;

        backend.fail_writes(true);
        let err = store.merge(start_patch()).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreWrite(_)));
        assert!(backend.document("u1").is_none());
    }

    #[tokio::test]
    async fn disconnect_ends_subscription() {
        let (backend, _) = backend(0);
        let mut store = backend.subscribe("u1");
        let _ = store.next_snapshot().await;

        backend.disconnect_all();
        assert!(store.next_snapshot().await.is_none());
        assert!(matches!(
            store.merge(start_patch()).await.unwrap_err(),
            SyncError::StoreClosed
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unsubscribes() {
        let (backend, _) = backend(0);
        let mut store = backend.subscribe("u1");
        assert_eq!(backend.subscriber_count("u1"), 1);
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(backend.subscriber_count("u1"), 0);
        assert!(store.next_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let (backend, _) = backend(0);
        let mut a = backend.subscribe("a");
        let _ = a.next_snapshot().await;
        backend.write("b", start_patch());
        assert!(backend.document("a").is_none());
        assert!(backend.document("b").unwrap().is_active);
    }
}
