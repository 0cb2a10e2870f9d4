//! Backend abstraction for the shared session document.
//!
//! The [`SessionStore`] trait is the seam between the session loop and a
//! document backend. A backend must offer:
//!
//! - merge-style partial writes, where only listed fields are replaced;
//! - a live subscription delivering the full document on every change;
//! - a way to tell a locally-originated unconfirmed write from a confirmed one
//!   ([`Snapshot::has_pending_writes`]);
//! - a server timestamp directive, resolved by the backend at write time.
//!
//! Connection setup is not part of the trait. Build a connected store, then pass
//! it to [`SessionClient::connect`](crate::SessionClient::connect).
//!
//! # Implementing a Custom Store
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use botb_session_sync::error::SyncError;
//! use botb_session_sync::protocol::SessionPatch;
//! use botb_session_sync::store::{SessionStore, Snapshot};
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl SessionStore for MyStore {
//!     async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError> {
//!         // Queue the partial write with your backend
//!         # let _ = patch;
//!         Ok(())
//!     }
//!
//!     async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>> {
//!         // Wait for the next document change
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SyncError> {
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SyncError;
use crate::protocol::{SessionDocument, SessionPatch};

/// One delivery of the full session document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// `None` if the document has never been written.
    pub document: Option<SessionDocument>,
    /// `true` if the document includes local writes the backend has not
    /// confirmed. Server timestamps written by those writes read as `None`.
    pub has_pending_writes: bool,
}

impl Snapshot {
    /// A confirmed snapshot.
    pub fn confirmed(document: Option<SessionDocument>) -> Self {
        Self {
            document,
            has_pending_writes: false,
        }
    }

    /// An unconfirmed snapshot carrying local writes.
    pub fn pending(document: SessionDocument) -> Self {
        Self {
            document: Some(document),
            has_pending_writes: true,
        }
    }
}

/// A subscription to one user's session document.
///
/// # Object Safety
///
/// This trait is object-safe; the session loop holds stores as
/// `Box<dyn SessionStore>` so that [`attach`](crate::SessionClient::attach) can
/// swap one in after a disconnect.
///
/// # Cancel Safety
///
/// [`next_snapshot`](SessionStore::next_snapshot) **MUST** be cancel-safe because
/// it is polled inside `tokio::select!`. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait SessionStore: Send + 'static {
    /// Merge a partial write into the document.
    ///
    /// Implementations should deliver an unconfirmed snapshot reflecting the
    /// write before the backend confirms it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreWrite`] or [`SyncError::StoreClosed`] if the
    /// write could not be queued.
    async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError>;

    /// Wait for the next snapshot.
    ///
    /// Returns:
    /// - `Some(Ok(snapshot))`: the document changed (or a write was applied locally)
    /// - `Some(Err(e))`: the subscription failed
    /// - `None`: the subscription ended cleanly
    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>>;

    /// End the subscription. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if a graceful close handshake fails. Resources are
    /// released either way.
    async fn close(&mut self) -> Result<(), SyncError>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError> {
        (**self).merge(patch).await
    }

    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>> {
        (**self).next_snapshot().await
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        (**self).close().await
    }
}

// ── Latency compensation ────────────────────────────────────────────

/// Ledger of local writes not yet reflected in a confirmed document.
///
/// Stores that talk to a remote backend use it to produce the unconfirmed
/// snapshots the session loop expects: the last confirmed document with every
/// outstanding write applied on top.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    next_id: u64,
    writes: VecDeque<(u64, SessionPatch)>,
    baseline: Option<Option<SessionDocument>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes awaiting confirmation.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Track a new local write and return its write id (starting at 1).
    pub fn record(&mut self, patch: SessionPatch) -> u64 {
        self.next_id += 1;
        self.writes.push_back((self.next_id, patch));
        self.next_id
    }

    /// Accept a confirmed document reflecting every write up to `acknowledged`.
    ///
    /// Returns the snapshot to deliver: the confirmed document if nothing is
    /// outstanding, otherwise the overlay.
    pub fn confirm(
        &mut self,
        document: Option<SessionDocument>,
        acknowledged: Option<u64>,
    ) -> Snapshot {
        if let Some(ack) = acknowledged {
            self.writes.retain(|(id, _)| *id > ack);
        }
        self.baseline = Some(document);
        self.overlay().unwrap_or_default()
    }

    /// Drop a write the backend refused.
    ///
    /// Returns the corrected overlay, or `None` before the first confirmed
    /// document or if `write_id` was not outstanding.
    pub fn reject(&mut self, write_id: u64) -> Option<Snapshot> {
        let before = self.writes.len();
        self.writes.retain(|(id, _)| *id != write_id);
        if self.writes.len() == before {
            return None;
        }
        debug!(write_id, "rolled back rejected write");
        self.overlay()
    }

    /// The current view: confirmed baseline plus outstanding writes.
    ///
    /// `None` until a confirmed document has been seen.
    pub fn overlay(&self) -> Option<Snapshot> {
        let baseline = self.baseline.as_ref()?;
        if self.writes.is_empty() {
            return Some(Snapshot::confirmed(baseline.clone()));
        }
        let mut document = baseline.clone().unwrap_or_default();
        for (_, patch) in &self.writes {
            document.apply_patch(patch, None);
        }
        Some(Snapshot::pending(document))
    }

    /// Forget all writes and the baseline, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.baseline = None;
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
    use crate::protocol::ServerTimestamp;

    fn pause_patch(remaining: f64) -> SessionPatch {
        SessionPatch {
            is_paused: Some(true),
            remaining_on_pause: Some(remaining),
            ..Default::default()
        }
    }

    #[test]
    fn no_overlay_before_baseline() {
        let mut ledger = PendingWrites::new();
        ledger.record(pause_patch(3.0));
        assert!(ledger.overlay().is_none());
    }

    #[test]
    fn overlay_applies_outstanding_writes() {
        let mut ledger = PendingWrites::new();
        let confirmed = ledger.confirm(None, None);
        assert_eq!(confirmed, Snapshot::confirmed(None));

        ledger.record(SessionPatch {
            is_active: Some(true),
            started_at: Some(ServerTimestamp::new()),
            ..Default::default()
        });
        let overlay = ledger.overlay().unwrap();
        assert!(overlay.has_pending_writes);
        let doc = overlay.document.unwrap();
        assert!(doc.is_active);
        assert_eq!(doc.started_at, None);
    }

    #[test]
    fn acknowledged_writes_leave_the_overlay() {
        let mut ledger = PendingWrites::new();
        ledger.confirm(None, None);
        let first = ledger.record(pause_patch(3.0));
        let _second = ledger.record(pause_patch(2.0));

        let snapshot = ledger.confirm(Some(SessionDocument::default()), Some(first));
        assert!(snapshot.has_pending_writes);
        assert_eq!(ledger.len(), 1);
        assert_eq!(snapshot.document.unwrap().remaining_on_pause, 2.0);

        let snapshot = ledger.confirm(Some(SessionDocument::default()), Some(first + 1));
        assert!(!snapshot.has_pending_writes);
        assert!(ledger.is_empty());
    }

    #[test]
    fn rejected_write_is_rolled_back() {
        let mut ledger = PendingWrites::new();
        ledger.confirm(Some(SessionDocument::default()), None);
        let id = ledger.record(pause_patch(9.0));

        let snapshot = ledger.reject(id).unwrap();
        assert!(!snapshot.has_pending_writes);
        assert!(!snapshot.document.unwrap().is_paused);
        assert!(ledger.reject(id).is_none());
    }

    #[test]
    fn write_ids_increase() {
        let mut ledger = PendingWrites::new();
        let a = ledger.record(SessionPatch::default());
        let b = ledger.record(SessionPatch::default());
        assert!(b > a);
        assert_eq!(a, 1);
    }
}
