//! # BotB Session Sync
//!
//! Cross-device synchronization for a Battle of the Books quiz session: a shared
//! countdown timer, a sixteen-round scoreboard and a one-shot soundboard
//! broadcast, kept consistent across every device signed in as the same user.
//!
//! All devices read and write one merge-style document through a
//! [`SessionStore`]. Each device estimates the offset between its clock and the
//! backend's clock, so a running countdown reads the same everywhere even when
//! device clocks disagree.
//!
//! ## Features
//!
//! - **Store-agnostic**: implement the [`SessionStore`] trait for any backend
//! - **Optimistic**: local operations apply immediately; the backend confirms later
//! - **In-memory backend**: [`MemoryBackend`] for tests, demos and single-process setups
//! - **WebSocket gateway**: default `store-websocket` feature provides `WebSocketStore`
//! - **Event-driven**: timer pulses and remote sounds arrive as [`SessionEvent`]s
//!
//! ## Quick Start
//!
//! ```no_run
//! use botb_session_sync::{MemoryBackend, SessionClient, SessionConfig, SessionEvent, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), botb_session_sync::SyncError> {
//! let backend = MemoryBackend::new(Arc::new(SystemClock));
//! let (client, mut events) =
//!     SessionClient::connect(backend.subscribe("user-123"), SessionConfig::new());
//!
//! client.start_timer(30.0)?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Finished { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod clock;
pub mod echo;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod playback;
pub mod protocol;
pub mod scoreboard;
pub mod scores;
pub mod session;
pub mod store;
pub mod stores;
pub mod timer;

// Re-export primary types for ergonomic imports.
pub use client::{SessionClient, SessionConfig};
pub use clock::{CalibrationPolicy, Clock, ManualClock, SystemClock, TokioClock};
pub use error::SyncError;
pub use error_codes::ErrorCode;
pub use event::SessionEvent;
pub use playback::{AudioOutput, Cue, Playback, PlayingSound};
pub use protocol::{Passover, Primary, RoundId, SessionDocument, SessionPatch};
pub use scoreboard::Scoreboard;
pub use scores::{GameRecord, Team, Totals};
pub use store::{SessionStore, Snapshot};
pub use stores::{MemoryBackend, MemoryStore};
pub use timer::{TimerState, TimerView};

#[cfg(feature = "store-websocket")]
pub use stores::WebSocketStore;
