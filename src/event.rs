//! Events delivered to the application by a [`SessionClient`](crate::SessionClient).

use crate::protocol::{Millis, Nonce};

/// Notifications from the session loop.
///
/// Pulse events carry `seq`, a per-client sequence number that increases with
/// every pulse, so two identical payloads are still distinguishable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A backend subscription is live.
    Connected,
    /// The subscription ended; the client keeps running local-only.
    Disconnected { reason: Option<String> },
    /// The clock offset estimate was refreshed.
    Calibrated { offset_ms: Millis, rtt_ms: Millis },
    /// Five seconds remain in the running segment.
    FiveSecondWarning { seq: u64, segment: Nonce },
    /// The running segment reached zero.
    Finished { seq: u64, segment: Nonce },
    /// Another device asked this one to play `url`, or to stop if `None`.
    RemoteSound {
        seq: u64,
        url: Option<String>,
        received_at_ms: Millis,
    },
}

impl SessionEvent {
    /// The pulse sequence number, for pulse events.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::FiveSecondWarning { seq, .. }
            | Self::Finished { seq, .. }
            | Self::RemoteSound { seq, .. } => Some(*seq),
            Self::Connected | Self::Disconnected { .. } | Self::Calibrated { .. } => None,
        }
    }
}
