//! Echo suppression for sound broadcasts.
//!
//! A device that broadcasts a sound must not play it again when its own write
//! comes back in a snapshot, and no device plays a given broadcast twice.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::protocol::{Nonce, PendingSound};

/// How many processed sound nonces are remembered.
pub const ECHO_HISTORY: usize = 32;

/// Bounded memory of sound nonces this device has already handled.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    order: VecDeque<Nonce>,
    seen: HashSet<Nonce>,
    capacity: usize,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::with_capacity(ECHO_HISTORY)
    }
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard remembering up to `capacity` nonces (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Issue a nonce for an outgoing broadcast; its echo will be ignored.
    pub fn stamp(&mut self) -> Nonce {
        let nonce = Nonce::fresh();
        self.remember(nonce.clone());
        nonce
    }

    /// Mark a nonce as handled without raising anything.
    pub fn remember(&mut self, nonce: Nonce) {
        if !self.seen.insert(nonce.clone()) {
            return;
        }
        self.order.push_back(nonce);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    /// Returns `true` if `nonce` was already handled.
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.seen.contains(nonce)
    }

    /// Decide whether an inbound pending sound is new.
    ///
    /// Returns the sound exactly once per nonce; echoes of this device's own
    /// broadcasts and repeats are dropped.
    pub fn observe<'a>(&mut self, sound: Option<&'a PendingSound>) -> Option<&'a PendingSound> {
        let sound = sound?;
        if self.contains(&sound.id) {
            debug!(nonce = %sound.id, "ignoring already handled sound");
            return None;
        }
        self.remember(sound.id.clone());
        Some(sound)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sound(id: &str) -> PendingSound {
        PendingSound {
            id: Nonce::from(id),
            url: Some(format!("https://example.test/{id}.mp3")),
        }
    }

    #[test]
    fn own_broadcast_is_not_echoed() {
        let mut guard = EchoGuard::new();
        let id = guard.stamp();
        let echo = PendingSound { id, url: None };
        assert!(guard.observe(Some(&echo)).is_none());
    }

    #[test]
    fn remote_sound_is_raised_once() {
        let mut guard = EchoGuard::new();
        let remote = sound("remote");
        assert_eq!(guard.observe(Some(&remote)), Some(&remote));
        assert!(guard.observe(Some(&remote)).is_none());
    }

    #[test]
    fn absent_sound_is_ignored() {
        let mut guard = EchoGuard::new();
        assert!(guard.observe(None).is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut guard = EchoGuard::with_capacity(2);
        guard.remember(Nonce::from("a"));
        guard.remember(Nonce::from("b"));
        guard.remember(Nonce::from("c"));
        assert!(!guard.contains(&Nonce::from("a")));
        assert!(guard.contains(&Nonce::from("b")));
        assert!(guard.contains(&Nonce::from("c")));
    }

    #[test]
    fn remembering_twice_does_not_evict() {
        let mut guard = EchoGuard::with_capacity(2);
        guard.remember(Nonce::from("a"));
        guard.remember(Nonce::from("b"));
        guard.remember(Nonce::from("b"));
        assert!(guard.contains(&Nonce::from("a")));
    }
}
