//! Local clocks and the clock calibration handshake.
//!
//! Every device reads time through a [`Clock`]. The [`ClockCalibrator`] estimates
//! `clock_offset` such that `local_now + clock_offset ≈ backend time`, using a
//! round trip through the shared document:
//!
//! 1. write `{ _calibId: nonce, _calibAt: <server timestamp> }`, recording `t0`;
//! 2. on the first *confirmed* snapshot carrying that nonce, with
//!    `rtt = now - t0`, set `offset = _calibAt + round(rtt / 2) - now`.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::protocol::{Millis, Nonce, ServerTimestamp, SessionDocument, SessionPatch};

/// Times a superseded handshake is re-issued within one subscription.
const MAX_SUPERSEDED_RETRIES: u32 = 3;

// ── Clocks ──────────────────────────────────────────────────────────

/// A source of local wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current local time.
    fn now_ms(&self) -> Millis;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| Millis::try_from(elapsed.as_millis()).unwrap_or(Millis::MAX))
            .unwrap_or_default()
    }
}

/// A clock that advances with tokio's timer.
///
/// Under a paused test runtime it moves exactly as far as
/// `tokio::time::advance` or auto-advance moves the timer wheel.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    origin_ms: Millis,
}

impl TokioClock {
    /// Start at the current system time.
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now_ms())
    }

    /// Start at an explicit wall-clock reading.
    pub fn starting_at(origin_ms: Millis) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_ms,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> Millis {
        let elapsed = Millis::try_from(self.origin.elapsed().as_millis()).unwrap_or(Millis::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

/// A hand-driven clock for deterministic tests and simulations.
///
/// Clones share the same underlying time; [`skewed`](ManualClock::skewed)
/// derives a clock that reads the same time plus a fixed skew.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
    skew_ms: Millis,
}

impl ManualClock {
    pub fn new(start_ms: Millis) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
            skew_ms: 0,
        }
    }

    /// A clock sharing this one's time, offset by `skew_ms`.
    pub fn skewed(&self, skew_ms: Millis) -> Self {
        Self {
            now: Arc::clone(&self.now),
            skew_ms: self.skew_ms + skew_ms,
        }
    }

    /// Move time forward (or backward, for negative values).
    pub fn advance(&self, ms: Millis) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// Set the unskewed time.
    pub fn set(&self, ms: Millis) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::Acquire) + self.skew_ms
    }
}

// ── Calibration ─────────────────────────────────────────────────────

/// When the calibration handshake runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationPolicy {
    /// Once per live subscription. A handshake whose confirmation never
    /// arrives is not retried.
    #[default]
    OncePerSubscription,
    /// Once per subscription and again every interval; also re-issues a
    /// handshake that has not confirmed within the interval.
    Periodic(Duration),
}

/// A completed calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub offset_ms: Millis,
    pub rtt_ms: Millis,
}

/// What a snapshot meant for the calibration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Nothing to do.
    Waiting,
    /// The handshake confirmed and the offset was updated.
    Completed(Calibration),
    /// Another device overwrote the handshake after it reached the document;
    /// a new one should be written.
    Superseded,
}

#[derive(Debug, Clone)]
struct Handshake {
    nonce: Nonce,
    sent_at: Millis,
    /// A snapshot has shown this nonce.
    landed: bool,
}

/// Estimates the offset between local time and backend time.
#[derive(Debug, Clone)]
pub struct ClockCalibrator {
    policy: CalibrationPolicy,
    offset_ms: Millis,
    handshake: Option<Handshake>,
    last_completed_at: Option<Millis>,
    superseded_retries: u32,
}

impl ClockCalibrator {
    pub fn new(policy: CalibrationPolicy) -> Self {
        Self {
            policy,
            offset_ms: 0,
            handshake: None,
            last_completed_at: None,
            superseded_retries: 0,
        }
    }

    /// The current offset estimate (0 until the first calibration).
    pub fn offset_ms(&self) -> Millis {
        self.offset_ms
    }

    /// Backend time estimated from local time.
    pub fn server_now(&self, local_now: Millis) -> Millis {
        local_now.saturating_add(self.offset_ms)
    }

    /// Returns `true` while a handshake write awaits confirmation.
    pub fn in_flight(&self) -> bool {
        self.handshake.is_some()
    }

    /// Start a handshake and return the write that carries it.
    pub fn begin(&mut self, local_now: Millis) -> SessionPatch {
        let nonce = Nonce::fresh();
        debug!(nonce = %nonce, "starting clock calibration handshake");
        self.handshake = Some(Handshake {
            nonce: nonce.clone(),
            sent_at: local_now,
            landed: false,
        });
        SessionPatch {
            calib_id: Some(nonce),
            calib_at: Some(ServerTimestamp::new()),
            ..Default::default()
        }
    }

    /// Forget any in-flight handshake. The offset estimate is kept.
    pub fn end_subscription(&mut self) {
        self.handshake = None;
        self.superseded_retries = 0;
    }

    /// Returns `true` if the policy calls for a new handshake now.
    pub fn due(&self, local_now: Millis) -> bool {
        let CalibrationPolicy::Periodic(interval) = self.policy else {
            return false;
        };
        let interval_ms = Millis::try_from(interval.as_millis()).unwrap_or(Millis::MAX);
        match (&self.handshake, self.last_completed_at) {
            (Some(handshake), _) => local_now.saturating_sub(handshake.sent_at) >= interval_ms,
            (None, Some(completed)) => local_now.saturating_sub(completed) >= interval_ms,
            (None, None) => false,
        }
    }

    /// Inspect an inbound snapshot for the handshake's confirmation.
    ///
    /// A foreign nonce only supersedes the handshake once a snapshot has shown
    /// this device's nonce; before that it is older state.
    pub fn observe(
        &mut self,
        document: &SessionDocument,
        has_pending_writes: bool,
        local_now: Millis,
    ) -> CalibrationStep {
        let Some(handshake) = &mut self.handshake else {
            return CalibrationStep::Waiting;
        };
        if document.calib_id.as_ref() == Some(&handshake.nonce) {
            handshake.landed = true;
        }
        if has_pending_writes {
            return CalibrationStep::Waiting;
        }
        match (&document.calib_id, document.calib_at) {
            (Some(id), Some(server_at)) if *id == handshake.nonce => {
                let rtt_ms = local_now.saturating_sub(handshake.sent_at).max(0);
                let offset_ms = server_at
                    .saturating_add(rtt_ms.saturating_add(1) / 2)
                    .saturating_sub(local_now);
                debug!(offset_ms, rtt_ms, "clock calibrated");
                self.offset_ms = offset_ms;
                self.handshake = None;
                self.last_completed_at = Some(local_now);
                CalibrationStep::Completed(Calibration { offset_ms, rtt_ms })
            }
            (Some(id), _) if *id != handshake.nonce => {
                if !handshake.landed || self.superseded_retries >= MAX_SUPERSEDED_RETRIES {
                    return CalibrationStep::Waiting;
                }
                self.superseded_retries += 1;
                debug!(
                    ours = %handshake.nonce,
                    theirs = %id,
                    "calibration handshake superseded"
                );
                CalibrationStep::Superseded
            }
            _ => CalibrationStep::Waiting,
        }
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

    fn confirm(patch: &SessionPatch, server_at: Millis) -> SessionDocument {
        let mut doc = SessionDocument::default();
        doc.apply_patch(patch, Some(server_at));
        doc
    }

    #[test]
    fn manual_clock_skew_shares_time() {
        let base = ManualClock::new(1_000);
        let skewed = base.skewed(3_000);
        base.advance(500);
        assert_eq!(base.now_ms(), 1_500);
        assert_eq!(skewed.now_ms(), 4_500);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(10_000);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 10_250);
    }

    #[test]
    fn offset_accounts_for_half_round_trip() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        // Local clock runs 3s ahead of the backend; 100ms round trip.
        let patch = calibrator.begin(13_000);
        let doc = confirm(&patch, 10_050);

        let step = calibrator.observe(&doc, false, 13_100);
        assert_eq!(
            step,
            CalibrationStep::Completed(Calibration {
                offset_ms: -3_000,
                rtt_ms: 100
            })
        );
        assert_eq!(calibrator.server_now(13_200), 10_200);
        assert!(!calibrator.in_flight());
    }

    #[test]
    fn pending_snapshots_never_calibrate() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let patch = calibrator.begin(0);
        let doc = confirm(&patch, 500);
        assert_eq!(calibrator.observe(&doc, true, 10), CalibrationStep::Waiting);
        assert_eq!(calibrator.offset_ms(), 0);
    }

    #[test]
    fn repeated_snapshot_calibrates_once() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let patch = calibrator.begin(0);
        let doc = confirm(&patch, 1_000);
        assert!(matches!(
            calibrator.observe(&doc, false, 0),
            CalibrationStep::Completed(_)
        ));
        assert_eq!(calibrator.observe(&doc, false, 400), CalibrationStep::Waiting);
        assert_eq!(calibrator.offset_ms(), 1_000);
    }

    fn foreign() -> SessionDocument {
        SessionDocument {
            calib_id: Some(Nonce::from("other-device")),
            calib_at: Some(99),
            ..Default::default()
        }
    }

    #[test]
    fn foreign_nonce_supersedes_a_bounded_number_of_times() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        for _ in 0..MAX_SUPERSEDED_RETRIES {
            let patch = calibrator.begin(0);
            let mut landed = SessionDocument::default();
            landed.apply_patch(&patch, None);
            assert_eq!(calibrator.observe(&landed, true, 1), CalibrationStep::Waiting);
            assert_eq!(
                calibrator.observe(&foreign(), false, 1),
                CalibrationStep::Superseded
            );
        }
        let patch = calibrator.begin(0);
        let mut landed = SessionDocument::default();
        landed.apply_patch(&patch, None);
        let _ = calibrator.observe(&landed, true, 1);
        assert_eq!(calibrator.observe(&foreign(), false, 1), CalibrationStep::Waiting);
    }

    #[test]
    fn foreign_nonce_before_ours_landed_is_older_state() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let patch = calibrator.begin(0);
        assert_eq!(calibrator.observe(&foreign(), false, 5), CalibrationStep::Waiting);
        assert!(calibrator.in_flight());

        // Our write lands afterwards and still completes the handshake.
        let step = calibrator.observe(&confirm(&patch, 40), false, 10);
        assert!(matches!(step, CalibrationStep::Completed(_)));
    }

    #[test]
    fn extreme_server_times_do_not_overflow() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let patch = calibrator.begin(Millis::MIN);
        let step = calibrator.observe(&confirm(&patch, Millis::MAX), false, Millis::MAX);
        assert!(matches!(step, CalibrationStep::Completed(_)));
        assert_eq!(calibrator.server_now(Millis::MAX), Millis::MAX);
    }

    #[test]
    fn end_subscription_keeps_offset() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let patch = calibrator.begin(0);
        let _ = calibrator.observe(&confirm(&patch, 250), false, 0);
        calibrator.end_subscription();
        assert_eq!(calibrator.offset_ms(), 250);
        assert!(!calibrator.in_flight());
    }

    #[test]
    fn once_policy_is_never_due() {
        let mut calibrator = ClockCalibrator::new(CalibrationPolicy::OncePerSubscription);
        let _ = calibrator.begin(0);
        assert!(!calibrator.due(1_000_000));
    }

    #[test]
    fn periodic_policy_recalibrates_and_retries_lost_handshakes() {
        let mut calibrator =
            ClockCalibrator::new(CalibrationPolicy::Periodic(Duration::from_secs(30)));
        let patch = calibrator.begin(0);
        assert!(!calibrator.due(29_999));
        // The confirmation never arrived: re-issue after one interval.
        assert!(calibrator.due(30_000));

        let _ = calibrator.observe(&confirm(&patch, 40_000), false, 40_000);
        assert!(!calibrator.due(60_000));
        assert!(calibrator.due(70_000));
    }
}
