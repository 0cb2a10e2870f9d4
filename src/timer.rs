//! Countdown timer state machine.
//!
//! ```text
//!            start(n)                 pause()
//!   Idle ───────────────▶ Running ───────────────▶ Paused
//!    ▲                     │  ▲                      │
//!    │   reset() / expiry  │  └──────── resume() ────┘
//!    └─────────────────────┘        (new segment)
//! ```
//!
//! Each start or resume opens a new [`Segment`] keyed by a fresh [`Nonce`].
//! A segment written by this device begins as [`SegmentStart::Proposed`] and is
//! projected against the *local* clock; once a confirmed snapshot echoes the
//! segment with a backend start time it becomes [`SegmentStart::Confirmed`] and
//! is projected against calibrated server time.
//!
//! The five-second warning and the finish pulse fire at most once per segment.
//! A segment is identified by its key together with its backend start time, so a
//! writer that restarts the countdown without a new `segmentId` still opens a
//! new segment.

use tracing::debug;

use crate::protocol::{Millis, Nonce, SessionDocument};

/// Remaining whole seconds at which the warning pulse fires.
const WARNING_THRESHOLD_SECS: u64 = 5;

/// Longest accepted segment; longer durations are clamped.
pub const MAX_SEGMENT_SECS: f64 = 86_400.0;

/// Coarse timer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimerState {
    #[default]
    Idle,
    Running,
    Paused,
}

/// What a display should show.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimerView {
    pub state: TimerState,
    /// `ceil(remaining_ms / 1000)`.
    pub remaining_seconds: u64,
    /// Elapsed share of the current segment, 0–100.
    pub progress: f64,
}

/// How a segment's start instant is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStart {
    /// Written by this device and not yet confirmed; measured on the local clock.
    Proposed { local_start: Millis },
    /// Backend-assigned start; measured on calibrated server time.
    Confirmed { server_start: Millis },
    /// Observed remotely before the backend resolved its start time.
    Unresolved,
}

/// One contiguous run of the countdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: Nonce,
    pub total_secs: f64,
    pub start: SegmentStart,
}

impl Segment {
    fn total_ms(&self) -> Millis {
        secs_to_ms(self.total_secs)
    }

    fn server_start(&self) -> Option<Millis> {
        match self.start {
            SegmentStart::Confirmed { server_start } => Some(server_start),
            SegmentStart::Proposed { .. } | SegmentStart::Unresolved => None,
        }
    }

    fn remaining_ms(&self, local_now: Millis, server_now: Millis) -> Option<Millis> {
        let (start, now) = match self.start {
            SegmentStart::Proposed { local_start } => (local_start, local_now),
            SegmentStart::Confirmed { server_start } => (server_start, server_now),
            SegmentStart::Unresolved => return None,
        };
        Some(
            start
                .saturating_add(self.total_ms())
                .saturating_sub(now)
                .max(0),
        )
    }
}

/// Tri-state timer phase.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TimerPhase {
    #[default]
    Idle,
    Running(Segment),
    Paused { total_secs: f64, remaining_secs: f64 },
}

/// Momentary edge events produced by [`CountdownTimer::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerPulse {
    FiveSecondWarning(Nonce),
    Finished(Nonce),
}

/// Result of one periodic evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub pulses: Vec<TimerPulse>,
    /// The segment ran out on this tick and the timer went idle.
    pub expired: bool,
}

#[derive(Debug, Clone, Default)]
struct EdgeGuards {
    segment: Option<Nonce>,
    server_start: Option<Millis>,
    five_second_fired: bool,
    finished_fired: bool,
}

impl EdgeGuards {
    /// Reset the guards unless they already belong to `segment`.
    ///
    /// A known start time that differs from the one the guards saw marks a new
    /// segment under the same key. Learning the start time keeps the guards.
    fn arm(&mut self, segment: &Nonce, server_start: Option<Millis>) {
        let same_key = self.segment.as_ref() == Some(segment);
        let restarted = matches!(
            (self.server_start, server_start),
            (Some(seen), Some(now)) if seen != now
        );
        if !same_key || restarted {
            *self = Self {
                segment: Some(segment.clone()),
                server_start,
                ..Self::default()
            };
        } else if server_start.is_some() {
            self.server_start = server_start;
        }
    }
}

/// The countdown state machine, evaluated from local shadow state only.
#[derive(Debug, Clone, Default)]
pub struct CountdownTimer {
    phase: TimerPhase,
    guards: EdgeGuards,
    view: TimerView,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &TimerPhase {
        &self.phase
    }

    pub fn state(&self) -> TimerState {
        match self.phase {
            TimerPhase::Idle => TimerState::Idle,
            TimerPhase::Running(_) => TimerState::Running,
            TimerPhase::Paused { .. } => TimerState::Paused,
        }
    }

    /// The view computed by the last transition or tick.
    pub fn view(&self) -> TimerView {
        self.view
    }

    /// The running segment, if any.
    pub fn segment(&self) -> Option<&Segment> {
        match &self.phase {
            TimerPhase::Running(segment) => Some(segment),
            _ => None,
        }
    }

    /// Begin a new countdown of `total_secs` and return its segment id.
    pub fn start(&mut self, total_secs: f64, local_now: Millis) -> Nonce {
        let id = Nonce::fresh();
        self.begin_segment(id.clone(), clamp_secs(total_secs), local_now);
        id
    }

    /// Freeze a running countdown and return the seconds left.
    pub fn pause(&mut self, local_now: Millis, server_now: Millis) -> Option<f64> {
        let TimerPhase::Running(segment) = &self.phase else {
            return None;
        };
        let remaining_ms = segment
            .remaining_ms(local_now, server_now)
            .unwrap_or_else(|| segment.total_ms());
        let total_secs = segment.total_secs;
        let remaining_secs = ms_to_secs(remaining_ms);
        debug!(segment = %segment.id, remaining_secs, "timer paused");
        self.phase = TimerPhase::Paused {
            total_secs,
            remaining_secs,
        };
        self.view = paused_view(total_secs, remaining_secs);
        Some(remaining_secs)
    }

    /// Continue a paused countdown as a new segment lasting the frozen remainder.
    pub fn resume(&mut self, local_now: Millis) -> Option<(Nonce, f64)> {
        let TimerPhase::Paused { remaining_secs, .. } = self.phase else {
            return None;
        };
        let id = Nonce::fresh();
        self.begin_segment(id.clone(), remaining_secs, local_now);
        Some((id, remaining_secs))
    }

    /// Return to idle from any state.
    pub fn reset(&mut self) {
        self.phase = TimerPhase::Idle;
        self.view = TimerView::default();
    }

    /// Recompute the view and fire any due pulses.
    pub fn tick(&mut self, local_now: Millis, server_now: Millis) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let TimerPhase::Running(segment) = &self.phase else {
            return outcome;
        };
        let Some(remaining_ms) = segment.remaining_ms(local_now, server_now) else {
            return outcome;
        };
        let id = segment.id.clone();
        let total_secs = segment.total_secs;
        let remaining_seconds = ceil_secs(remaining_ms);

        self.guards.arm(&id, segment.server_start());
        self.view = TimerView {
            state: TimerState::Running,
            remaining_seconds,
            progress: progress(segment.total_ms(), remaining_ms),
        };

        if !self.guards.five_second_fired
            && remaining_seconds > 0
            && remaining_seconds <= WARNING_THRESHOLD_SECS
            && total_secs > WARNING_THRESHOLD_SECS as f64
        {
            self.guards.five_second_fired = true;
            outcome.pulses.push(TimerPulse::FiveSecondWarning(id.clone()));
        }

        if remaining_ms <= 0 {
            if !self.guards.finished_fired {
                self.guards.finished_fired = true;
                debug!(segment = %id, "countdown finished");
                outcome.pulses.push(TimerPulse::Finished(id));
            }
            self.phase = TimerPhase::Idle;
            self.view = TimerView::default();
            outcome.expired = true;
        }

        outcome
    }

    /// Replace the shadow timer with the state of an inbound document.
    ///
    /// Reapplying the same document is a no-op.
    pub fn reconcile(&mut self, document: &SessionDocument, has_pending_writes: bool) {
        if !document.is_active {
            self.phase = TimerPhase::Idle;
            self.view = TimerView::default();
            return;
        }

        let total_secs = clamp_secs(document.original_total);

        if document.is_paused {
            let remaining_secs = clamp_secs(document.remaining_on_pause);
            self.phase = TimerPhase::Paused {
                total_secs,
                remaining_secs,
            };
            self.view = paused_view(total_secs, remaining_secs);
            return;
        }

        let Some(id) = document.segment_key() else {
            return;
        };

        if let TimerPhase::Running(segment) = &mut self.phase {
            if segment.id == id {
                let Some(server_start) = document.started_at else {
                    return;
                };
                match segment.start {
                    SegmentStart::Proposed { .. } if has_pending_writes => return,
                    SegmentStart::Proposed { .. } | SegmentStart::Unresolved => {
                        debug!(segment = %id, server_start, "segment start confirmed");
                        segment.start = SegmentStart::Confirmed { server_start };
                        self.guards.arm(&id, Some(server_start));
                        return;
                    }
                    SegmentStart::Confirmed { server_start: known } if known == server_start => {
                        return;
                    }
                    // Restarted by a writer that reused the key.
                    SegmentStart::Confirmed { .. } => {}
                }
            }
        }

        debug!(segment = %id, "adopting remote countdown segment");
        let start = document
            .started_at
            .map_or(SegmentStart::Unresolved, |server_start| {
                SegmentStart::Confirmed { server_start }
            });
        self.guards.arm(&id, document.started_at);
        self.phase = TimerPhase::Running(Segment {
            id,
            total_secs,
            start,
        });
        self.view.state = TimerState::Running;
    }

    fn begin_segment(&mut self, id: Nonce, total_secs: f64, local_now: Millis) {
        debug!(segment = %id, total_secs, "countdown segment started");
        self.guards.arm(&id, None);
        self.view = TimerView {
            state: TimerState::Running,
            remaining_seconds: ceil_secs(secs_to_ms(total_secs)),
            progress: 0.0,
        };
        self.phase = TimerPhase::Running(Segment {
            id,
            total_secs,
            start: SegmentStart::Proposed {
                local_start: local_now,
            },
        });
    }
}

/// Finite, non-negative and at most [`MAX_SEGMENT_SECS`].
fn clamp_secs(secs: f64) -> f64 {
    if secs.is_finite() {
        secs.clamp(0.0, MAX_SEGMENT_SECS)
    } else if secs > 0.0 {
        MAX_SEGMENT_SECS
    } else {
        0.0
    }
}

fn secs_to_ms(secs: f64) -> Millis {
    (secs * 1000.0).round() as Millis
}

fn ms_to_secs(ms: Millis) -> f64 {
    ms as f64 / 1000.0
}

fn ceil_secs(ms: Millis) -> u64 {
    u64::try_from(ms.max(0).saturating_add(999) / 1000).unwrap_or_default()
}

fn progress(total_ms: Millis, remaining_ms: Millis) -> f64 {
    if total_ms <= 0 {
        return 100.0;
    }
    ((total_ms - remaining_ms) as f64 / total_ms as f64 * 100.0).clamp(0.0, 100.0)
}

fn paused_view(total_secs: f64, remaining_secs: f64) -> TimerView {
    let remaining_ms = secs_to_ms(remaining_secs);
    TimerView {
        state: TimerState::Paused,
        remaining_seconds: ceil_secs(remaining_ms),
        progress: progress(secs_to_ms(total_secs), remaining_ms),
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

    /// Tick every 50ms from `from` to `to` (inclusive) on an uncalibrated clock.
    fn run(timer: &mut CountdownTimer, from: Millis, to: Millis) -> Vec<(Millis, TimerPulse)> {
        let mut fired = Vec::new();
        let mut now = from;
        while now <= to {
            for pulse in timer.tick(now, now).pulses {
                fired.push((now, pulse));
            }
            now += 50;
        }
        fired
    }

    #[test]
    fn start_shows_full_duration() {
        let mut timer = CountdownTimer::new();
        timer.start(20.0, 1_000);
        let view = timer.view();
        assert_eq!(view.state, TimerState::Running);
        assert_eq!(view.remaining_seconds, 20);
        assert_eq!(view.progress, 0.0);
    }

    #[test]
    fn tick_projects_remaining_and_progress() {
        let mut timer = CountdownTimer::new();
        timer.start(10.0, 0);
        timer.tick(2_500, 2_500);
        let view = timer.view();
        assert_eq!(view.remaining_seconds, 8);
        assert!((view.progress - 25.0).abs() < 1e-9);
    }

    #[test]
    fn warning_fires_once_for_long_segments() {
        let mut timer = CountdownTimer::new();
        let id = timer.start(8.0, 0);
        let fired = run(&mut timer, 0, 9_000);
        let warnings: Vec<_> = fired
            .iter()
            .filter(|(_, p)| matches!(p, TimerPulse::FiveSecondWarning(_)))
            .collect();
        assert_eq!(warnings.len(), 1);
        // remaining first drops to 5s just after 3_000ms.
        assert_eq!(warnings[0].0, 3_000);
        assert_eq!(warnings[0].1, TimerPulse::FiveSecondWarning(id));
    }

    #[test]
    fn warning_never_fires_for_short_segments() {
        for total in [1.0, 3.0, 5.0] {
            let mut timer = CountdownTimer::new();
            timer.start(total, 0);
            let fired = run(&mut timer, 0, 6_000);
            assert!(fired
                .iter()
                .all(|(_, p)| !matches!(p, TimerPulse::FiveSecondWarning(_))));
        }
    }

    #[test]
    fn finished_fires_once_and_goes_idle() {
        let mut timer = CountdownTimer::new();
        let id = timer.start(2.0, 0);
        let fired = run(&mut timer, 0, 4_000);
        assert_eq!(fired, vec![(2_000, TimerPulse::Finished(id))]);
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.view(), TimerView::default());
    }

    #[test]
    fn expiry_reports_transition_only_once() {
        let mut timer = CountdownTimer::new();
        timer.start(1.0, 0);
        assert!(timer.tick(1_000, 1_000).expired);
        assert!(!timer.tick(1_050, 1_050).expired);
    }

    #[test]
    fn idle_and_paused_do_not_tick() {
        let mut timer = CountdownTimer::new();
        assert_eq!(timer.tick(0, 0), TickOutcome::default());

        timer.start(10.0, 0);
        timer.pause(4_000, 4_000);
        let before = timer.view();
        assert_eq!(timer.tick(9_000, 9_000), TickOutcome::default());
        assert_eq!(timer.view(), before);
    }

    #[test]
    fn pause_then_resume_conserves_remaining_time() {
        let mut timer = CountdownTimer::new();
        timer.start(30.0, 0);
        let remaining = timer.pause(12_340, 12_340).unwrap();
        assert!((remaining - 17.66).abs() < 1e-9);

        let (_, total) = timer.resume(12_340).unwrap();
        assert_eq!(total, remaining);
        timer.tick(12_340, 12_340);
        assert_eq!(timer.view().remaining_seconds, 18);
    }

    #[test]
    fn resume_opens_a_segment_with_fresh_guards() {
        let mut timer = CountdownTimer::new();
        let first = timer.start(10.0, 0);
        let fired = run(&mut timer, 0, 6_000);
        assert_eq!(fired.len(), 1);

        timer.pause(6_000, 6_000);
        let (second, _) = timer.resume(6_000).unwrap();
        assert_ne!(first, second);
        // 4s remain: the new segment is too short for a warning but still finishes.
        let fired = run(&mut timer, 6_000, 11_000);
        assert_eq!(fired, vec![(10_000, TimerPulse::Finished(second))]);
    }

    #[test]
    fn pause_and_resume_are_ignored_in_wrong_state() {
        let mut timer = CountdownTimer::new();
        assert!(timer.pause(0, 0).is_none());
        assert!(timer.resume(0).is_none());
        timer.start(5.0, 0);
        assert!(timer.resume(0).is_none());
    }

    #[test]
    fn reset_zeroes_display() {
        let mut timer = CountdownTimer::new();
        timer.start(10.0, 0);
        timer.tick(1_000, 1_000);
        timer.reset();
        assert_eq!(timer.view(), TimerView::default());
        assert!(matches!(timer.phase(), TimerPhase::Idle));
    }

    fn running_doc(id: &str, started_at: Option<Millis>, total: f64) -> SessionDocument {
        SessionDocument {
            is_active: true,
            segment_id: Some(Nonce::from(id)),
            started_at,
            original_total: total,
            ..Default::default()
        }
    }

    #[test]
    fn proposed_segment_confirms_only_on_confirmed_snapshot() {
        let mut timer = CountdownTimer::new();
        let id = timer.start(20.0, 1_000);
        let doc = running_doc(id.as_str(), Some(1_040), 20.0);

        timer.reconcile(&doc, true);
        assert!(matches!(
            timer.segment().unwrap().start,
            SegmentStart::Proposed { local_start: 1_000 }
        ));

        timer.reconcile(&doc, false);
        assert_eq!(
            timer.segment().unwrap().start,
            SegmentStart::Confirmed {
                server_start: 1_040
            }
        );
    }

    #[test]
    fn unresolved_remote_segment_waits_for_start_time() {
        let mut timer = CountdownTimer::new();
        timer.reconcile(&running_doc("remote", None, 20.0), true);
        assert_eq!(timer.state(), TimerState::Running);
        assert_eq!(timer.tick(5_000, 5_000), TickOutcome::default());

        timer.reconcile(&running_doc("remote", Some(4_000), 20.0), false);
        timer.tick(5_000, 5_000);
        assert_eq!(timer.view().remaining_seconds, 19);
    }

    #[test]
    fn stale_running_snapshot_after_finish_does_not_refire() {
        let mut timer = CountdownTimer::new();
        timer.reconcile(&running_doc("seg", Some(0), 1.0), false);
        let fired = run(&mut timer, 0, 1_500);
        assert_eq!(fired.len(), 1);

        timer.reconcile(&running_doc("seg", Some(0), 1.0), false);
        let outcome = timer.tick(1_600, 1_600);
        assert!(outcome.pulses.is_empty());
        assert!(outcome.expired);
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[test]
    fn restart_under_a_reused_key_opens_a_new_segment() {
        let mut timer = CountdownTimer::new();
        timer.reconcile(&running_doc("seg-legacy", Some(0), 2.0), false);
        let fired = run(&mut timer, 0, 2_500);
        assert_eq!(
            fired,
            vec![(2_000, TimerPulse::Finished(Nonce::from("seg-legacy")))]
        );

        // A writer without segment ids starts an 8s countdown; merges keep the old id.
        timer.reconcile(&running_doc("seg-legacy", Some(10_000), 8.0), false);
        assert_eq!(timer.segment().unwrap().total_secs, 8.0);
        let fired: Vec<_> = run(&mut timer, 10_000, 19_000)
            .into_iter()
            .map(|(_, pulse)| pulse)
            .collect();
        assert_eq!(
            fired,
            vec![
                TimerPulse::FiveSecondWarning(Nonce::from("seg-legacy")),
                TimerPulse::Finished(Nonce::from("seg-legacy")),
            ]
        );
    }

    #[test]
    fn restart_while_running_rearms_guards() {
        let mut timer = CountdownTimer::new();
        timer.reconcile(&running_doc("seg", Some(0), 10.0), false);
        assert_eq!(run(&mut timer, 0, 6_000).len(), 1);

        timer.reconcile(&running_doc("seg", Some(6_000), 7.0), false);
        let fired = run(&mut timer, 6_050, 14_000);
        assert_eq!(
            fired,
            vec![
                (8_000, TimerPulse::FiveSecondWarning(Nonce::from("seg"))),
                (13_000, TimerPulse::Finished(Nonce::from("seg"))),
            ]
        );
    }

    #[test]
    fn learning_the_start_time_keeps_fired_guards() {
        let mut timer = CountdownTimer::new();
        let id = timer.start(8.0, 0);
        assert_eq!(run(&mut timer, 0, 3_500).len(), 1);

        timer.reconcile(&running_doc(id.as_str(), Some(40), 8.0), false);
        let fired = run(&mut timer, 3_550, 9_000);
        assert_eq!(fired, vec![(8_050, TimerPulse::Finished(id))]);
    }

    #[test]
    fn oversized_durations_are_clamped() {
        let mut timer = CountdownTimer::new();
        timer.reconcile(&running_doc("huge", Some(1_000), 1e300), false);
        let outcome = timer.tick(1_000, 1_000);
        assert!(outcome.pulses.is_empty());
        assert!(!outcome.expired);
        let view = timer.view();
        assert_eq!(view.state, TimerState::Running);
        assert_eq!(view.remaining_seconds, MAX_SEGMENT_SECS as u64);
        assert_eq!(view.progress, 0.0);

        timer.reconcile(&running_doc("late", Some(Millis::MAX), f64::INFINITY), false);
        let outcome = timer.tick(0, 0);
        assert!(outcome.pulses.is_empty());
        assert_eq!(timer.state(), TimerState::Running);

        timer.start(f64::NAN, 0);
        assert_eq!(timer.segment().unwrap().total_secs, 0.0);
    }

    #[test]
    fn paused_document_freezes_display() {
        let mut timer = CountdownTimer::new();
        let doc = SessionDocument {
            is_active: true,
            is_paused: true,
            original_total: 20.0,
            remaining_on_pause: 7.2,
            ..Default::default()
        };
        timer.reconcile(&doc, false);
        let view = timer.view();
        assert_eq!(view.state, TimerState::Paused);
        assert_eq!(view.remaining_seconds, 8);
        assert!((view.progress - 64.0).abs() < 1e-9);
    }

    #[test]
    fn inactive_document_goes_idle() {
        let mut timer = CountdownTimer::new();
        timer.start(10.0, 0);
        timer.reconcile(&SessionDocument::default(), false);
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.view(), TimerView::default());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let doc = running_doc("seg", Some(100), 15.0);
        let mut once = CountdownTimer::new();
        once.reconcile(&doc, false);
        let mut twice = once.clone();
        twice.reconcile(&doc, false);
        assert_eq!(once.phase(), twice.phase());
        assert_eq!(once.tick(3_000, 3_000), twice.tick(3_000, 3_000));
        assert_eq!(once.view(), twice.view());
    }
}
