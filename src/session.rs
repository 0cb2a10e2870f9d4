//! Deterministic core of the session synchronizer.
//!
//! [`SessionCore`] owns the local shadow of the shared document: calibration
//! state, the countdown timer, the echo guard and the scoreboard mirror. It
//! performs no I/O and never reads a clock; every method that needs the time
//! takes `local_now`. Operations return the partial writes to send, and
//! snapshot/tick processing returns the events to deliver.

use tracing::debug;

use crate::client::SessionConfig;
use crate::clock::{CalibrationStep, ClockCalibrator};
use crate::echo::EchoGuard;
use crate::event::SessionEvent;
use crate::protocol::{
    Cells, Millis, Nonce, Passover, PendingSound, Primary, RoundId, ServerTimestamp,
    SessionPatch,
};
use crate::scoreboard::Scoreboard;
use crate::scores::{GameRecord, Team};
use crate::store::Snapshot;
use crate::timer::{CountdownTimer, TimerPulse, TimerView};

/// Output of processing a snapshot or a tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    /// Events for the application, in order.
    pub events: Vec<SessionEvent>,
    /// Writes to send to the backend, in order.
    pub writes: Vec<SessionPatch>,
}

/// Local session state for one device.
#[derive(Debug, Clone)]
pub struct SessionCore {
    calibrator: ClockCalibrator,
    timer: CountdownTimer,
    echo: EchoGuard,
    scoreboard: Scoreboard,
    subscribed: bool,
    primed: bool,
    replay_sound_on_connect: bool,
    seq: u64,
}

impl SessionCore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            calibrator: ClockCalibrator::new(config.calibration),
            timer: CountdownTimer::new(),
            echo: EchoGuard::new(),
            scoreboard: Scoreboard::new(config.team_a.clone(), config.team_b.clone()),
            subscribed: false,
            primed: false,
            replay_sound_on_connect: config.replay_sound_on_connect,
            seq: 0,
        }
    }

    // ── Subscription lifecycle ──────────────────────────────────────

    /// A live subscription was established. Returns the calibration write.
    pub fn begin_subscription(&mut self, local_now: Millis) -> SessionPatch {
        self.subscribed = true;
        self.primed = false;
        self.calibrator.begin(local_now)
    }

    /// The subscription ended. The shadow and the clock offset are kept.
    pub fn end_subscription(&mut self) {
        self.subscribed = false;
        self.calibrator.end_subscription();
    }

    /// Returns `true` while a backend subscription is live.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn timer(&self) -> &CountdownTimer {
        &self.timer
    }

    pub fn timer_view(&self) -> TimerView {
        self.timer.view()
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    pub fn offset_ms(&self) -> Millis {
        self.calibrator.offset_ms()
    }

    pub fn server_now(&self, local_now: Millis) -> Millis {
        self.calibrator.server_now(local_now)
    }

    // ── Timer operations ────────────────────────────────────────────

    pub fn start_timer(&mut self, total_secs: f64, local_now: Millis) -> SessionPatch {
        let total_secs = total_secs.max(0.0);
        let segment = self.timer.start(total_secs, local_now);
        running_patch(segment, total_secs)
    }

    /// Returns `None` unless the timer is running.
    pub fn pause_timer(&mut self, local_now: Millis) -> Option<SessionPatch> {
        let remaining = self
            .timer
            .pause(local_now, self.calibrator.server_now(local_now))?;
        Some(SessionPatch {
            is_paused: Some(true),
            remaining_on_pause: Some(remaining),
            ..Default::default()
        })
    }

    /// Returns `None` unless the timer is paused.
    pub fn resume_timer(&mut self, local_now: Millis) -> Option<SessionPatch> {
        let (segment, total_secs) = self.timer.resume(local_now)?;
        Some(running_patch(segment, total_secs))
    }

    pub fn reset_timer(&mut self) -> SessionPatch {
        self.timer.reset();
        SessionPatch {
            is_active: Some(false),
            is_paused: Some(false),
            ..Default::default()
        }
    }

    // ── Scoreboard operations ───────────────────────────────────────

    pub fn set_primary(&mut self, round: RoundId, primary: Primary) -> SessionPatch {
        self.scoreboard.set_primary(round, primary)
    }

    pub fn set_passover(&mut self, round: RoundId, passover: Passover) -> Option<SessionPatch> {
        self.scoreboard.set_passover(round, passover)
    }

    pub fn set_team_name(&mut self, team: Team, name: impl Into<String>) -> SessionPatch {
        self.scoreboard.set_team_name(team, name)
    }

    pub fn set_page(&mut self, page: u32) -> Option<SessionPatch> {
        self.scoreboard.set_page(page)
    }

    pub fn follow_active_round(&mut self) -> Option<SessionPatch> {
        self.scoreboard.follow_active_round()
    }

    pub fn reset_cells(&mut self) -> SessionPatch {
        self.scoreboard.reset_cells()
    }

    pub fn restore_cells(&mut self, cells: &Cells) -> SessionPatch {
        self.scoreboard.restore_cells(cells)
    }

    pub fn restore_record(&mut self, record: &GameRecord) -> SessionPatch {
        self.scoreboard.restore_record(record)
    }

    pub fn to_record(&self) -> GameRecord {
        self.scoreboard.to_record()
    }

    // ── Sound broadcast ─────────────────────────────────────────────

    /// Ask every other device to play `url`, or to stop playing if `None`.
    pub fn broadcast_sound(&mut self, url: Option<String>) -> SessionPatch {
        let id = self.echo.stamp();
        debug!(nonce = %id, url = ?url, "broadcasting sound");
        SessionPatch {
            pending_sound: Some(PendingSound { id, url }),
            ..Default::default()
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Reconcile an inbound snapshot into the shadow.
    ///
    /// Reapplying the same snapshot changes nothing.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot, local_now: Millis) -> Reaction {
        let mut reaction = Reaction::default();
        let Some(document) = &snapshot.document else {
            self.primed = true;
            return reaction;
        };
        let pending = snapshot.has_pending_writes;

        match self.calibrator.observe(document, pending, local_now) {
            CalibrationStep::Completed(calibration) => {
                reaction.events.push(SessionEvent::Calibrated {
                    offset_ms: calibration.offset_ms,
                    rtt_ms: calibration.rtt_ms,
                });
            }
            CalibrationStep::Superseded if self.subscribed => {
                reaction.writes.push(self.calibrator.begin(local_now));
            }
            CalibrationStep::Superseded | CalibrationStep::Waiting => {}
        }

        self.scoreboard.apply_remote(document);

        if !self.primed {
            self.primed = true;
            if !self.replay_sound_on_connect {
                if let Some(sound) = &document.pending_sound {
                    debug!(nonce = %sound.id, "recording existing sound without playing it");
                    self.echo.remember(sound.id.clone());
                }
            }
        }
        if let Some(sound) = self.echo.observe(document.pending_sound.as_ref()) {
            let seq = self.next_seq();
            reaction.events.push(SessionEvent::RemoteSound {
                seq,
                url: sound.url.clone(),
                received_at_ms: local_now,
            });
        }

        self.timer.reconcile(document, pending);
        reaction
    }

    /// Periodic evaluation: advance the display and fire due pulses.
    pub fn tick(&mut self, local_now: Millis) -> Reaction {
        let mut reaction = Reaction::default();
        let outcome = self
            .timer
            .tick(local_now, self.calibrator.server_now(local_now));

        for pulse in outcome.pulses {
            let seq = self.next_seq();
            reaction.events.push(match pulse {
                TimerPulse::FiveSecondWarning(segment) => {
                    SessionEvent::FiveSecondWarning { seq, segment }
                }
                TimerPulse::Finished(segment) => SessionEvent::Finished { seq, segment },
            });
        }
        if outcome.expired {
            reaction.writes.push(SessionPatch {
                is_active: Some(false),
                ..Default::default()
            });
        }
        if self.subscribed && self.calibrator.due(local_now) {
            reaction.writes.push(self.calibrator.begin(local_now));
        }
        reaction
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

fn running_patch(segment: Nonce, total_secs: f64) -> SessionPatch {
    SessionPatch {
        is_active: Some(true),
        is_paused: Some(false),
        started_at: Some(ServerTimestamp::new()),
        segment_id: Some(segment),
        original_total: Some(total_secs),
        remaining_on_pause: Some(0.0),
        ..Default::default()
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
    use crate::protocol::SessionDocument;
    use crate::timer::TimerState;

    fn core() -> SessionCore {
        SessionCore::new(&SessionConfig::new())
    }

    fn confirmed(doc: SessionDocument) -> Snapshot {
        Snapshot::confirmed(Some(doc))
    }

    /// A backend that applies every write at server time `server_at`.
    fn commit(doc: &mut SessionDocument, patch: &SessionPatch, server_at: Millis) -> Snapshot {
        doc.apply_patch(patch, Some(server_at));
        confirmed(doc.clone())
    }

    #[test]
    fn start_writes_a_new_segment() {
        let mut core = core();
        let patch = core.start_timer(20.0, 0);
        assert_eq!(patch.is_active, Some(true));
        assert_eq!(patch.is_paused, Some(false));
        assert_eq!(patch.original_total, Some(20.0));
        assert_eq!(patch.remaining_on_pause, Some(0.0));
        assert!(patch.started_at.is_some());
        assert!(patch.segment_id.is_some());
    }

    #[test]
    fn pause_and_resume_require_matching_state() {
        let mut core = core();
        assert!(core.pause_timer(0).is_none());
        assert!(core.resume_timer(0).is_none());

        core.start_timer(10.0, 0);
        let pause = core.pause_timer(4_000).unwrap();
        assert_eq!(pause.remaining_on_pause, Some(6.0));
        let resume = core.resume_timer(4_000).unwrap();
        assert_eq!(resume.original_total, Some(6.0));
    }

    #[test]
    fn expiry_fires_finished_and_deactivates() {
        let mut core = core();
        core.start_timer(1.0, 0);
        let reaction = core.tick(1_000);
        assert!(matches!(
            reaction.events.as_slice(),
            [SessionEvent::Finished { seq: 1, .. }]
        ));
        assert_eq!(
            reaction.writes,
            vec![SessionPatch {
                is_active: Some(false),
                ..Default::default()
            }]
        );
        assert!(core.tick(1_050).events.is_empty());
    }

    #[test]
    fn pulse_sequence_numbers_increase() {
        let mut core = core();
        core.start_timer(6.0, 0);
        let warning = core.tick(1_000).events;
        let finished = core.tick(6_000).events;
        assert_eq!(warning[0].seq(), Some(1));
        assert_eq!(finished[0].seq(), Some(2));
    }

    #[test]
    fn calibration_completes_on_confirmed_echo() {
        let mut core = core();
        let mut doc = SessionDocument::default();
        let patch = core.begin_subscription(5_000);
        let snapshot = commit(&mut doc, &patch, 2_040);

        let reaction = core.apply_snapshot(&snapshot, 5_080);
        assert_eq!(
            reaction.events,
            vec![SessionEvent::Calibrated {
                offset_ms: -3_000,
                rtt_ms: 80
            }]
        );
        assert_eq!(core.server_now(5_100), 2_100);
    }

    #[test]
    fn superseded_calibration_is_reissued_while_subscribed() {
        let mut core = core();
        let handshake = core.begin_subscription(0);
        let mut ours = SessionDocument::default();
        ours.apply_patch(&handshake, None);
        assert!(core.apply_snapshot(&Snapshot::pending(ours), 5).writes.is_empty());
        let foreign = confirmed(SessionDocument {
            calib_id: Some(Nonce::from("other")),
            calib_at: Some(10),
            ..Default::default()
        });
        let reaction = core.apply_snapshot(&foreign, 20);
        assert_eq!(reaction.writes.len(), 1);
        assert!(reaction.writes[0].calib_id.is_some());
    }

    #[test]
    fn own_sound_is_not_raised() {
        let mut core = core();
        let mut doc = SessionDocument::default();
        let _ = core.apply_snapshot(&confirmed(doc.clone()), 0);
        let patch = core.broadcast_sound(Some("https://example.test/buzz.mp3".into()));
        let snapshot = commit(&mut doc, &patch, 10);
        assert!(core.apply_snapshot(&snapshot, 20).events.is_empty());
    }

    #[test]
    fn remote_sound_is_raised_once() {
        let mut core = core();
        let _ = core.apply_snapshot(&confirmed(SessionDocument::default()), 0);
        let doc = SessionDocument {
            pending_sound: Some(PendingSound {
                id: Nonce::from("remote-1"),
                url: None,
            }),
            ..Default::default()
        };
        let first = core.apply_snapshot(&confirmed(doc.clone()), 100);
        assert_eq!(
            first.events,
            vec![SessionEvent::RemoteSound {
                seq: 1,
                url: None,
                received_at_ms: 100
            }]
        );
        assert!(core.apply_snapshot(&confirmed(doc), 200).events.is_empty());
    }

    #[test]
    fn sound_present_on_connect_is_primed_not_played() {
        let doc = SessionDocument {
            pending_sound: Some(PendingSound {
                id: Nonce::from("old"),
                url: Some("https://example.test/old.mp3".into()),
            }),
            ..Default::default()
        };

        let mut quiet = core();
        let _ = quiet.begin_subscription(0);
        assert!(quiet.apply_snapshot(&confirmed(doc.clone()), 0).events.is_empty());

        let mut replaying = SessionCore::new(&SessionConfig::new().with_replay_sound_on_connect(true));
        let _ = replaying.begin_subscription(0);
        let events = replaying.apply_snapshot(&confirmed(doc), 0).events;
        assert!(matches!(events.as_slice(), [SessionEvent::RemoteSound { .. }]));
    }

    #[test]
    fn snapshot_reconciliation_is_idempotent() {
        let mut core = core();
        let doc = SessionDocument {
            is_active: true,
            started_at: Some(1_000),
            segment_id: Some(Nonce::from("seg")),
            original_total: 30.0,
            team_a: Some("Owls".into()),
            ..Default::default()
        };
        let _ = core.apply_snapshot(&confirmed(doc.clone()), 2_000);
        let once_view = {
            let mut probe = core.clone();
            probe.tick(4_000);
            probe.timer_view()
        };
        let again = core.apply_snapshot(&confirmed(doc), 2_000);
        assert!(again.events.is_empty());
        let mut twice = core.clone();
        twice.tick(4_000);
        assert_eq!(twice.timer_view(), once_view);
        assert_eq!(core.scoreboard().team_name(Team::A), "Owls");
    }

    #[test]
    fn remote_pause_freezes_timer() {
        let mut core = core();
        core.start_timer(30.0, 0);
        let doc = SessionDocument {
            is_active: true,
            is_paused: true,
            remaining_on_pause: 12.0,
            original_total: 30.0,
            ..Default::default()
        };
        let _ = core.apply_snapshot(&confirmed(doc), 18_000);
        assert_eq!(core.timer_view().state, TimerState::Paused);
        assert_eq!(core.timer_view().remaining_seconds, 12);
    }

    #[test]
    fn periodic_policy_recalibrates_from_tick() {
        let config = SessionConfig::new().with_calibration(crate::clock::CalibrationPolicy::Periodic(
            std::time::Duration::from_secs(10),
        ));
        let mut core = SessionCore::new(&config);
        let _ = core.begin_subscription(0);
        assert!(core.tick(5_000).writes.is_empty());
        let writes = core.tick(10_000).writes;
        assert_eq!(writes.len(), 1);
        assert!(writes[0].calib_id.is_some());
    }

    #[test]
    fn periodic_policy_is_silent_without_subscription() {
        let config = SessionConfig::new().with_calibration(crate::clock::CalibrationPolicy::Periodic(
            std::time::Duration::from_secs(10),
        ));
        let mut core = SessionCore::new(&config);
        let _ = core.begin_subscription(0);
        core.end_subscription();
        assert!(core.tick(60_000).writes.is_empty());
    }
}
