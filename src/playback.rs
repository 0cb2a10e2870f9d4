//! Sound playback service.
//!
//! [`Playback`] owns the audio output and at most one playing custom sound.
//! Starting a new sound stops and drops the previous handle first.

use tracing::{debug, warn};

use crate::error::Result;
use crate::event::SessionEvent;

/// Default output volume.
pub const DEFAULT_VOLUME: f32 = 0.8;

/// Built-in synthesized sounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    Correct,
    Incorrect,
    FiveSeconds,
    TimerEnd,
    Beep,
}

/// A sound started by an [`AudioOutput`].
pub trait PlayingSound: Send {
    /// Stop playback and rewind.
    fn stop(&mut self);

    /// Returns `true` once the sound has played to the end.
    fn is_finished(&self) -> bool;
}

/// An audio device.
///
/// # Errors
///
/// [`play_url`](AudioOutput::play_url) and [`play_cue`](AudioOutput::play_cue)
/// return [`SyncError::Playback`](crate::SyncError::Playback) when the device
/// cannot start the sound.
pub trait AudioOutput: Send {
    type Handle: PlayingSound;

    /// Start streaming the audio at `url`.
    fn play_url(&mut self, url: &str) -> Result<Self::Handle>;

    /// Play a built-in cue. Cues do not interrupt custom sounds.
    fn play_cue(&mut self, cue: Cue) -> Result<()>;

    /// Set the master gain, 0.0–1.0.
    fn set_volume(&mut self, volume: f32);
}

/// Single-active-sound playback over an [`AudioOutput`].
pub struct Playback<O: AudioOutput> {
    output: O,
    current: Option<O::Handle>,
    volume: f32,
}

impl<O: AudioOutput> Playback<O> {
    pub fn new(mut output: O) -> Self {
        output.set_volume(DEFAULT_VOLUME);
        Self {
            output,
            current: None,
            volume: DEFAULT_VOLUME,
        }
    }

    /// Play `url`, stopping whatever custom sound is playing.
    ///
    /// # Errors
    ///
    /// Returns the output's error if playback cannot start; the previous sound
    /// is stopped either way.
    pub fn play(&mut self, url: &str) -> Result<()> {
        self.stop();
        debug!(url, "playing sound");
        self.current = Some(self.output.play_url(url)?);
        Ok(())
    }

    /// Stop the current custom sound, if any.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.stop();
        }
    }

    /// Returns `true` while a custom sound is playing.
    pub fn is_playing(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// # Errors
    ///
    /// Returns the output's error if the cue cannot start.
    pub fn cue(&mut self, cue: Cue) -> Result<()> {
        self.output.play_cue(cue)
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Set the volume, clamped to 0.0–1.0.
    pub fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.volume = volume;
        self.output.set_volume(volume);
    }

    /// React to a session event: remote sounds play (or stop), timer pulses cue.
    ///
    /// Failures are logged, never returned.
    pub fn handle_event(&mut self, event: &SessionEvent) {
        let result = match event {
            SessionEvent::RemoteSound { url: Some(url), .. } => self.play(url),
            SessionEvent::RemoteSound { url: None, .. } => {
                self.stop();
                Ok(())
            }
            SessionEvent::FiveSecondWarning { .. } => self.cue(Cue::FiveSeconds),
            SessionEvent::Finished { .. } => self.cue(Cue::TimerEnd),
            SessionEvent::Connected
            | SessionEvent::Disconnected { .. }
            | SessionEvent::Calibrated { .. } => Ok(()),
        };
        if let Err(e) = result {
            warn!("playback failed: {e}");
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }
}

impl<O: AudioOutput> std::fmt::Debug for Playback<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playback")
            .field("playing", &self.is_playing())
            .field("volume", &self.volume)
            .finish()
    }
}

impl<O: AudioOutput> Drop for Playback<O> {
    fn drop(&mut self) {
        self.stop();
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
    use crate::error::SyncError;
    use crate::protocol::Nonce;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeHandle {
        url: String,
        log: Log,
    }

    impl PlayingSound for FakeHandle {
        fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.url));
        }

        fn is_finished(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeOutput {
        log: Log,
    }

    impl AudioOutput for FakeOutput {
        type Handle = FakeHandle;

        fn play_url(&mut self, url: &str) -> Result<FakeHandle> {
            if url.is_empty() {
                return Err(SyncError::Playback("empty url".into()));
            }
            self.log.lock().unwrap().push(format!("play {url}"));
            Ok(FakeHandle {
                url: url.to_owned(),
                log: Arc::clone(&self.log),
            })
        }

        fn play_cue(&mut self, cue: Cue) -> Result<()> {
            self.log.lock().unwrap().push(format!("cue {cue:?}"));
            Ok(())
        }

        fn set_volume(&mut self, volume: f32) {
            self.log.lock().unwrap().push(format!("volume {volume}"));
        }
    }

    fn playback() -> (Playback<FakeOutput>, Log) {
        let output = FakeOutput::default();
        let log = Arc::clone(&output.log);
        (Playback::new(output), log)
    }

    #[test]
    fn starts_at_default_volume() {
        let (playback, log) = playback();
        assert_eq!(playback.volume(), DEFAULT_VOLUME);
        assert_eq!(log.lock().unwrap().as_slice(), ["volume 0.8"]);
    }

    #[test]
    fn new_sound_stops_previous_one() {
        let (mut playback, log) = playback();
        playback.play("a.mp3").unwrap();
        playback.play("b.mp3").unwrap();
        assert_eq!(
            log.lock().unwrap()[1..],
            ["play a.mp3", "stop a.mp3", "play b.mp3"]
        );
        assert!(playback.is_playing());
    }

    #[test]
    fn failed_play_still_stops_previous() {
        let (mut playback, log) = playback();
        playback.play("a.mp3").unwrap();
        assert!(playback.play("").is_err());
        assert!(!playback.is_playing());
        assert_eq!(log.lock().unwrap().last().unwrap(), "stop a.mp3");
    }

    #[test]
    fn volume_is_clamped() {
        let (mut playback, _) = playback();
        playback.set_volume(3.0);
        assert_eq!(playback.volume(), 1.0);
        playback.set_volume(-1.0);
        assert_eq!(playback.volume(), 0.0);
        playback.set_volume(f32::NAN);
        assert_eq!(playback.volume(), 0.0);
    }

    #[test]
    fn remote_events_drive_playback() {
        let (mut playback, log) = playback();
        playback.handle_event(&SessionEvent::RemoteSound {
            seq: 1,
            url: Some("horn.mp3".into()),
            received_at_ms: 0,
        });
        playback.handle_event(&SessionEvent::RemoteSound {
            seq: 2,
            url: None,
            received_at_ms: 10,
        });
        playback.handle_event(&SessionEvent::Finished {
            seq: 3,
            segment: Nonce::from("s"),
        });
        assert_eq!(
            log.lock().unwrap()[1..],
            ["play horn.mp3", "stop horn.mp3", "cue TimerEnd"]
        );
    }
}
