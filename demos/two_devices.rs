//! # Two Devices Demo
//!
//! Runs two devices signed in as the same user against an in-process
//! [`MemoryBackend`]. The second device's clock runs three seconds ahead, yet
//! both show the same countdown once they have calibrated.
//!
//! 1. Both devices subscribe and calibrate against the backend clock
//! 2. Device one starts a 12 second countdown; both displays tick together
//! 3. Device two broadcasts a sound; only device one hears it
//! 4. The devices score a round with a passover
//! 5. Both shut down when the countdown finishes
//!
//! ## Running
//!
//! ```sh
//! cargo run --example two_devices
//!
//! # Show the session loop's decisions:
//! RUST_LOG=botb_session_sync=debug cargo run --example two_devices
//! ```

use std::sync::Arc;
use std::time::Duration;

use botb_session_sync::protocol::Millis;
use botb_session_sync::{
    Clock, MemoryBackend, Passover, Primary, RoundId, SessionClient, SessionConfig, SessionEvent,
    SystemClock, TimerState,
};

const UID: &str = "demo-user";

/// The system clock shifted by a fixed amount.
#[derive(Debug)]
struct SkewedClock(Millis);

impl Clock for SkewedClock {
    fn now_ms(&self) -> Millis {
        SystemClock.now_ms() + self.0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Devices ─────────────────────────────────────────────────────
    let backend = MemoryBackend::new(Arc::new(SystemClock));
    let (mut one, mut events_one) = SessionClient::connect(
        backend.subscribe(UID),
        SessionConfig::new().with_team_names("Owls", "Foxes"),
    );
    let (mut two, mut events_two) = SessionClient::connect(
        backend.subscribe(UID),
        SessionConfig::new().with_clock(SkewedClock(3_000)),
    );

    // Let both calibration handshakes complete.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(
        one = one.clock_offset_ms(),
        two = two.clock_offset_ms(),
        "clock offsets (ms)"
    );

    // ── Countdown ───────────────────────────────────────────────────
    one.start_timer(12.0)?;
    two.set_team_name(botb_session_sync::Team::B, "Foxes")?;

    let mut display = tokio::time::interval(Duration::from_secs(1));
    let mut finished = (false, false);
    let mut scored = false;

    while !(finished.0 && finished.1) {
        tokio::select! {
            _ = display.tick() => {
                let (a, b) = (one.timer(), two.timer());
                if a.state == TimerState::Running || b.state == TimerState::Running {
                    println!(
                        "device one: {:>2}s ({:>5.1}%)   device two: {:>2}s ({:>5.1}%)",
                        a.remaining_seconds, a.progress, b.remaining_seconds, b.progress
                    );
                }
                if !scored && a.remaining_seconds <= 8 {
                    scored = true;
                    two.broadcast_sound(Some("https://cdn.example.com/horn.mp3".into()))?;
                    one.set_primary(RoundId::R1, Primary::Wrong)?;
                }
            }

            Some(event) = events_one.recv() => {
                match event {
                    SessionEvent::RemoteSound { url, .. } => {
                        println!("device one plays {}", url.as_deref().unwrap_or("nothing"));
                        // Round 1 was missed by the Owls; the Foxes answer the passover.
                        two.set_passover(RoundId::R1, Passover::AwardedTwo)?;
                    }
                    SessionEvent::FiveSecondWarning { .. } => println!("device one: five seconds!"),
                    SessionEvent::Finished { .. } => finished.0 = true,
                    other => tracing::debug!(?other, "device one event"),
                }
            }

            Some(event) = events_two.recv() => {
                match event {
                    SessionEvent::RemoteSound { .. } => println!("device two heard its own sound (unexpected)"),
                    SessionEvent::FiveSecondWarning { .. } => println!("device two: five seconds!"),
                    SessionEvent::Finished { .. } => finished.1 = true,
                    other => tracing::debug!(?other, "device two event"),
                }
            }
        }
    }

    // ── Results ─────────────────────────────────────────────────────
    tokio::time::sleep(Duration::from_millis(100)).await;
    let board = one.scoreboard();
    let totals = one.totals();
    println!(
        "{} {} : {} {}",
        board.team_name(botb_session_sync::Team::A),
        totals.team_a,
        totals.team_b,
        board.team_name(botb_session_sync::Team::B)
    );

    // ── Shutdown ────────────────────────────────────────────────────
    one.shutdown().await;
    two.shutdown().await;
    tracing::info!("done");
    Ok(())
}
