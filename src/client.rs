//! Async session client.
//!
//! [`SessionClient`] is a thin handle over a background session loop task. Local
//! operations update the shared [`SessionCore`] immediately (so the display never
//! waits on the network) and hand the resulting partial write to the loop over
//! an unbounded MPSC channel. The loop owns the [`SessionStore`], reconciles
//! inbound snapshots, and ticks the countdown every
//! [`tick_interval`](SessionConfig::tick_interval).
//!
//! Events are emitted on a bounded channel returned from
//! [`SessionClient::connect`] / [`SessionClient::local`]; the timer display is
//! published on a `tokio::sync::watch` channel ([`SessionClient::watch_timer`]).
//!
//! # Example
//!
//! ```rust,ignore
//! let store = backend.subscribe("user-123");
//! let (client, mut events) = SessionClient::connect(store, SessionConfig::new());
//!
//! client.start_timer(30.0)?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::FiveSecondWarning { .. } => { /* … */ }
//!         SessionEvent::Finished { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```
//!
//! Without a store ([`SessionClient::local`]) every feature works on this device
//! only and nothing is written anywhere.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{CalibrationPolicy, Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::event::SessionEvent;
use crate::protocol::{Cells, Millis, Passover, Primary, RoundId, SessionPatch};
use crate::scoreboard::{Scoreboard, DEFAULT_TEAM_A, DEFAULT_TEAM_B};
use crate::scores::{GameRecord, Team, Totals};
use crate::session::{Reaction, SessionCore};
use crate::store::{SessionStore, Snapshot};
use crate::timer::TimerView;

/// Default interval of the countdown evaluation.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionClient`].
///
/// Every field has a default.
///
/// # Example
///
/// ```
/// use botb_session_sync::client::SessionConfig;
/// use botb_session_sync::clock::CalibrationPolicy;
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_team_names("Owls", "Foxes")
///     .with_calibration(CalibrationPolicy::Periodic(Duration::from_secs(60)))
///     .with_event_channel_capacity(64);
/// assert_eq!(config.team_a, "Owls");
/// assert_eq!(config.tick_interval, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the countdown display is recomputed.
    ///
    /// Defaults to **50 ms**. Values below 1 ms are clamped to 1 ms.
    pub tick_interval: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) so the session loop never blocks. The final `Disconnected` event
    /// on shutdown is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the session loop
    /// immediately.
    pub shutdown_timeout: Duration,
    /// When the clock calibration handshake runs.
    pub calibration: CalibrationPolicy,
    /// Raise a `RemoteSound` for a sound already pending when a subscription
    /// starts. Defaults to `false`: such a sound is recorded as handled.
    pub replay_sound_on_connect: bool,
    /// Initial display name of Team A.
    pub team_a: String,
    /// Initial display name of Team B.
    pub team_b: String,
    /// Local clock. Defaults to [`SystemClock`].
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            calibration: CalibrationPolicy::default(),
            replay_sound_on_connect: false,
            team_a: DEFAULT_TEAM_A.to_owned(),
            team_b: DEFAULT_TEAM_B.to_owned(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_calibration(mut self, policy: CalibrationPolicy) -> Self {
        self.calibration = policy;
        self
    }

    #[must_use]
    pub fn with_replay_sound_on_connect(mut self, replay: bool) -> Self {
        self.replay_sound_on_connect = replay;
        self
    }

    #[must_use]
    pub fn with_team_names(mut self, team_a: impl Into<String>, team_b: impl Into<String>) -> Self {
        self.team_a = team_a.into();
        self.team_b = team_b.into();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

enum Command {
    Write(SessionPatch),
    Attach(Box<dyn SessionStore>),
}

/// State shared between the client handle and the session loop.
struct Shared {
    core: Mutex<SessionCore>,
    running: AtomicBool,
    synced: AtomicBool,
    view_tx: watch::Sender<TimerView>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the core and publish the resulting timer view.
    fn update<T>(&self, f: impl FnOnce(&mut SessionCore) -> T) -> T {
        let mut core = self.lock();
        let out = f(&mut core);
        let view = core.timer_view();
        drop(core);
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        out
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to one device's synchronized quiz session.
///
/// Every operation applies locally first and returns once the write is queued;
/// nothing waits on the backend. Operations fail only with
/// [`SyncError::ClientShutDown`] after [`shutdown`](Self::shutdown).
pub struct SessionClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SessionClient {
    /// Start a session synchronized through `store`.
    ///
    /// The loop emits [`SessionEvent::Connected`] and writes the calibration
    /// handshake as soon as it starts.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn connect(
        store: impl SessionStore,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::spawn(Some(Box::new(store)), config)
    }

    /// Start a session that never synchronizes (no signed-in user).
    #[must_use = "the event receiver must be used to receive events"]
    pub fn local(config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::spawn(None, config)
    }

    fn spawn(
        store: Option<Box<dyn SessionStore>>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let core = SessionCore::new(&config);
        let (view_tx, _view_rx) = watch::channel(core.timer_view());
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            running: AtomicBool::new(true),
            synced: AtomicBool::new(false),
            view_tx,
        });

        let task = tokio::spawn(session_loop(
            store,
            cmd_rx,
            event_tx,
            Arc::clone(&shared),
            Arc::clone(&config.clock),
            config.tick_interval.max(Duration::from_millis(1)),
            shutdown_rx,
        ));

        let client = Self {
            cmd_tx,
            shared,
            clock: config.clock,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        (client, event_rx)
    }

    /// Replace the store, e.g. after the previous subscription dropped.
    ///
    /// The shadow is rebuilt from the new subscription's snapshots and the
    /// calibration handshake runs again.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn attach(&self, store: impl SessionStore) -> Result<()> {
        self.ensure_running()?;
        self.cmd_tx
            .send(Command::Attach(Box::new(store)))
            .map_err(|_| SyncError::ClientShutDown)
    }

    // ── Timer ───────────────────────────────────────────────────────

    /// Start a countdown of `total_secs` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn start_timer(&self, total_secs: f64) -> Result<()> {
        let now = self.now();
        self.apply(|core| Some(core.start_timer(total_secs, now)))
    }

    /// Pause a running countdown. Does nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn pause_timer(&self) -> Result<()> {
        let now = self.now();
        self.apply(|core| core.pause_timer(now))
    }

    /// Resume a paused countdown. Does nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn resume_timer(&self) -> Result<()> {
        let now = self.now();
        self.apply(|core| core.resume_timer(now))
    }

    /// Stop the countdown and clear the display.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn reset_timer(&self) -> Result<()> {
        self.apply(|core| Some(core.reset_timer()))
    }

    /// The current timer display.
    pub fn timer(&self) -> TimerView {
        *self.shared.view_tx.borrow()
    }

    /// Subscribe to timer display updates.
    pub fn watch_timer(&self) -> watch::Receiver<TimerView> {
        self.shared.view_tx.subscribe()
    }

    // ── Scoreboard ──────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn set_primary(&self, round: RoundId, primary: Primary) -> Result<()> {
        self.apply(|core| Some(core.set_primary(round, primary)))
    }

    /// Record the passover answer.
    ///
    /// A passover only exists after a wrong primary answer: in any other state
    /// the call changes nothing and writes nothing to the store.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn set_passover(&self, round: RoundId, passover: Passover) -> Result<()> {
        self.apply(|core| core.set_passover(round, passover))
    }

    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn set_team_name(&self, team: Team, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.apply(|core| Some(core.set_team_name(team, name)))
    }

    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn set_page(&self, page: u32) -> Result<()> {
        self.apply(|core| core.set_page(page))
    }

    /// Turn to the page showing the first unanswered round.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn follow_active_round(&self) -> Result<()> {
        self.apply(SessionCore::follow_active_round)
    }

    /// Blank the scoreboard.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn reset_scores(&self) -> Result<()> {
        self.apply(|core| Some(core.reset_cells()))
    }

    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn restore_cells(&self, cells: &Cells) -> Result<()> {
        self.apply(|core| Some(core.restore_cells(cells)))
    }

    /// Load a game from score history.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn restore_record(&self, record: &GameRecord) -> Result<()> {
        self.apply(|core| Some(core.restore_record(record)))
    }

    /// A copy of the mirrored scoreboard.
    pub fn scoreboard(&self) -> Scoreboard {
        self.shared.lock().scoreboard().clone()
    }

    pub fn totals(&self) -> Totals {
        self.shared.lock().scoreboard().totals()
    }

    /// The board as a score history entry.
    pub fn to_record(&self) -> GameRecord {
        self.shared.lock().to_record()
    }

    // ── Sound ───────────────────────────────────────────────────────

    /// Ask every other device to play `url`, or to stop playing if `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ClientShutDown`] if the session loop has stopped.
    pub fn broadcast_sound(&self, url: Option<String>) -> Result<()> {
        self.apply(|core| Some(core.broadcast_sound(url)))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Gracefully shut down the session loop.
    ///
    /// Closes the store and emits a final
    /// [`Disconnected`](SessionEvent::Disconnected). If the loop does not exit
    /// within [`shutdown_timeout`](SessionConfig::shutdown_timeout) it is aborted.
    pub async fn shutdown(&mut self) {
        debug!("SessionClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
        self.shared.synced.store(false, Ordering::Release);
    }

    /// Returns `true` until the session loop stops.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Returns `true` while a store subscription is live.
    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    /// The current clock offset estimate in milliseconds.
    pub fn clock_offset_ms(&self) -> Millis {
        self.shared.lock().offset_ms()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SyncError::ClientShutDown)
        }
    }

    fn apply(&self, f: impl FnOnce(&mut SessionCore) -> Option<SessionPatch>) -> Result<()> {
        self.ensure_running()?;
        // Queued while the core is locked: the loop checks for queued commands
        // under the same lock before reconciling a snapshot.
        self.shared.update(|core| match f(core) {
            Some(patch) => self
                .cmd_tx
                .send(Command::Write(patch))
                .map_err(|_| SyncError::ClientShutDown),
            None => {
                debug!("operation did not change the session");
                Ok(())
            }
        })
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("running", &self.is_running())
            .field("synced", &self.is_synced())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        // No executor to drive an async close here; aborting drops the store.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

type StoreSlot = Option<Box<dyn SessionStore>>;

async fn session_loop(
    initial: StoreSlot,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("session loop started");

    let mut store: StoreSlot = None;
    if let Some(initial) = initial {
        attach(&mut store, initial, &shared, clock.as_ref(), &event_tx).await;
    }

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Local writes go out before any snapshot is reconciled.
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Write(patch)) => write(&mut store, patch).await,
                    Some(Command::Attach(next)) => {
                        attach(&mut store, next, &shared, clock.as_ref(), &event_tx).await;
                    }
                    // Command channel closed: client handle dropped.
                    None => {
                        debug!("command channel closed, shutting down session loop");
                        close(&mut store).await;
                        break;
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                close(&mut store).await;
                if event_tx
                    .send(SessionEvent::Disconnected { reason: Some("client shut down".into()) })
                    .await
                    .is_err()
                {
                    debug!("event channel closed, receiver dropped");
                }
                break;
            }

            incoming = next_snapshot(&mut store) => {
                match incoming {
                    Some(Ok(snapshot)) => {
                        let now = clock.now_ms();
                        let reaction = shared.update(|core| {
                            cmd_rx.is_empty().then(|| core.apply_snapshot(&snapshot, now))
                        });
                        match reaction {
                            Some(reaction) => dispatch(reaction, &mut store, &event_tx).await,
                            // The store delivers a fresher snapshot once the queued writes merge.
                            None => debug!("snapshot predates queued local writes, skipping"),
                        }
                    }
                    Some(Err(e)) => {
                        error!("store receive error: {e}");
                        detach(&mut store, &shared, &event_tx, Some(e.to_string())).await;
                    }
                    None => {
                        info!("store subscription ended, continuing local-only");
                        detach(&mut store, &shared, &event_tx, None).await;
                    }
                }
            }

            _ = ticker.tick() => {
                let now = clock.now_ms();
                let reaction = shared.update(|core| core.tick(now));
                dispatch(reaction, &mut store, &event_tx).await;
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    shared.synced.store(false, Ordering::Release);
    debug!("session loop exited");
}

async fn next_snapshot(store: &mut StoreSlot) -> Option<Result<Snapshot>> {
    match store {
        Some(store) => store.next_snapshot().await,
        None => std::future::pending().await,
    }
}

async fn attach(
    store: &mut StoreSlot,
    next: Box<dyn SessionStore>,
    shared: &Shared,
    clock: &dyn Clock,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    if store.is_some() {
        debug!("replacing attached store");
        close(store).await;
        shared.lock().end_subscription();
    }
    *store = Some(next);
    let handshake = shared.lock().begin_subscription(clock.now_ms());
    shared.synced.store(true, Ordering::Release);
    emit_event(event_tx, SessionEvent::Connected);
    write(store, handshake).await;
}

async fn detach(
    store: &mut StoreSlot,
    shared: &Shared,
    event_tx: &mpsc::Sender<SessionEvent>,
    reason: Option<String>,
) {
    close(store).await;
    shared.lock().end_subscription();
    shared.synced.store(false, Ordering::Release);
    emit_event(event_tx, SessionEvent::Disconnected { reason });
}

async fn close(store: &mut StoreSlot) {
    if let Some(mut store) = store.take() {
        if let Err(e) = store.close().await {
            debug!("store close failed: {e}");
        }
    }
}

async fn write(store: &mut StoreSlot, patch: SessionPatch) {
    let Some(store) = store else {
        debug!("no store attached, write stays local");
        return;
    };
    if let Err(e) = store.merge(patch).await {
        warn!("store write failed: {e}");
    }
}

async fn dispatch(
    reaction: Reaction,
    store: &mut StoreSlot,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    for event in reaction.events {
        emit_event(event_tx, event);
    }
    for patch in reaction.writes {
        write(store, patch).await;
    }
}

fn emit_event(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::timer::TimerState;
    use async_trait::async_trait;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.calibration, CalibrationPolicy::OncePerSubscription);
        assert!(!config.replay_sound_on_connect);
        assert_eq!(config.team_a, "Team A");
        assert_eq!(config.team_b, "Team B");
    }

    #[test]
    fn config_builder_clamps() {
        let config = SessionConfig::new()
            .with_event_channel_capacity(0)
            .with_tick_interval(Duration::ZERO);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.tick_interval, Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn local_session_counts_down_without_store() {
        let config = SessionConfig::new().with_clock(TokioClock::starting_at(0));
        let (mut client, mut events) = SessionClient::local(config);
        assert!(!client.is_synced());

        client.start_timer(3.0).unwrap();
        assert_eq!(client.timer().state, TimerState::Running);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Finished { seq: 1, .. }));
        assert_eq!(client.timer().state, TimerState::Idle);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn operations_fail_after_shutdown() {
        let (mut client, _events) = SessionClient::local(SessionConfig::new());
        client.shutdown().await;
        assert!(!client.is_running());
        assert!(matches!(
            client.start_timer(10.0),
            Err(SyncError::ClientShutDown)
        ));
        assert!(matches!(
            client.set_primary(RoundId::R1, Primary::AwardedTwo),
            Err(SyncError::ClientShutDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_emits_disconnected() {
        let (mut client, mut events) = SessionClient::local(SessionConfig::new());
        client.shutdown().await;
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Disconnected {
                reason: Some("client shut down".into())
            }
        );
    }

    /// Store whose `close()` never completes, so the shutdown abort path runs.
    struct HangingCloseStore {
        close_called: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for HangingCloseStore {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl SessionStore for HangingCloseStore {
        async fn merge(&mut self, _patch: SessionPatch) -> Result<()> {
            Ok(())
        }

        async fn next_snapshot(&mut self) -> Option<Result<Snapshot>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            self.close_called.store(true, Ordering::Release);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_store() {
        let close_called = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let store = HangingCloseStore {
            close_called: Arc::clone(&close_called),
            dropped: Arc::clone(&dropped),
        };
        let config = SessionConfig::new().with_shutdown_timeout(Duration::from_millis(20));
        let (mut client, mut events) = SessionClient::connect(store, config);

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        client.shutdown().await;

        assert!(close_called.load(Ordering::Acquire));
        assert!(dropped.load(Ordering::Acquire));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn drop_aborts_session_loop() {
        let close_called = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let store = HangingCloseStore {
            close_called: Arc::clone(&close_called),
            dropped: Arc::clone(&dropped),
        };
        let (client, mut events) = SessionClient::connect(store, SessionConfig::new());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.load(Ordering::Acquire));
        assert!(!close_called.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn watch_timer_sees_local_changes() {
        let (mut client, _events) = SessionClient::local(SessionConfig::new());
        let mut rx = client.watch_timer();
        client.start_timer(30.0).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, TimerState::Running);
        client.shutdown().await;
    }
}
