//! Session countdown with periodic resync against the vault.
//!
//! [`Countdown`] is the pure arithmetic: a local value decremented once per
//! tick and corrected when the authoritative value drifts past a tolerance.
//! [`SessionClock`] drives it with two background tasks, one ticking and one
//! resyncing, and reports expiry over an mpsc channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::types::LockReason;

/// Timing parameters for a [`SessionClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTiming {
    /// Interval between local decrements.
    pub tick_interval: Duration,
    /// Interval between authoritative resyncs.
    pub resync_interval: Duration,
    /// Largest drift, in seconds, left uncorrected.
    pub drift_tolerance_secs: u64,
}

impl Default for ClockTiming {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ClockTiming {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            resync_interval: config.resync_interval,
            drift_tolerance_secs: config.drift_tolerance_secs,
        }
    }
}

/// Why the clock declared the session over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCause {
    /// The countdown reached zero.
    Countdown,
    /// A resync found the backend already locked.
    AuthorityLocked,
    /// A resync could not reach the backend.
    AuthorityUnreachable,
}

impl ExpiryCause {
    /// The lock reason this cause maps to.
    #[must_use]
    pub const fn lock_reason(self) -> LockReason {
        match self {
            Self::Countdown => LockReason::Expired,
            Self::AuthorityLocked => LockReason::BackendLocked,
            Self::AuthorityUnreachable => LockReason::BackendUnreachable,
        }
    }
}

/// Events emitted by a running clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// The session identified by `epoch` is over.
    Expired {
        /// The `start` call this event belongs to.
        epoch: u64,
        /// What ended the session.
        cause: ExpiryCause,
    },
}

/// Failures when asking the authority for the remaining time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// The authority reports no open session.
    #[error("session is locked")]
    Locked,

    /// The authority could not be reached.
    #[error("authority unreachable: {reason}")]
    Unreachable {
        /// Transport failure or timeout.
        reason: String,
    },
}

/// The source of truth for the remaining session time.
pub trait CountdownAuthority: Send + Sync + 'static {
    /// Seconds until the authority locks the session on its own.
    fn remaining(&self) -> impl Future<Output = Result<u64, AuthorityError>> + Send;
}

/// Result of comparing the local countdown with an authoritative value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// Value predicted from the last authoritative reading and elapsed time.
    pub predicted: u64,
    /// Value reported by the authority.
    pub backend: u64,
    /// Whether the local countdown was overwritten.
    pub snapped: bool,
    /// Whether this resync took the countdown to zero.
    pub expired: bool,
}

/// Local countdown arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    remaining: u64,
    last_known: u64,
    last_resync_at: Instant,
    expired: bool,
}

impl Countdown {
    /// Starts a countdown from an authoritative value read at `now`.
    #[must_use]
    pub const fn new(initial: u64, now: Instant) -> Self {
        Self {
            remaining: initial,
            last_known: initial,
            last_resync_at: now,
            expired: initial == 0,
        }
    }

    /// Seconds left on the local countdown.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the countdown has reached zero.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        self.expired
    }

    /// When the last authoritative value was received.
    #[must_use]
    pub const fn last_resync_at(&self) -> Instant {
        self.last_resync_at
    }

    /// Decrements by one second, saturating at zero.
    ///
    /// Returns true only on the transition to zero.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.mark_if_expired()
    }

    /// The value expected now given the last authoritative reading.
    #[must_use]
    pub fn predicted(&self, now: Instant) -> u64 {
        let elapsed = rounded_secs(now.saturating_duration_since(self.last_resync_at));
        self.last_known.saturating_sub(elapsed)
    }

    /// Applies an authoritative reading taken at `now`.
    ///
    /// The local value is overwritten only when the prediction is off by more
    /// than `tolerance` seconds, in either direction.
    pub fn resync(&mut self, backend: u64, now: Instant, tolerance: u64) -> ResyncOutcome {
        let predicted = self.predicted(now);
        let snapped = predicted.abs_diff(backend) > tolerance;
        if snapped {
            self.remaining = backend;
        }
        self.last_known = backend;
        self.last_resync_at = now;

        ResyncOutcome {
            predicted,
            backend,
            snapped,
            expired: snapped && self.mark_if_expired(),
        }
    }

    fn mark_if_expired(&mut self) -> bool {
        if self.remaining == 0 && !self.expired {
            self.expired = true;
            return true;
        }
        false
    }
}

fn rounded_secs(elapsed: Duration) -> u64 {
    u64::try_from((elapsed.as_millis() + 500) / 1000).unwrap_or(u64::MAX)
}

struct ClockState {
    countdown: Option<Countdown>,
    epoch: u64,
    running: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ClockState {
    const fn is_current(&self, epoch: u64) -> bool {
        self.running && self.epoch == epoch
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct ClockShared {
    state: Mutex<ClockState>,
    events: mpsc::UnboundedSender<ClockEvent>,
    remaining: watch::Sender<u64>,
    timing: ClockTiming,
}

impl ClockShared {
    fn tick(&self, epoch: u64) -> Option<u64> {
        let mut state = self.state.lock();
        if !state.is_current(epoch) {
            return None;
        }

        let countdown = state.countdown.as_mut()?;
        let fired = countdown.tick();
        let remaining = countdown.remaining();
        self.remaining.send_replace(remaining);

        if fired {
            self.expire(&mut state, ExpiryCause::Countdown);
        }
        Some(remaining)
    }

    fn resync(&self, epoch: u64, backend: u64) -> Option<ResyncOutcome> {
        let mut state = self.state.lock();
        if !state.is_current(epoch) {
            return None;
        }

        let countdown = state.countdown.as_mut()?;
        let outcome = countdown.resync(backend, Instant::now(), self.timing.drift_tolerance_secs);
        let remaining = countdown.remaining();
        self.remaining.send_replace(remaining);

        if outcome.snapped {
            info!(
                predicted = outcome.predicted,
                backend = outcome.backend,
                "session clock corrected to backend"
            );
        }
        if outcome.expired {
            self.expire(&mut state, ExpiryCause::Countdown);
        }
        Some(outcome)
    }

    fn fail(&self, epoch: u64, cause: ExpiryCause) {
        let mut state = self.state.lock();
        if state.is_current(epoch) {
            self.expire(&mut state, cause);
        }
    }

    fn expire(&self, state: &mut ClockState, cause: ExpiryCause) {
        state.running = false;
        state.abort_tasks();
        self.remaining.send_replace(0);

        debug!(epoch = state.epoch, ?cause, "session clock expired");
        // The receiver is gone only when the owning guard was dropped.
        let _ = self.events.send(ClockEvent::Expired {
            epoch: state.epoch,
            cause,
        });
    }
}

/// Drives a [`Countdown`] with background tick and resync tasks.
pub struct SessionClock {
    shared: Arc<ClockShared>,
}

impl SessionClock {
    /// Creates a stopped clock reporting expiry on `events`.
    #[must_use]
    pub fn new(timing: ClockTiming, events: mpsc::UnboundedSender<ClockEvent>) -> Self {
        let (remaining, _) = watch::channel(0);
        Self {
            shared: Arc::new(ClockShared {
                state: Mutex::new(ClockState {
                    countdown: None,
                    epoch: 0,
                    running: false,
                    tasks: Vec::new(),
                }),
                events,
                remaining,
                timing,
            }),
        }
    }

    /// Starts counting down from `initial` seconds, replacing any running
    /// countdown, and returns the new epoch.
    ///
    /// A zero `initial` expires immediately.
    pub fn start<A: CountdownAuthority>(&self, initial: u64, authority: Arc<A>) -> u64 {
        let mut state = self.shared.state.lock();
        state.abort_tasks();
        state.epoch += 1;
        state.running = true;
        state.countdown = Some(Countdown::new(initial, Instant::now()));
        self.shared.remaining.send_replace(initial);

        let epoch = state.epoch;
        if initial == 0 {
            self.shared.expire(&mut state, ExpiryCause::Countdown);
            return epoch;
        }

        state.tasks = vec![
            tokio::spawn(run_ticks(Arc::clone(&self.shared), epoch)),
            tokio::spawn(run_resyncs(Arc::clone(&self.shared), epoch, authority)),
        ];
        debug!(epoch, initial, "session clock started");
        epoch
    }

    /// Decrements the running countdown once.
    ///
    /// Returns the new remaining value, or `None` if the clock is stopped.
    pub fn tick(&self) -> Option<u64> {
        let epoch = self.shared.state.lock().epoch;
        self.shared.tick(epoch)
    }

    /// Applies an authoritative reading to the running countdown.
    ///
    /// Returns `None` if the clock is stopped.
    pub fn resync(&self, backend: u64) -> Option<ResyncOutcome> {
        let epoch = self.shared.state.lock().epoch;
        self.shared.resync(epoch, backend)
    }

    /// Cancels both schedules. Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.running {
            debug!(epoch = state.epoch, "session clock stopped");
        }
        state.running = false;
        state.countdown = None;
        state.abort_tasks();
        self.shared.remaining.send_replace(0);
    }

    /// Whether a countdown is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// The epoch of the most recent `start`.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.state.lock().epoch
    }

    /// Seconds left on the local countdown, zero when stopped.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        *self.shared.remaining.borrow()
    }

    /// When the running countdown last received an authoritative value.
    #[must_use]
    pub fn last_resync_at(&self) -> Option<Instant> {
        let state = self.shared.state.lock();
        state
            .countdown
            .filter(|_| state.running)
            .map(|c| c.last_resync_at())
    }

    /// Subscribe to countdown updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.remaining.subscribe()
    }
}

impl Drop for SessionClock {
    fn drop(&mut self) {
        self.shared.state.lock().abort_tasks();
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SessionClock")
            .field("epoch", &state.epoch)
            .field("running", &state.running)
            .field("remaining", &state.countdown.map(|c| c.remaining()))
            .field("timing", &self.shared.timing)
            .finish()
    }
}

async fn run_ticks(shared: Arc<ClockShared>, epoch: u64) {
    let period = shared.timing.tick_interval;
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        timer.tick().await;
        match shared.tick(epoch) {
            Some(0) | None => break,
            Some(_) => {}
        }
    }
}

async fn run_resyncs<A: CountdownAuthority>(
    shared: Arc<ClockShared>,
    epoch: u64,
    authority: Arc<A>,
) {
    let period = shared.timing.resync_interval;
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        timer.tick().await;

        // A hung backend counts as unreachable so expiry still happens
        // within a bounded time.
        let reading = match tokio::time::timeout(period, authority.remaining()).await {
            Ok(reading) => reading,
            Err(_) => Err(AuthorityError::Unreachable {
                reason: format!("no answer within {period:?}"),
            }),
        };

        match reading {
            Ok(backend) => match shared.resync(epoch, backend) {
                Some(outcome) if !outcome.expired => {}
                _ => break,
            },
            Err(AuthorityError::Locked) => {
                info!(epoch, "backend reports the session locked");
                shared.fail(epoch, ExpiryCause::AuthorityLocked);
                break;
            }
            Err(AuthorityError::Unreachable { reason }) => {
                warn!(epoch, %reason, "backend unreachable during resync, locking");
                shared.fail(epoch, ExpiryCause::AuthorityUnreachable);
                break;
            }
        }
    }
}
