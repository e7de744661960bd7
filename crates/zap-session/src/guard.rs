//! Session lifecycle.
//!
//! [`SessionGuard`] owns the locked/unlocked state. It validates and forwards
//! unlock attempts to the vault, starts the [`SessionClock`] from the vault's
//! own remaining time, and locks on user request or clock expiry. Every lock
//! flips local state first, stops the clock, purges registered listeners and
//! only then tells the vault, so no plaintext outlives the session even if the
//! vault call hangs.
//!
//! Transitions are serialized by an async mutex; observers read state without
//! taking it.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::clock::{AuthorityError, ClockEvent, ClockTiming, CountdownAuthority, SessionClock};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::types::{LockReason, SessionInfo, SessionState, SetupMode, TimeoutMinutes};
use crate::vault::Vault;

/// Something that must drop plaintext when the session ends.
///
/// Both hooks run synchronously inside the transition. `on_locked` also runs
/// on repeated locks.
pub trait LockListener: Send + Sync {
    /// A session was opened or re-verified.
    fn on_unlocked(&self) {}

    /// The session has ended.
    fn on_locked(&self, reason: LockReason);
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was opened.
    Unlocked {
        /// The effective session timeout.
        timeout: TimeoutMinutes,
        /// The vault's remaining time at unlock.
        time_left_seconds: u64,
    },
    /// A session was closed.
    Locked {
        /// Why it was closed.
        reason: LockReason,
    },
    /// The session timeout setting changed.
    TimeoutUpdated {
        /// The new timeout.
        timeout: TimeoutMinutes,
    },
}

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

struct VaultAuthority<V: Vault> {
    vault: Arc<V>,
}

impl<V: Vault> CountdownAuthority for VaultAuthority<V> {
    async fn remaining(&self) -> std::result::Result<u64, AuthorityError> {
        match self.vault.session_info().await {
            Ok(SessionInfo {
                is_locked: true, ..
            }) => Err(AuthorityError::Locked),
            Ok(info) => Ok(info.time_left_seconds),
            Err(e) => Err(AuthorityError::Unreachable {
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GuardState {
    session: SessionState,
    mode: SetupMode,
    timeout: TimeoutMinutes,
    unlocked_at: Option<DateTime<Utc>>,
}

/// Owns the session state and its transitions.
pub struct SessionGuard<V: Vault> {
    vault: Arc<V>,
    authority: Arc<VaultAuthority<V>>,
    clock: SessionClock,
    clock_events: Mutex<Option<mpsc::UnboundedReceiver<ClockEvent>>>,
    state: RwLock<GuardState>,
    transition: tokio::sync::Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn LockListener>>>,
    events: broadcast::Sender<SessionEvent>,
    audit: Arc<AuditLog>,
    min_password_length: usize,
}

impl<V: Vault> SessionGuard<V> {
    /// Creates a locked guard.
    ///
    /// Call [`start_expiry_watch`](Self::start_expiry_watch) to have clock
    /// expiry lock the session.
    #[must_use]
    pub fn new(vault: Arc<V>, config: &ControllerConfig, audit: Arc<AuditLog>) -> Arc<Self> {
        let (clock_tx, clock_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            authority: Arc::new(VaultAuthority {
                vault: Arc::clone(&vault),
            }),
            vault,
            clock: SessionClock::new(ClockTiming::from(config), clock_tx),
            clock_events: Mutex::new(Some(clock_rx)),
            state: RwLock::new(GuardState {
                session: SessionState::Locked,
                mode: SetupMode::Unknown,
                timeout: TimeoutMinutes::DEFAULT,
                unlocked_at: None,
            }),
            transition: tokio::sync::Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            events,
            audit,
            min_password_length: config.min_password_length,
        })
    }

    /// Spawns the task that turns clock expiry into a lock.
    ///
    /// Returns `None` if the watch was already started. The task holds only
    /// a weak reference and ends when the guard is dropped.
    pub fn start_expiry_watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.clock_events.lock().take()?;
        let guard = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(guard) = Weak::upgrade(&guard) else {
                    break;
                };
                guard.handle_clock_event(event).await;
            }
        }))
    }

    /// Registers a listener purged on every lock.
    pub fn add_lock_listener(&self, listener: Arc<dyn LockListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Asks the vault whether a master password exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VaultUnavailable`] if the vault cannot be reached.
    pub async fn initialize(&self) -> Result<SetupMode> {
        let first_run = self
            .vault
            .is_first_run()
            .await
            .map_err(crate::vault::VaultError::into_session_error)?;

        let mode = if first_run {
            SetupMode::FirstRun
        } else {
            SetupMode::Returning
        };
        self.state.write().mode = mode;
        debug!(?mode, "setup mode detected");
        Ok(mode)
    }

    /// Opens a session.
    ///
    /// On first run `confirm` must match `password` and the password must
    /// meet the minimum length; the vault then stores it. Otherwise the vault
    /// verifies it. Calling this while unlocked re-verifies and restarts the
    /// clock.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty or too-short password
    /// - [`Error::Authentication`] for a wrong password or mismatched confirmation
    /// - [`Error::VaultUnavailable`] if the vault cannot be reached
    pub async fn unlock(&self, password: &str, confirm: Option<&str>) -> Result<()> {
        let _transition = self.transition.lock().await;

        if password.is_empty() {
            return Err(Error::validation("password cannot be empty"));
        }

        let mode = match self.mode() {
            SetupMode::Unknown => self.initialize().await?,
            mode => mode,
        };

        if mode == SetupMode::FirstRun {
            if password.chars().count() < self.min_password_length {
                return Err(Error::validation(format!(
                    "password must be at least {} characters",
                    self.min_password_length
                )));
            }
            let confirmed = confirm
                .is_some_and(|c| bool::from(c.as_bytes().ct_eq(password.as_bytes())));
            if !confirmed {
                return Err(Error::authentication("passwords do not match"));
            }
        }

        let accepted = self
            .vault
            .unlock(password)
            .await
            .map_err(crate::vault::VaultError::into_session_error)?;
        if !accepted {
            warn!("unlock rejected: incorrect password");
            self.audit
                .record(AuditEntry::session(AuditAction::UnlockFailed, "incorrect password"));
            return Err(Error::authentication("incorrect password"));
        }

        let timeout = match self.vault.load_timeout_minutes().await {
            Ok(minutes) => {
                let timeout = TimeoutMinutes::clamped(minutes);
                if timeout.get() != minutes {
                    warn!(stored = minutes, effective = %timeout, "stored timeout out of range, clamped");
                }
                timeout
            }
            Err(e) => {
                warn!(error = %e, "failed to load timeout setting, using default");
                TimeoutMinutes::DEFAULT
            }
        };

        // A failed read ends any session already open, not just this attempt.
        let info = match self.vault.session_info().await {
            Ok(info) if !info.is_locked => info,
            Ok(_) => {
                self.lock_in_transition(LockReason::BackendLocked).await;
                return Err(Error::VaultUnavailable {
                    reason: "vault reported no session right after unlock".to_string(),
                });
            }
            Err(e) => {
                self.lock_in_transition(LockReason::BackendUnreachable).await;
                return Err(e.into_session_error());
            }
        };

        {
            let mut state = self.state.write();
            state.session = SessionState::Unlocked;
            state.mode = SetupMode::Returning;
            state.timeout = timeout;
            state.unlocked_at = Some(Utc::now());
        }
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_unlocked();
        }
        let epoch = self
            .clock
            .start(info.time_left_seconds, Arc::clone(&self.authority));

        info!(
            epoch,
            timeout = %timeout,
            time_left = info.time_left_seconds,
            first_run = mode == SetupMode::FirstRun,
            "vault unlocked"
        );
        self.audit.record(AuditEntry::session(
            AuditAction::Unlocked,
            if mode == SetupMode::FirstRun {
                "first_run"
            } else {
                "returning"
            },
        ));
        let _ = self.events.send(SessionEvent::Unlocked {
            timeout,
            time_left_seconds: info.time_left_seconds,
        });
        Ok(())
    }

    /// Locks at the user's request.
    pub async fn lock(&self) {
        self.lock_with(LockReason::User).await;
    }

    /// Locks for `reason`. Returns true if a session was actually open.
    ///
    /// Repeated locks still stop the clock and purge listeners but do not
    /// emit another event.
    pub async fn lock_with(&self, reason: LockReason) -> bool {
        let _transition = self.transition.lock().await;
        self.lock_in_transition(reason).await
    }

    /// Persists a new session timeout.
    ///
    /// While unlocked, the clock is resynced against the vault's remaining
    /// time afterwards; the running session is not restarted unless the vault
    /// itself reset it.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `minutes` is outside `[5, 60]`
    /// - [`Error::Persistence`] if the vault cannot store it
    /// - [`Error::VaultUnavailable`] if the vault cannot be reached; an open
    ///   session is locked
    pub async fn update_timeout(&self, minutes: u32) -> Result<TimeoutMinutes> {
        let timeout = TimeoutMinutes::new(minutes)?;
        let _transition = self.transition.lock().await;

        if let Err(e) = self.vault.update_timeout(timeout).await {
            warn!(error = %e, "failed to save session timeout");
            let err = e.into_persistence_error();
            if matches!(err, Error::VaultUnavailable { .. }) {
                self.lock_in_transition(LockReason::BackendUnreachable).await;
            }
            return Err(err);
        }

        self.state.write().timeout = timeout;
        info!(timeout = %timeout, "session timeout updated");
        self.audit
            .record(AuditEntry::session(AuditAction::TimeoutUpdated, timeout.to_string()));
        let _ = self.events.send(SessionEvent::TimeoutUpdated { timeout });

        if self.is_unlocked() {
            match self.vault.session_info().await {
                Ok(SessionInfo {
                    is_locked: true, ..
                }) => {
                    self.lock_in_transition(LockReason::BackendLocked).await;
                }
                Ok(info) => {
                    self.clock.resync(info.time_left_seconds);
                }
                Err(e) => {
                    self.lock_in_transition(LockReason::BackendUnreachable).await;
                    return Err(e.into_session_error());
                }
            }
        }

        Ok(timeout)
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.read().session
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.state().is_unlocked()
    }

    /// Detected setup mode.
    #[must_use]
    pub fn mode(&self) -> SetupMode {
        self.state.read().mode
    }

    /// Effective session timeout.
    #[must_use]
    pub fn timeout(&self) -> TimeoutMinutes {
        self.state.read().timeout
    }

    /// When the current session was opened.
    #[must_use]
    pub fn unlocked_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().unlocked_at
    }

    /// Seconds left on the local countdown, zero when locked.
    #[must_use]
    pub fn remaining_seconds(&self) -> u64 {
        if self.is_unlocked() {
            self.clock.remaining()
        } else {
            0
        }
    }

    /// Subscribe to countdown updates.
    #[must_use]
    pub fn countdown(&self) -> watch::Receiver<u64> {
        self.clock.subscribe()
    }

    async fn handle_clock_event(&self, event: ClockEvent) {
        let ClockEvent::Expired { epoch, cause } = event;
        let _transition = self.transition.lock().await;

        if epoch != self.clock.epoch() || !self.is_unlocked() {
            debug!(epoch, ?cause, "ignoring expiry for a finished session");
            return;
        }
        self.lock_in_transition(cause.lock_reason()).await;
    }

    async fn lock_in_transition(&self, reason: LockReason) -> bool {
        let was_unlocked = {
            let mut state = self.state.write();
            let was = state.session.is_unlocked();
            state.session = SessionState::Locked;
            state.unlocked_at = None;
            was
        };

        self.clock.stop();
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_locked(reason);
        }
        self.vault.lock().await;

        if was_unlocked {
            info!(%reason, "vault locked");
            self.audit
                .record(AuditEntry::session(AuditAction::Locked, reason.to_string()));
            let _ = self.events.send(SessionEvent::Locked { reason });
        }
        was_unlocked
    }
}

impl<V: Vault> std::fmt::Debug for SessionGuard<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.read();
        f.debug_struct("SessionGuard")
            .field("session", &state.session)
            .field("mode", &state.mode)
            .field("timeout", &state.timeout)
            .field("clock", &self.clock)
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryVault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use test_case::test_case;

    const PASSWORD: &str = "correct horse";

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
        last: Mutex<Option<LockReason>>,
    }

    impl LockListener for CountingListener {
        fn on_locked(&self, reason: LockReason) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(reason);
        }
    }

    fn guard_for(vault: MemoryVault) -> (Arc<MemoryVault>, Arc<SessionGuard<MemoryVault>>) {
        let vault = Arc::new(vault);
        let guard = SessionGuard::new(
            Arc::clone(&vault),
            &ControllerConfig::default(),
            Arc::new(AuditLog::default()),
        );
        guard.start_expiry_watch().expect("first watch");
        (vault, guard)
    }

    fn returning() -> (Arc<MemoryVault>, Arc<SessionGuard<MemoryVault>>) {
        guard_for(MemoryVault::new().with_password(PASSWORD))
    }

    // ========================================================================
    // Initialize and unlock
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_initialize_detects_mode() {
        let (_vault, guard) = guard_for(MemoryVault::new());
        assert_eq!(guard.mode(), SetupMode::Unknown);
        assert_eq!(guard.initialize().await.expect("reachable"), SetupMode::FirstRun);

        let (_vault, guard) = returning();
        assert_eq!(guard.initialize().await.expect("reachable"), SetupMode::Returning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_unreachable() {
        let vault = MemoryVault::new();
        vault.set_unreachable(true);
        let (_vault, guard) = guard_for(vault);

        let err = guard.initialize().await.expect_err("offline");
        assert!(matches!(err, Error::VaultUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returning_unlock_starts_clock_from_vault() {
        let (_vault, guard) = guard_for(
            MemoryVault::new()
                .with_password(PASSWORD)
                .with_stored_timeout(10),
        );
        let mut events = guard.subscribe();

        guard.unlock(PASSWORD, None).await.expect("unlock");

        assert!(guard.is_unlocked());
        assert_eq!(guard.timeout().get(), 10);
        assert_eq!(guard.remaining_seconds(), 600);
        assert!(guard.unlocked_at().is_some());
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::Unlocked {
                timeout: TimeoutMinutes::new(10).expect("valid"),
                time_left_seconds: 600
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_is_authentication_error() {
        let (vault, guard) = returning();

        let err = guard.unlock("nope", None).await.expect_err("wrong");

        assert!(matches!(err, Error::Authentication { .. }));
        assert!(!guard.is_unlocked());
        assert_eq!(vault.unlock_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_password_never_reaches_vault() {
        let (vault, guard) = returning();

        let err = guard.unlock("", None).await.expect_err("empty");

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(vault.unlock_calls(), 0);
    }

    #[test_case("short", Some("short"), true ; "too short")]
    #[test_case("longenough", Some("different1"), false ; "mismatch")]
    #[test_case("longenough", None, false ; "missing confirmation")]
    #[tokio::test(start_paused = true)]
    async fn test_first_run_rejections(password: &str, confirm: Option<&str>, validation: bool) {
        let (vault, guard) = guard_for(MemoryVault::new());

        let err = guard.unlock(password, confirm).await.expect_err("rejected");

        assert_eq!(vault.unlock_calls(), 0);
        assert!(!guard.is_unlocked());
        if validation {
            assert!(matches!(err, Error::Validation { .. }), "got {err:?}");
        } else {
            assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_sets_password() {
        let (vault, guard) = guard_for(MemoryVault::new());

        guard
            .unlock("longenough", Some("longenough"))
            .await
            .expect("first run");

        assert!(guard.is_unlocked());
        assert_eq!(guard.mode(), SetupMode::Returning);
        assert!(!vault.is_first_run().await.expect("reachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_stored_timeout_is_clamped() {
        let (_vault, guard) = guard_for(
            MemoryVault::new()
                .with_password(PASSWORD)
                .with_stored_timeout(2),
        );

        guard.unlock(PASSWORD, None).await.expect("unlock");

        assert_eq!(guard.timeout(), TimeoutMinutes::DEFAULT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reunlock_with_failed_session_read_locks() {
        let (vault, guard) = returning();
        let listener = Arc::new(CountingListener::default());
        guard.add_lock_listener(Arc::clone(&listener) as Arc<dyn LockListener>);
        guard.unlock(PASSWORD, None).await.expect("unlock");
        let mut events = guard.subscribe();

        vault.set_session_info_fails(true);
        let err = guard.unlock(PASSWORD, None).await.expect_err("session read fails");

        assert!(matches!(err, Error::VaultUnavailable { .. }));
        assert!(!guard.is_unlocked());
        assert!(!guard.clock.is_running());
        assert_eq!(guard.remaining_seconds(), 0);
        assert!(!vault.backend_unlocked());
        assert_eq!(*listener.last.lock(), Some(LockReason::BackendUnreachable));
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::Locked {
                reason: LockReason::BackendUnreachable
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_unlock_with_failed_session_read_stays_locked() {
        let (vault, guard) = returning();
        let mut events = guard.subscribe();
        vault.set_session_info_fails(true);

        let err = guard.unlock(PASSWORD, None).await.expect_err("session read fails");

        assert!(matches!(err, Error::VaultUnavailable { .. }));
        assert!(!guard.is_unlocked());
        assert!(!vault.backend_unlocked());
        assert!(events.try_recv().is_err(), "nothing was open, nothing to announce");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_while_unlocked_restarts_clock() {
        let (vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");

        tokio::time::sleep(Duration::from_millis(100_500)).await;
        assert_eq!(guard.remaining_seconds(), 200);

        guard.unlock(PASSWORD, None).await.expect("unlock again");
        assert_eq!(guard.remaining_seconds(), 300);
        assert_eq!(vault.unlock_calls(), 2);
    }

    // ========================================================================
    // Lock
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_lock_purges_and_notifies_once() {
        let (vault, guard) = returning();
        let listener = Arc::new(CountingListener::default());
        guard.add_lock_listener(Arc::clone(&listener) as Arc<dyn LockListener>);
        guard.unlock(PASSWORD, None).await.expect("unlock");
        let mut events = guard.subscribe();

        guard.lock().await;
        guard.lock().await;

        assert!(!guard.is_unlocked());
        assert_eq!(guard.remaining_seconds(), 0);
        assert!(!vault.backend_unlocked());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::Locked {
                reason: LockReason::User
            }
        );
        assert!(events.try_recv().is_err(), "second lock must not notify");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_while_locked_returns_false() {
        let (_vault, guard) = returning();
        assert!(!guard.lock_with(LockReason::Disposed).await);
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_countdown_expiry_locks() {
        let (vault, guard) = returning();
        let listener = Arc::new(CountingListener::default());
        guard.add_lock_listener(Arc::clone(&listener) as Arc<dyn LockListener>);
        guard.unlock(PASSWORD, None).await.expect("unlock");

        tokio::time::sleep(Duration::from_millis(299_500)).await;
        assert!(guard.is_unlocked());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!guard.is_unlocked());
        // The final tick and the resync at the deadline race; either ends it.
        assert!(matches!(
            *listener.last.lock(),
            Some(LockReason::Expired | LockReason::BackendLocked)
        ));
        assert!(!vault.backend_unlocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_lock_detected_within_one_resync() {
        let (vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");
        let mut events = guard.subscribe();

        vault.force_backend_lock();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert!(!guard.is_unlocked());
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::Locked {
                reason: LockReason::BackendLocked
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_fails_closed() {
        let (vault, guard) = returning();
        let listener = Arc::new(CountingListener::default());
        guard.add_lock_listener(Arc::clone(&listener) as Arc<dyn LockListener>);
        guard.unlock(PASSWORD, None).await.expect("unlock");

        vault.set_unreachable(true);
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert!(!guard.is_unlocked());
        assert_eq!(*listener.last.lock(), Some(LockReason::BackendUnreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_is_corrected_on_resync() {
        let (vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");

        tokio::time::sleep(Duration::from_secs(1)).await;
        vault.set_backend_time_left(50);
        tokio::time::sleep(Duration::from_millis(4_500)).await;

        let remaining = guard.remaining_seconds();
        assert!((45..=46).contains(&remaining), "remaining was {remaining}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_does_not_lock_new_session() {
        let (_vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");
        let stale_epoch = guard.clock.epoch();
        guard.lock().await;
        guard.unlock(PASSWORD, None).await.expect("unlock again");

        guard
            .handle_clock_event(ClockEvent::Expired {
                epoch: stale_epoch,
                cause: crate::clock::ExpiryCause::Countdown,
            })
            .await;

        assert!(guard.is_unlocked());
    }

    // ========================================================================
    // Timeout updates
    // ========================================================================

    #[test_case(4 ; "below range")]
    #[test_case(61 ; "above range")]
    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_rejects_out_of_range(minutes: u32) {
        let (vault, guard) = returning();

        let err = guard.update_timeout(minutes).await.expect_err("invalid");

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(vault.stored_timeout(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_does_not_restart_session() {
        let (vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");
        tokio::time::sleep(Duration::from_millis(60_500)).await;

        let timeout = guard.update_timeout(30).await.expect("saved");

        assert_eq!(timeout.get(), 30);
        assert_eq!(guard.timeout().get(), 30);
        assert_eq!(vault.stored_timeout(), 30);
        assert_eq!(guard.remaining_seconds(), 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_follows_backend_reset() {
        let (_vault, guard) = guard_for(
            MemoryVault::new()
                .with_password(PASSWORD)
                .with_reset_on_timeout_update(true),
        );
        guard.unlock(PASSWORD, None).await.expect("unlock");
        tokio::time::sleep(Duration::from_millis(60_500)).await;

        guard.update_timeout(30).await.expect("saved");

        assert_eq!(guard.remaining_seconds(), 1800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_persistence_failure() {
        let (vault, guard) = returning();
        guard.unlock(PASSWORD, None).await.expect("unlock");
        vault.set_persistence_fails(true);

        let err = guard.update_timeout(30).await.expect_err("read-only");

        assert!(matches!(err, Error::Persistence { .. }));
        assert_eq!(guard.timeout().get(), 5);
        assert!(guard.is_unlocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_while_locked() {
        let (vault, guard) = returning();

        guard.update_timeout(15).await.expect("saved");

        assert_eq!(vault.stored_timeout(), 15);
        assert!(!guard.is_unlocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_starts_once() {
        let (_vault, guard) = returning();
        assert!(guard.start_expiry_watch().is_none());
    }
}
