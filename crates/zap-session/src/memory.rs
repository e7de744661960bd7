//! In-process vault.
//!
//! [`MemoryVault`] implements [`Vault`] with a plain map of secrets and a
//! backend-side countdown driven by tokio's clock, so it follows paused time
//! in tests. Fault injection hooks simulate an unreachable backend, failed
//! writes, backend-side locks, clock jumps and slow decrypts.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::types::{Plaintext, SecretId, SessionInfo, TimeoutMinutes};
use crate::vault::{Vault, VaultError};

#[derive(Default)]
struct MemoryState {
    password: Option<Zeroizing<String>>,
    stored_timeout: u32,
    deadline: Option<Instant>,
    secrets: HashMap<SecretId, Zeroizing<String>>,
    broken_secrets: HashSet<SecretId>,
    unreachable: bool,
    persistence_fails: bool,
    session_info_fails: bool,
    reset_on_timeout_update: bool,
    unlock_calls: usize,
    lock_calls: usize,
    session_info_calls: usize,
    reveal_calls: usize,
}

/// A vault backed by process memory.
pub struct MemoryVault {
    state: Mutex<MemoryState>,
    reveal_gate: watch::Sender<bool>,
}

impl MemoryVault {
    /// Creates a vault in first-run state with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        let (reveal_gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(MemoryState {
                stored_timeout: TimeoutMinutes::DEFAULT.get(),
                ..MemoryState::default()
            }),
            reveal_gate,
        }
    }

    /// Sets the master password, making this a returning-user vault.
    #[must_use]
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.state.lock().password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Stores a secret.
    #[must_use]
    pub fn with_secret(self, id: &str, value: impl Into<String>) -> Self {
        if let Ok(id) = SecretId::new(id) {
            self.insert_secret(id, value);
        }
        self
    }

    /// Sets the raw persisted timeout, which may be out of range.
    #[must_use]
    pub fn with_stored_timeout(self, minutes: u32) -> Self {
        self.state.lock().stored_timeout = minutes;
        self
    }

    /// Makes `update_timeout` restart the backend countdown with the new value.
    #[must_use]
    pub fn with_reset_on_timeout_update(self, reset: bool) -> Self {
        self.state.lock().reset_on_timeout_update = reset;
        self
    }

    /// Inserts or replaces a secret.
    pub fn insert_secret(&self, id: SecretId, value: impl Into<String>) {
        let mut state = self.state.lock();
        state.broken_secrets.remove(&id);
        state.secrets.insert(id, Zeroizing::new(value.into()));
    }

    /// Removes a secret.
    pub fn remove_secret(&self, id: &SecretId) {
        self.state.lock().secrets.remove(id);
    }

    /// Makes decrypting `id` fail until the secret is replaced.
    pub fn corrupt_secret(&self, id: &SecretId) {
        self.state.lock().broken_secrets.insert(id.clone());
    }

    /// Simulates the backend process becoming unreachable or coming back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Makes settings writes fail.
    pub fn set_persistence_fails(&self, fails: bool) {
        self.state.lock().persistence_fails = fails;
    }

    /// Makes only `session_info` fail as unreachable.
    pub fn set_session_info_fails(&self, fails: bool) {
        self.state.lock().session_info_fails = fails;
    }

    /// Locks the backend session without telling the controller.
    pub fn force_backend_lock(&self) {
        self.state.lock().deadline = None;
    }

    /// Moves the backend deadline so that `secs` remain, as after a suspend.
    pub fn set_backend_time_left(&self, secs: u64) {
        let mut state = self.state.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now() + Duration::from_secs(secs));
        }
    }

    /// Holds every decrypt call until [`resume_reveals`](Self::resume_reveals).
    pub fn pause_reveals(&self) {
        self.reveal_gate.send_replace(true);
    }

    /// Releases held decrypt calls.
    pub fn resume_reveals(&self) {
        self.reveal_gate.send_replace(false);
    }

    /// The persisted timeout.
    #[must_use]
    pub fn stored_timeout(&self) -> u32 {
        self.state.lock().stored_timeout
    }

    /// Whether the backend currently holds an open session.
    #[must_use]
    pub fn backend_unlocked(&self) -> bool {
        let state = self.state.lock();
        state.deadline.is_some_and(|d| d > Instant::now())
    }

    /// Number of `unlock` calls received.
    #[must_use]
    pub fn unlock_calls(&self) -> usize {
        self.state.lock().unlock_calls
    }

    /// Number of `lock` calls received.
    #[must_use]
    pub fn lock_calls(&self) -> usize {
        self.state.lock().lock_calls
    }

    /// Number of `session_info` calls received.
    #[must_use]
    pub fn session_info_calls(&self) -> usize {
        self.state.lock().session_info_calls
    }

    /// Number of `reveal_secret` calls received.
    #[must_use]
    pub fn reveal_calls(&self) -> usize {
        self.state.lock().reveal_calls
    }

    fn unreachable_error() -> VaultError {
        VaultError::Unreachable {
            reason: "memory vault is offline".to_string(),
        }
    }
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryVault")
            .field("first_run", &state.password.is_none())
            .field("secrets", &state.secrets.len())
            .field("unlocked", &state.deadline.is_some())
            .finish()
    }
}

impl Vault for MemoryVault {
    async fn is_first_run(&self) -> Result<bool, VaultError> {
        let state = self.state.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        Ok(state.password.is_none())
    }

    async fn unlock(&self, password: &str) -> Result<bool, VaultError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.unlock_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable_error());
        }

        let accepted: bool = match &state.password {
            Some(stored) => stored.as_bytes().ct_eq(password.as_bytes()).into(),
            None => {
                state.password = Some(Zeroizing::new(password.to_string()));
                true
            }
        };

        if accepted {
            let timeout = TimeoutMinutes::clamped(state.stored_timeout);
            state.deadline = Some(Instant::now() + Duration::from_secs(timeout.as_secs()));
        }
        Ok(accepted)
    }

    async fn lock(&self) {
        let mut state = self.state.lock();
        state.lock_calls += 1;
        state.deadline = None;
    }

    async fn session_info(&self) -> Result<SessionInfo, VaultError> {
        let mut state = self.state.lock();
        state.session_info_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        if state.session_info_fails {
            return Err(VaultError::Unreachable {
                reason: "session query timed out".to_string(),
            });
        }

        let now = Instant::now();
        match state.deadline {
            Some(deadline) if deadline > now => Ok(SessionInfo::unlocked(
                deadline.saturating_duration_since(now).as_secs(),
            )),
            Some(_) => {
                state.deadline = None;
                Ok(SessionInfo::locked())
            }
            None => Ok(SessionInfo::locked()),
        }
    }

    async fn reveal_secret(&self, id: &SecretId) -> Result<Plaintext, VaultError> {
        {
            let mut state = self.state.lock();
            state.reveal_calls += 1;
        }

        let mut gate = self.reveal_gate.subscribe();
        let released = gate.wait_for(|paused| !*paused).await.is_ok();
        if !released {
            return Err(Self::unreachable_error());
        }

        let state = self.state.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        if !state.deadline.is_some_and(|d| d > Instant::now()) {
            return Err(VaultError::Rejected {
                reason: "session expired".to_string(),
            });
        }
        if state.broken_secrets.contains(id) {
            return Err(VaultError::DecryptionFailed {
                reason: "authentication tag mismatch".to_string(),
            });
        }

        state
            .secrets
            .get(id)
            .map(|value| Plaintext::new(value.as_str()))
            .ok_or_else(|| VaultError::SecretNotFound { id: id.to_string() })
    }

    async fn update_timeout(&self, minutes: TimeoutMinutes) -> Result<(), VaultError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        if state.persistence_fails {
            return Err(VaultError::Persistence {
                reason: "settings store is read-only".to_string(),
            });
        }

        state.stored_timeout = minutes.get();
        if state.reset_on_timeout_update && state.deadline.is_some() {
            state.deadline = Some(Instant::now() + Duration::from_secs(minutes.as_secs()));
        }
        Ok(())
    }

    async fn load_timeout_minutes(&self) -> Result<u32, VaultError> {
        let state = self.state.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        Ok(state.stored_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SecretId {
        SecretId::new(s).expect("valid id")
    }

    #[tokio::test(start_paused = true)]
    async fn first_unlock_sets_password() {
        let vault = MemoryVault::new();
        assert!(vault.is_first_run().await.expect("reachable"));

        assert!(vault.unlock("correct horse").await.expect("reachable"));
        assert!(!vault.is_first_run().await.expect("reachable"));

        vault.lock().await;
        assert!(!vault.unlock("wrong").await.expect("reachable"));
        assert!(vault.unlock("correct horse").await.expect("reachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_countdown_follows_tokio_time() {
        let vault = MemoryVault::new().with_password("pw").with_stored_timeout(5);
        assert!(vault.unlock("pw").await.expect("reachable"));

        let info = vault.session_info().await.expect("reachable");
        assert_eq!(info, SessionInfo::unlocked(300));

        tokio::time::sleep(Duration::from_secs(100)).await;
        let info = vault.session_info().await.expect("reachable");
        assert_eq!(info.time_left_seconds, 200);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(vault.session_info().await.expect("reachable").is_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_stored_timeout_is_clamped_by_backend() {
        let vault = MemoryVault::new().with_password("pw").with_stored_timeout(500);
        assert!(vault.unlock("pw").await.expect("reachable"));
        let info = vault.session_info().await.expect("reachable");
        assert_eq!(info.time_left_seconds, 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_requires_open_session() {
        let vault = MemoryVault::new().with_password("pw").with_secret("s1", "v1");
        let err = vault.reveal_secret(&id("s1")).await.expect_err("locked");
        assert!(matches!(err, VaultError::Rejected { .. }));

        assert!(vault.unlock("pw").await.expect("reachable"));
        let value = vault.reveal_secret(&id("s1")).await.expect("revealed");
        assert_eq!(value.expose(), "v1");

        let err = vault.reveal_secret(&id("missing")).await.expect_err("missing");
        assert!(matches!(err, VaultError::SecretNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fault_injection() {
        let vault = MemoryVault::new().with_password("pw").with_secret("s1", "v1");
        assert!(vault.unlock("pw").await.expect("reachable"));

        vault.corrupt_secret(&id("s1"));
        assert!(matches!(
            vault.reveal_secret(&id("s1")).await,
            Err(VaultError::DecryptionFailed { .. })
        ));

        vault.set_persistence_fails(true);
        assert!(matches!(
            vault.update_timeout(TimeoutMinutes::clamped(10)).await,
            Err(VaultError::Persistence { .. })
        ));

        vault.set_unreachable(true);
        assert!(vault.session_info().await.is_err());

        vault.set_unreachable(false);
        vault.set_session_info_fails(true);
        assert!(vault.session_info().await.is_err());
        assert!(vault.reveal_secret(&id("missing")).await.is_err());

        vault.set_session_info_fails(false);
        vault.force_backend_lock();
        assert!(vault.session_info().await.expect("reachable").is_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_reveals_wait_for_resume() {
        let vault = std::sync::Arc::new(
            MemoryVault::new().with_password("pw").with_secret("s1", "v1"),
        );
        assert!(vault.unlock("pw").await.expect("reachable"));

        vault.pause_reveals();
        let pending = {
            let vault = std::sync::Arc::clone(&vault);
            tokio::spawn(async move { vault.reveal_secret(&id("s1")).await })
        };

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        vault.resume_reveals();
        let value = pending.await.expect("join").expect("revealed");
        assert_eq!(value.expose(), "v1");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_update_resets_only_when_configured() {
        let vault = MemoryVault::new().with_password("pw");
        assert!(vault.unlock("pw").await.expect("reachable"));
        vault
            .update_timeout(TimeoutMinutes::new(30).expect("valid"))
            .await
            .expect("saved");
        assert_eq!(vault.stored_timeout(), 30);
        assert_eq!(vault.session_info().await.expect("reachable").time_left_seconds, 300);

        let vault = MemoryVault::new()
            .with_password("pw")
            .with_reset_on_timeout_update(true);
        assert!(vault.unlock("pw").await.expect("reachable"));
        vault
            .update_timeout(TimeoutMinutes::new(30).expect("valid"))
            .await
            .expect("saved");
        assert_eq!(vault.session_info().await.expect("reachable").time_left_seconds, 1800);
    }
}
