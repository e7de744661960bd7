//! Per-secret exposure tracking.
//!
//! A secret is either hidden, being decrypted, or revealed with exactly one
//! pending auto-hide. Every decrypt is tagged with a generation number drawn
//! from a registry-wide counter; a result is applied only if its entry still
//! carries that generation and is still decrypting. Any hide, purge or
//! mutation in the meantime therefore discards the late plaintext.
//!
//! The registry starts closed and only accepts reveals between the guard's
//! unlock and lock notifications, checked under the same mutex as the map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::error::{Error, Result};
use crate::guard::LockListener;
use crate::types::{ExposureState, LockReason, Plaintext, SecretId};
use crate::vault::Vault;

/// What a `reveal` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealOutcome {
    /// The secret is now visible with a fresh auto-hide.
    Revealed,
    /// The secret was already decrypting or visible; nothing changed.
    AlreadyActive,
    /// The decrypt finished after the entry was hidden or purged; the
    /// plaintext was discarded.
    Superseded,
}

/// Why a secret was hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideReason {
    /// The user toggled it off.
    Manual,
    /// The exposure ceiling elapsed.
    AutoHide,
    /// The secret was edited.
    Mutated,
    /// The secret was deleted.
    Deleted,
    /// The user navigated away.
    ContextSwitch,
    /// The session ended.
    SessionLocked,
}

impl HideReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoHide => "auto_hide",
            Self::Mutated => "mutated",
            Self::Deleted => "deleted",
            Self::ContextSwitch => "context_switch",
            Self::SessionLocked => "session_locked",
        }
    }
}

/// The auto-hide timer of a revealed entry. Dropping it cancels the timer.
struct PendingHide {
    token: u64,
    handle: JoinHandle<()>,
}

impl Drop for PendingHide {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Phase {
    Hidden,
    Decrypting,
    Revealed {
        plaintext: Plaintext,
        revealed_at: DateTime<Utc>,
        revealed_instant: Instant,
        hide: PendingHide,
    },
}

impl Phase {
    const fn state(&self) -> ExposureState {
        match self {
            Self::Hidden => ExposureState::Hidden,
            Self::Decrypting => ExposureState::Decrypting,
            Self::Revealed { .. } => ExposureState::Revealed,
        }
    }
}

struct ExposureEntry {
    generation: u64,
    phase: Phase,
}

impl ExposureEntry {
    fn is_decrypting(&self, generation: u64) -> bool {
        self.generation == generation && matches!(self.phase, Phase::Decrypting)
    }

    fn hide_token(&self) -> Option<u64> {
        match &self.phase {
            Phase::Revealed { hide, .. } => Some(hide.token),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    open: bool,
    entries: HashMap<SecretId, ExposureEntry>,
    next_generation: u64,
    next_hide_token: u64,
}

/// Resets a decrypting entry if the reveal future is dropped mid-flight.
struct DecryptGuard<'a> {
    inner: &'a Mutex<RegistryInner>,
    id: &'a SecretId,
    generation: u64,
    armed: bool,
}

impl Drop for DecryptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(self.id) {
            if entry.is_decrypting(self.generation) {
                entry.phase = Phase::Hidden;
            }
        }
    }
}

/// Tracks which secrets are visible and for how long.
pub struct ExposureRegistry<V: Vault> {
    vault: Arc<V>,
    inner: Arc<Mutex<RegistryInner>>,
    auto_hide_after: Duration,
    audit: Arc<AuditLog>,
}

impl<V: Vault> ExposureRegistry<V> {
    /// Creates an empty, closed registry.
    #[must_use]
    pub fn new(vault: Arc<V>, auto_hide_after: Duration, audit: Arc<AuditLog>) -> Self {
        Self {
            vault,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            auto_hide_after,
            audit,
        }
    }

    /// Decrypts a secret for display.
    ///
    /// A no-op if the secret is already decrypting or visible.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionLocked`] if the registry is closed; the vault is not called
    /// - [`Error::Decryption`] if the vault fails to decrypt
    /// - [`Error::VaultUnavailable`] if the vault cannot be reached
    ///
    /// The entry is hidden after any error.
    pub async fn reveal(&self, id: &SecretId) -> Result<RevealOutcome> {
        let generation = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.open {
                debug!(secret_id = %id, "reveal refused, registry closed");
                return Err(Error::SessionLocked);
            }
            let entry = inner
                .entries
                .entry(id.clone())
                .or_insert_with(|| ExposureEntry {
                    generation: 0,
                    phase: Phase::Hidden,
                });
            if !matches!(entry.phase, Phase::Hidden) {
                debug!(secret_id = %id, "reveal ignored, already active");
                return Ok(RevealOutcome::AlreadyActive);
            }

            inner.next_generation += 1;
            entry.generation = inner.next_generation;
            entry.phase = Phase::Decrypting;
            entry.generation
        };

        let mut decrypting = DecryptGuard {
            inner: &self.inner,
            id,
            generation,
            armed: true,
        };
        let result = self.vault.reveal_secret(id).await;
        decrypting.armed = false;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let current = inner.open
            && inner
                .entries
                .get(id)
                .is_some_and(|entry| entry.is_decrypting(generation));
        if !current {
            debug!(secret_id = %id, generation, "discarding stale decrypt result");
            return Ok(RevealOutcome::Superseded);
        }

        inner.next_hide_token += 1;
        let token = inner.next_hide_token;
        let Some(entry) = inner.entries.get_mut(id) else {
            return Ok(RevealOutcome::Superseded);
        };

        match result {
            Ok(plaintext) => {
                entry.phase = Phase::Revealed {
                    plaintext,
                    revealed_at: Utc::now(),
                    revealed_instant: Instant::now(),
                    hide: PendingHide {
                        token,
                        handle: self.schedule_hide(id.clone(), token),
                    },
                };
                drop(guard);

                info!(secret_id = %id, "secret revealed");
                self.audit
                    .record(AuditEntry::secret(AuditAction::Revealed, id, ""));
                Ok(RevealOutcome::Revealed)
            }
            Err(e) => {
                entry.phase = Phase::Hidden;
                drop(guard);

                warn!(secret_id = %id, error = %e, "failed to decrypt secret");
                self.audit
                    .record(AuditEntry::secret(AuditAction::RevealFailed, id, e.to_string()));
                Err(e.into_reveal_error(id))
            }
        }
    }

    /// Hides a secret, cancelling its auto-hide. Returns whether it was
    /// decrypting or visible.
    pub fn hide(&self, id: &SecretId) -> bool {
        self.hide_with(id, HideReason::Manual)
    }

    /// The secret was edited; any visible plaintext is stale.
    pub fn on_secret_mutated(&self, id: &SecretId) -> bool {
        self.hide_with(id, HideReason::Mutated)
    }

    /// The secret was deleted; its entry is destroyed.
    pub fn on_secret_deleted(&self, id: &SecretId) -> bool {
        let removed = self.inner.lock().entries.remove(id);
        let was_visible = removed.is_some_and(|e| !matches!(e.phase, Phase::Hidden));
        if was_visible {
            self.record_hidden(id, HideReason::Deleted);
        }
        was_visible
    }

    /// The user navigated away; everything is hidden. Returns how many
    /// secrets were decrypting or visible.
    pub fn on_context_switch(&self) -> usize {
        self.purge_all(HideReason::ContextSwitch)
    }

    /// Accepts reveals until the next [`close`](Self::close).
    pub fn open(&self) {
        self.inner.lock().open = true;
    }

    /// Refuses further reveals and destroys every entry in one step. Returns
    /// how many were decrypting or visible.
    pub fn close(&self, reason: HideReason) -> usize {
        let drained: Vec<(SecretId, ExposureEntry)> = {
            let mut inner = self.inner.lock();
            inner.open = false;
            inner.entries.drain().collect()
        };
        self.record_purged(drained, reason)
    }

    /// Whether reveals are accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Destroys every entry. Returns how many were decrypting or visible.
    pub fn purge_all(&self, reason: HideReason) -> usize {
        let drained: Vec<(SecretId, ExposureEntry)> = self.inner.lock().entries.drain().collect();
        self.record_purged(drained, reason)
    }

    fn record_purged(&self, drained: Vec<(SecretId, ExposureEntry)>, reason: HideReason) -> usize {
        let mut count = 0;
        for (id, entry) in drained {
            if !matches!(entry.phase, Phase::Hidden) {
                count += 1;
                self.record_hidden(&id, reason);
            }
        }
        if count > 0 {
            debug!(count, reason = reason.as_str(), "purged exposed secrets");
        }
        count
    }

    /// The exposure state of a secret.
    #[must_use]
    pub fn state(&self, id: &SecretId) -> ExposureState {
        self.inner
            .lock()
            .entries
            .get(id)
            .map_or(ExposureState::Hidden, |e| e.phase.state())
    }

    /// A copy of the visible plaintext, if any.
    #[must_use]
    pub fn revealed_value(&self, id: &SecretId) -> Option<Plaintext> {
        match &self.inner.lock().entries.get(id)?.phase {
            Phase::Revealed { plaintext, .. } => Some(plaintext.clone()),
            _ => None,
        }
    }

    /// When the secret became visible.
    #[must_use]
    pub fn revealed_at(&self, id: &SecretId) -> Option<DateTime<Utc>> {
        match &self.inner.lock().entries.get(id)?.phase {
            Phase::Revealed { revealed_at, .. } => Some(*revealed_at),
            _ => None,
        }
    }

    /// Time until the secret is hidden automatically.
    #[must_use]
    pub fn hides_in(&self, id: &SecretId) -> Option<Duration> {
        match &self.inner.lock().entries.get(id)?.phase {
            Phase::Revealed {
                revealed_instant, ..
            } => Some(self.auto_hide_after.saturating_sub(revealed_instant.elapsed())),
            _ => None,
        }
    }

    /// Number of pending auto-hide timers for a secret, at most one.
    #[must_use]
    pub fn pending_hides(&self, id: &SecretId) -> usize {
        self.inner
            .lock()
            .entries
            .get(id)
            .and_then(ExposureEntry::hide_token)
            .map_or(0, |_| 1)
    }

    /// Number of secrets currently visible.
    #[must_use]
    pub fn revealed_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e.phase, Phase::Revealed { .. }))
            .count()
    }

    /// Every tracked secret that is not hidden, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SecretId, ExposureState)> {
        let mut exposed: Vec<_> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !matches!(e.phase, Phase::Hidden))
            .map(|(id, e)| (id.clone(), e.phase.state()))
            .collect();
        exposed.sort_by(|a, b| a.0.cmp(&b.0));
        exposed
    }

    fn hide_with(&self, id: &SecretId, reason: HideReason) -> bool {
        let was_visible = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(id) {
                Some(entry) if !matches!(entry.phase, Phase::Hidden) => {
                    entry.phase = Phase::Hidden;
                    true
                }
                _ => false,
            }
        };
        if was_visible {
            self.record_hidden(id, reason);
        }
        was_visible
    }

    fn record_hidden(&self, id: &SecretId, reason: HideReason) {
        debug!(secret_id = %id, reason = reason.as_str(), "secret hidden");
        self.audit
            .record(AuditEntry::secret(AuditAction::Hidden, id, reason.as_str()));
    }

    fn schedule_hide(&self, id: SecretId, token: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let audit = Arc::clone(&self.audit);
        let after = self.auto_hide_after;

        tokio::spawn(async move {
            tokio::time::sleep(after).await;

            let fired = {
                let mut inner = inner.lock();
                match inner.entries.get_mut(&id) {
                    Some(entry) if entry.hide_token() == Some(token) => {
                        entry.phase = Phase::Hidden;
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                debug!(secret_id = %id, "auto-hide elapsed");
                audit.record(AuditEntry::secret(
                    AuditAction::Hidden,
                    &id,
                    HideReason::AutoHide.as_str(),
                ));
            }
        })
    }
}

impl<V: Vault> LockListener for ExposureRegistry<V> {
    fn on_unlocked(&self) {
        self.open();
    }

    fn on_locked(&self, reason: LockReason) {
        let purged = self.close(HideReason::SessionLocked);
        debug!(%reason, purged, "exposure registry purged on lock");
    }
}

impl<V: Vault> std::fmt::Debug for ExposureRegistry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExposureRegistry")
            .field("open", &inner.open)
            .field("tracked", &inner.entries.len())
            .field("next_generation", &inner.next_generation)
            .field("auto_hide_after", &self.auto_hide_after)
            .finish_non_exhaustive()
    }
}
