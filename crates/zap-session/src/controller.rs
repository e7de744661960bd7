//! The session controller.
//!
//! Wires one [`SessionGuard`], one [`ExposureRegistry`] and one
//! [`ClipboardExporter`] around a shared vault and audit log. This is the type
//! embedders hold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::clipboard::{ClipboardExporter, ClipboardWriter};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::guard::{LockListener, SessionEvent, SessionGuard};
use crate::registry::{ExposureRegistry, RevealOutcome};
use crate::types::{
    ExposureState, LockReason, Plaintext, SecretId, SessionState, SetupMode, TimeoutMinutes,
};
use crate::vault::Vault;

/// Session and exposure lifecycle for one vault.
pub struct SessionController<V: Vault> {
    guard: Arc<SessionGuard<V>>,
    registry: Arc<ExposureRegistry<V>>,
    exporter: ClipboardExporter<V>,
    audit: Arc<AuditLog>,
    expiry_watch: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Vault> SessionController<V> {
    /// Builds a locked controller.
    ///
    /// Must be called inside a tokio runtime; the clock-expiry watcher is
    /// spawned here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails validation.
    pub fn create(
        vault: Arc<V>,
        primary_clipboard: Arc<dyn ClipboardWriter>,
        fallback_clipboard: Arc<dyn ClipboardWriter>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(AuditLog::new(config.audit_capacity));
        let registry = Arc::new(ExposureRegistry::new(
            Arc::clone(&vault),
            config.auto_hide_after,
            Arc::clone(&audit),
        ));
        let guard = SessionGuard::new(Arc::clone(&vault), &config, Arc::clone(&audit));
        guard.add_lock_listener(Arc::clone(&registry) as Arc<dyn LockListener>);
        let expiry_watch = guard.start_expiry_watch();

        let exporter = ClipboardExporter::new(vault, primary_clipboard, Arc::clone(&audit))
            .with_fallback(fallback_clipboard);

        debug!(?config, "session controller created");
        Ok(Self {
            guard,
            registry,
            exporter,
            audit,
            expiry_watch: Mutex::new(expiry_watch),
        })
    }

    /// Detects first-run or returning mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VaultUnavailable`] if the vault cannot be reached.
    pub async fn initialize(&self) -> Result<SetupMode> {
        self.guard.initialize().await
    }

    /// Opens a session. See [`SessionGuard::unlock`].
    ///
    /// # Errors
    ///
    /// Returns validation, authentication or availability errors.
    pub async fn unlock(&self, password: &str, confirm: Option<&str>) -> Result<()> {
        self.guard.unlock(password, confirm).await
    }

    /// Locks the session and purges every exposure.
    pub async fn lock(&self) {
        self.guard.lock().await;
    }

    /// Persists a new session timeout. See [`SessionGuard::update_timeout`].
    ///
    /// # Errors
    ///
    /// Returns validation, persistence or availability errors.
    pub async fn update_timeout(&self, minutes: u32) -> Result<TimeoutMinutes> {
        self.guard.update_timeout(minutes).await
    }

    /// Shows a secret for at most the auto-hide ceiling.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionLocked`] if no session is open; the vault is not called
    /// - [`Error::Decryption`] if the vault cannot decrypt the secret
    /// - [`Error::VaultUnavailable`] if the vault is gone; the session is locked
    pub async fn reveal(&self, id: &SecretId) -> Result<RevealOutcome> {
        self.ensure_unlocked()?;
        let result = self.registry.reveal(id).await;
        self.fail_closed_on(result).await
    }

    /// Hides a secret. Always allowed.
    pub fn hide(&self, id: &SecretId) -> bool {
        self.registry.hide(id)
    }

    /// Reveals a hidden secret or hides a visible one.
    ///
    /// # Errors
    ///
    /// Same as [`reveal`](Self::reveal) when revealing.
    pub async fn toggle(&self, id: &SecretId) -> Result<ExposureState> {
        if self.registry.state(id) == ExposureState::Hidden {
            self.reveal(id).await?;
        } else {
            self.registry.hide(id);
        }
        Ok(self.registry.state(id))
    }

    /// Copies a secret to the clipboard without revealing it.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionLocked`] if no session is open; the vault is not called
    /// - [`Error::Decryption`] if the vault cannot decrypt the secret
    /// - [`Error::Clipboard`] if no clipboard accepted the value
    /// - [`Error::VaultUnavailable`] if the vault is gone; the session is locked
    pub async fn copy(&self, id: &SecretId) -> Result<()> {
        self.ensure_unlocked()?;
        let result = self.exporter.copy(id).await;
        self.fail_closed_on(result).await
    }

    /// The secret was edited.
    pub fn on_secret_mutated(&self, id: &SecretId) -> bool {
        self.registry.on_secret_mutated(id)
    }

    /// The secret was deleted.
    pub fn on_secret_deleted(&self, id: &SecretId) -> bool {
        self.registry.on_secret_deleted(id)
    }

    /// The user switched to another box or list.
    pub fn on_context_switch(&self) -> usize {
        self.registry.on_context_switch()
    }

    /// Locks with reason `Disposed` and stops the expiry watcher. Idempotent.
    pub async fn dispose(&self) {
        self.guard.lock_with(LockReason::Disposed).await;
        if let Some(watch) = self.expiry_watch.lock().take() {
            watch.abort();
            info!("session controller disposed");
        }
    }

    /// Current session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.guard.state()
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.guard.is_unlocked()
    }

    /// Detected setup mode.
    #[must_use]
    pub fn setup_mode(&self) -> SetupMode {
        self.guard.mode()
    }

    /// Effective session timeout.
    #[must_use]
    pub fn timeout(&self) -> TimeoutMinutes {
        self.guard.timeout()
    }

    /// When the current session was opened.
    #[must_use]
    pub fn unlocked_at(&self) -> Option<DateTime<Utc>> {
        self.guard.unlocked_at()
    }

    /// Seconds until auto-lock, zero when locked.
    #[must_use]
    pub fn remaining_seconds(&self) -> u64 {
        self.guard.remaining_seconds()
    }

    /// Subscribe to countdown updates.
    #[must_use]
    pub fn countdown(&self) -> watch::Receiver<u64> {
        self.guard.countdown()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.guard.subscribe()
    }

    /// Exposure state of a secret.
    #[must_use]
    pub fn exposure_state(&self, id: &SecretId) -> ExposureState {
        self.registry.state(id)
    }

    /// The visible plaintext of a secret, if revealed.
    #[must_use]
    pub fn revealed_value(&self, id: &SecretId) -> Option<Plaintext> {
        self.registry.revealed_value(id)
    }

    /// The exposure registry.
    #[must_use]
    pub fn registry(&self) -> &ExposureRegistry<V> {
        &self.registry
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.guard.is_unlocked() {
            Ok(())
        } else {
            Err(Error::SessionLocked)
        }
    }

    async fn fail_closed_on<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::VaultUnavailable { .. }) = &result {
            self.guard.lock_with(LockReason::BackendUnreachable).await;
        }
        result
    }
}

impl<V: Vault> Drop for SessionController<V> {
    fn drop(&mut self) {
        if let Some(watch) = self.expiry_watch.get_mut().take() {
            watch.abort();
        }
    }
}

impl<V: Vault> std::fmt::Debug for SessionController<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("guard", &self.guard)
            .field("registry", &self.registry)
            .field("exporter", &self.exporter)
            .field("audit", &self.audit)
            .finish()
    }
}
