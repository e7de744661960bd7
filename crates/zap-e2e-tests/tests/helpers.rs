//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use zap_session::{
    ClipboardWriter, ControllerConfig, MemoryClipboard, MemoryVault, SecretId, SessionController,
    SessionEvent,
};

/// Master password used by every returning-user vault.
pub const PASSWORD: &str = "correct horse battery";

/// Default wait for session events.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parse a secret identifier.
pub fn secret(id: &str) -> SecretId {
    SecretId::new(id).expect("valid secret id")
}

/// A controller wired to an in-memory vault and clipboards.
pub struct TestVault {
    pub vault: Arc<MemoryVault>,
    pub clipboard: Arc<MemoryClipboard>,
    pub fallback: Arc<MemoryClipboard>,
    pub controller: SessionController<MemoryVault>,
}

impl TestVault {
    /// A returning-user vault holding three secrets with a 5 minute timeout.
    pub fn start() -> Self {
        Self::with_vault(
            MemoryVault::new()
                .with_password(PASSWORD)
                .with_secret("github", "gh-token-1")
                .with_secret("email", "mail-pass-1")
                .with_secret("bank", "bank-pin-1"),
        )
    }

    /// Wrap a prepared vault with the default configuration.
    pub fn with_vault(vault: MemoryVault) -> Self {
        Self::with_config(vault, ControllerConfig::default())
    }

    /// Wrap a prepared vault with a custom configuration.
    pub fn with_config(vault: MemoryVault, config: ControllerConfig) -> Self {
        init_tracing();

        let vault = Arc::new(vault);
        let clipboard = Arc::new(MemoryClipboard::new("system"));
        let fallback = Arc::new(MemoryClipboard::new("fallback"));
        let controller = SessionController::create(
            Arc::clone(&vault),
            Arc::clone(&clipboard) as Arc<dyn ClipboardWriter>,
            Arc::clone(&fallback) as Arc<dyn ClipboardWriter>,
            config,
        )
        .expect("valid config");

        Self {
            vault,
            clipboard,
            fallback,
            controller,
        }
    }

    /// Unlock with the shared password.
    pub async fn unlock(&self) {
        self.controller
            .unlock(PASSWORD, None)
            .await
            .expect("unlock should succeed");
    }
}

/// Wait for the next session event.
pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timeout waiting for session event")
        .expect("event channel closed")
}

/// Advance paused time by `millis`.
pub async fn advance_ms(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
