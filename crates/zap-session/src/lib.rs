//! # Zap Session
//!
//! Session lifecycle and secret-exposure control for the Zap password vault:
//!
//! - **Drift-corrected auto-lock**: a 1s local countdown reconciled every 5s
//!   against the vault's own remaining time
//! - **Fail closed**: a vault that stops answering or reports itself locked
//!   ends the session
//! - **Timed reveal**: a revealed secret hides itself after 30s, and at most
//!   one hide timer exists per secret
//! - **Race-free hiding**: a hide, edit, delete or lock issued while a decrypt
//!   is in flight always wins
//! - **Audit logging**: every unlock, lock, reveal, hide and copy is recorded
//!
//! The controller never encrypts or stores anything itself. It drives an
//! implementation of [`Vault`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zap_session::{ControllerConfig, MemoryClipboard, MemoryVault, SecretId, SessionController};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> zap_session::Result<()> {
//! let vault = Arc::new(
//!     MemoryVault::new()
//!         .with_password("correct horse")
//!         .with_secret("github", "hunter2"),
//! );
//! let controller = SessionController::create(
//!     vault,
//!     Arc::new(MemoryClipboard::new("system")),
//!     Arc::new(MemoryClipboard::new("fallback")),
//!     ControllerConfig::default(),
//! )?;
//!
//! controller.unlock("correct horse", None).await?;
//! let id = SecretId::new("github")?;
//! controller.reveal(&id).await?;
//! assert!(controller.revealed_value(&id).is_some());
//!
//! controller.lock().await;
//! assert!(controller.revealed_value(&id).is_none());
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Considerations
//!
//! - Decrypted values are held in [`Plaintext`], which zeroizes on drop and
//!   redacts its `Debug` output
//! - Passwords are passed through, never stored
//! - Logs and audit entries never contain plaintext

pub mod audit;
pub mod clipboard;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod guard;
pub mod memory;
pub mod registry;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{
    ExposureState, LockReason, Plaintext, SecretId, SessionInfo, SessionState, SetupMode,
    TimeoutMinutes,
};

pub use config::ControllerConfig;

pub use vault::{Vault, VaultError};

pub use memory::MemoryVault;

pub use clock::{ClockEvent, ClockTiming, Countdown, ExpiryCause, SessionClock};

pub use guard::{LockListener, SessionEvent, SessionGuard};

pub use registry::{ExposureRegistry, HideReason, RevealOutcome};

pub use clipboard::{ClipboardExporter, ClipboardWriteError, ClipboardWriter, MemoryClipboard};

pub use controller::SessionController;

pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
