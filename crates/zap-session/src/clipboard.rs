//! Clipboard export.
//!
//! Copying decrypts the secret independently of its on-screen exposure, hands
//! the plaintext to a [`ClipboardWriter`] and drops it immediately. A copy
//! never reveals a hidden secret and never touches a visible one's timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::error::{Error, Result};
use crate::types::SecretId;
use crate::vault::Vault;

/// A clipboard write failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ClipboardWriteError {
    /// Why the write failed.
    pub reason: String,
}

impl ClipboardWriteError {
    /// Creates a new error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A system clipboard backend.
pub trait ClipboardWriter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Replaces the clipboard contents with `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform clipboard rejects the write.
    fn write_text(&self, text: &str) -> std::result::Result<(), ClipboardWriteError>;
}

/// A clipboard held in process memory.
#[derive(Debug)]
pub struct MemoryClipboard {
    name: String,
    contents: Mutex<Option<Zeroizing<String>>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryClipboard {
    /// Creates an empty clipboard.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: Mutex::new(None),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// A copy of the current contents.
    #[must_use]
    pub fn contents(&self) -> Option<String> {
        self.contents.lock().as_ref().map(|c| c.as_str().to_string())
    }

    /// Number of successful writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Empties the clipboard.
    pub fn clear(&self) {
        *self.contents.lock() = None;
    }
}

impl ClipboardWriter for MemoryClipboard {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_text(&self, text: &str) -> std::result::Result<(), ClipboardWriteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClipboardWriteError::new("clipboard is unavailable"));
        }
        *self.contents.lock() = Some(Zeroizing::new(text.to_string()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes secrets to the clipboard, retrying once on a fallback writer.
pub struct ClipboardExporter<V: Vault> {
    vault: Arc<V>,
    primary: Arc<dyn ClipboardWriter>,
    fallback: Option<Arc<dyn ClipboardWriter>>,
    audit: Arc<AuditLog>,
}

impl<V: Vault> ClipboardExporter<V> {
    /// Creates an exporter with no fallback.
    #[must_use]
    pub fn new(vault: Arc<V>, primary: Arc<dyn ClipboardWriter>, audit: Arc<AuditLog>) -> Self {
        Self {
            vault,
            primary,
            fallback: None,
            audit,
        }
    }

    /// Sets the writer tried when the primary fails.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn ClipboardWriter>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Decrypts `id` and writes it to the clipboard.
    ///
    /// # Errors
    ///
    /// - [`Error::Decryption`] or [`Error::VaultUnavailable`] if the vault
    ///   fails; nothing is written
    /// - [`Error::Clipboard`] if every writer fails
    pub async fn copy(&self, id: &SecretId) -> Result<()> {
        let plaintext = match self.vault.reveal_secret(id).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(secret_id = %id, error = %e, "failed to decrypt secret for copy");
                self.audit
                    .record(AuditEntry::secret(AuditAction::CopyFailed, id, e.to_string()));
                return Err(e.into_reveal_error(id));
            }
        };

        let written = self.write(plaintext.expose());
        drop(plaintext);

        match written {
            Ok(writer) => {
                info!(secret_id = %id, writer = %writer, "secret copied to clipboard");
                self.audit
                    .record(AuditEntry::secret(AuditAction::Copied, id, writer));
                Ok(())
            }
            Err(e) => {
                warn!(secret_id = %id, error = %e, "clipboard write failed");
                self.audit
                    .record(AuditEntry::secret(AuditAction::CopyFailed, id, e.to_string()));
                Err(Error::Clipboard { reason: e.reason })
            }
        }
    }

    fn write(&self, text: &str) -> std::result::Result<String, ClipboardWriteError> {
        let primary_err = match self.primary.write_text(text) {
            Ok(()) => return Ok(self.primary.name().to_string()),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };
        warn!(
            writer = self.primary.name(),
            error = %primary_err,
            "primary clipboard failed, trying fallback"
        );
        fallback.write_text(text)?;
        Ok(fallback.name().to_string())
    }
}

impl<V: Vault> std::fmt::Debug for ClipboardExporter<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardExporter")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|w| w.name().to_string()))
            .finish_non_exhaustive()
    }
}
