//! The vault boundary.
//!
//! The controller never encrypts, hashes or stores anything itself. Every
//! authoritative answer comes through [`Vault`], which the embedding
//! application implements on top of its crypto and storage services.

use std::future::Future;

use thiserror::Error;

use crate::error::Error;
use crate::types::{Plaintext, SecretId, SessionInfo, TimeoutMinutes};

/// Failures reported by a vault backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// The backend did not answer.
    #[error("backend unreachable: {reason}")]
    Unreachable {
        /// Transport or process failure.
        reason: String,
    },

    /// No secret exists with this identifier.
    #[error("secret not found: {id}")]
    SecretNotFound {
        /// The missing secret.
        id: String,
    },

    /// The ciphertext could not be decrypted.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// The underlying crypto failure.
        reason: String,
    },

    /// A setting could not be written.
    #[error("persistence failed: {reason}")]
    Persistence {
        /// The underlying storage failure.
        reason: String,
    },

    /// The backend refused the request on policy grounds.
    #[error("rejected: {reason}")]
    Rejected {
        /// The policy that was violated.
        reason: String,
    },
}

impl VaultError {
    /// Returns true if the backend could not be reached at all.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Maps a failure while fetching a secret into a controller error.
    pub(crate) fn into_reveal_error(self, id: &SecretId) -> Error {
        match self {
            Self::Unreachable { reason } => Error::VaultUnavailable { reason },
            other => Error::Decryption {
                id: id.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Maps a failure during unlock or session reads into a controller error.
    pub(crate) fn into_session_error(self) -> Error {
        match self {
            Self::Rejected { reason } => Error::Authentication { reason },
            other => Error::VaultUnavailable {
                reason: other.to_string(),
            },
        }
    }

    /// Maps a failure while saving a setting into a controller error.
    pub(crate) fn into_persistence_error(self) -> Error {
        match self {
            Self::Unreachable { reason } => Error::VaultUnavailable { reason },
            other => Error::Persistence {
                reason: other.to_string(),
            },
        }
    }
}

/// The external vault the controller consumes.
///
/// Implementations own key derivation, password verification, encryption and
/// settings storage. All methods may suspend.
pub trait Vault: Send + Sync + 'static {
    /// Whether no master password has been set yet.
    fn is_first_run(&self) -> impl Future<Output = Result<bool, VaultError>> + Send;

    /// Verify (or, on first run, set) the master password and open a session.
    ///
    /// Returns `Ok(false)` for a wrong password.
    fn unlock(&self, password: &str) -> impl Future<Output = Result<bool, VaultError>> + Send;

    /// Close the backend session. Always succeeds locally.
    fn lock(&self) -> impl Future<Output = ()> + Send;

    /// The backend's authoritative session state.
    fn session_info(&self) -> impl Future<Output = Result<SessionInfo, VaultError>> + Send;

    /// Decrypt one secret.
    fn reveal_secret(
        &self,
        id: &SecretId,
    ) -> impl Future<Output = Result<Plaintext, VaultError>> + Send;

    /// Persist a new session timeout.
    fn update_timeout(
        &self,
        minutes: TimeoutMinutes,
    ) -> impl Future<Output = Result<(), VaultError>> + Send;

    /// Read the persisted session timeout, which may be out of range.
    fn load_timeout_minutes(&self) -> impl Future<Output = Result<u32, VaultError>> + Send;
}
