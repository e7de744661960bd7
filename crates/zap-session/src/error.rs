//! Error types for the session controller.

use thiserror::Error;

/// Errors surfaced by the session controller to its caller.
///
/// Every message is meant to be shown to a user as-is. Timer and
/// cancellation races are expected control flow and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// The password was rejected or the confirmation did not match.
    #[error("authentication failed: {reason}")]
    Authentication {
        /// Why authentication failed.
        reason: String,
    },

    /// Input was rejected before any vault call was made.
    #[error("invalid input: {reason}")]
    Validation {
        /// What was wrong with the input.
        reason: String,
    },

    /// The vault backend could not be reached.
    #[error("vault unavailable: {reason}")]
    VaultUnavailable {
        /// The underlying backend failure.
        reason: String,
    },

    /// A secret could not be decrypted for display or copy.
    #[error("could not decrypt secret {id} - try again ({reason})")]
    Decryption {
        /// The secret that failed to decrypt.
        id: String,
        /// The underlying failure.
        reason: String,
    },

    /// Writing to the clipboard failed on both the primary and fallback path.
    #[error("could not copy to clipboard: {reason}")]
    Clipboard {
        /// The last clipboard failure.
        reason: String,
    },

    /// A setting could not be persisted by the vault.
    #[error("could not save setting: {reason}")]
    Persistence {
        /// The underlying persistence failure.
        reason: String,
    },

    /// The operation needs an unlocked session.
    #[error("vault is locked - unlock it first")]
    SessionLocked,

    /// Invalid secret identifier.
    #[error("invalid secret id: {reason}")]
    InvalidSecretId {
        /// The reason the identifier is invalid.
        reason: String,
    },

    /// Invalid controller configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// The reason the configuration is invalid.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a validation failure.
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for an authentication failure.
    pub(crate) fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Returns true if the session was lost as part of this failure.
    ///
    /// Only backend loss ends a session; decrypt and clipboard failures stay
    /// local to their operation.
    #[must_use]
    pub const fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::VaultUnavailable { .. } | Self::SessionLocked)
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_human_readable() {
        let err = Error::authentication("incorrect password");
        assert_eq!(err.to_string(), "authentication failed: incorrect password");

        let err = Error::Decryption {
            id: "s1".to_string(),
            reason: "tag mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not decrypt secret s1 - try again (tag mismatch)"
        );

        assert_eq!(
            Error::SessionLocked.to_string(),
            "vault is locked - unlock it first"
        );
    }

    #[test]
    fn only_backend_loss_is_fatal() {
        assert!(Error::VaultUnavailable {
            reason: "gone".into()
        }
        .is_fatal_to_session());
        assert!(Error::SessionLocked.is_fatal_to_session());
        assert!(!Error::Clipboard {
            reason: "busy".into()
        }
        .is_fatal_to_session());
        assert!(!Error::validation("too short").is_fatal_to_session());
    }
}
