//! Core types shared by the clock, guard and exposure registry.
//!
//! - [`SecretId`]: a validated identifier for a secret
//! - [`Plaintext`]: a decrypted value that zeroizes on drop
//! - [`TimeoutMinutes`]: the session timeout, always within [5, 60]
//! - [`SessionInfo`]: the backend's authoritative view of the session

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// A validated identifier for a secret.
///
/// Secret IDs must:
/// - Be between 1 and 128 characters
/// - Contain no whitespace or control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretId(String);

impl SecretId {
    /// Maximum length of a secret identifier.
    pub const MAX_LENGTH: usize = 128;

    /// Creates a new `SecretId` after validating the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, too long, or contains
    /// whitespace or control characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidSecretId {
                reason: "identifier cannot be empty".to_string(),
            });
        }

        if id.chars().count() > Self::MAX_LENGTH {
            return Err(Error::InvalidSecretId {
                reason: format!(
                    "identifier exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = id.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidSecretId {
                reason: format!("identifier contains invalid character {c:?}"),
            });
        }

        Ok(())
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SecretId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SecretId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SecretId> for String {
    fn from(id: SecretId) -> Self {
        id.0
    }
}

impl AsRef<str> for SecretId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A decrypted secret value.
///
/// The backing memory is zeroized when the value is dropped, and the value
/// never appears in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Plaintext {
    value: String,
}

impl Plaintext {
    /// Wraps a decrypted value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Returns the decrypted value.
    ///
    /// Callers must not keep copies of the returned slice beyond their
    /// immediate use.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Length of the value in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns true if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plaintext")
            .field("len", &self.value.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for Plaintext {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.value.as_bytes().ct_eq(other.value.as_bytes()).into()
    }
}

impl Eq for Plaintext {}

/// Session timeout in minutes, always within `[MIN, MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TimeoutMinutes(u32);

impl TimeoutMinutes {
    /// Shortest allowed session timeout.
    pub const MIN: u32 = 5;
    /// Longest allowed session timeout.
    pub const MAX: u32 = 60;
    /// Timeout used when no valid setting is stored.
    pub const DEFAULT: Self = Self(Self::MIN);

    /// Validates a timeout value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `minutes` is outside `[5, 60]`.
    pub fn new(minutes: u32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&minutes) {
            Ok(Self(minutes))
        } else {
            Err(Error::validation(format!(
                "session timeout must be between {} and {} minutes, got {minutes}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Saturates any stored value into the allowed range.
    #[must_use]
    pub fn clamped(minutes: u32) -> Self {
        Self(minutes.clamp(Self::MIN, Self::MAX))
    }

    /// The timeout in minutes.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The timeout in seconds.
    #[must_use]
    pub fn as_secs(self) -> u64 {
        u64::from(self.0) * 60
    }
}

impl Default for TimeoutMinutes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for TimeoutMinutes {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TimeoutMinutes> for u32 {
    fn from(value: TimeoutMinutes) -> Self {
        value.0
    }
}

impl fmt::Display for TimeoutMinutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} min", self.0)
    }
}

/// The backend's authoritative view of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Whether the backend considers the vault locked.
    pub is_locked: bool,
    /// Seconds until the backend locks the vault on its own.
    pub time_left_seconds: u64,
}

impl SessionInfo {
    /// Info for a locked backend.
    #[must_use]
    pub const fn locked() -> Self {
        Self {
            is_locked: true,
            time_left_seconds: 0,
        }
    }

    /// Info for an unlocked backend with the given remaining time.
    #[must_use]
    pub const fn unlocked(time_left_seconds: u64) -> Self {
        Self {
            is_locked: false,
            time_left_seconds,
        }
    }
}

/// Whether the controller considers the vault unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; no plaintext may exist.
    Locked,
    /// A session is alive and counting down.
    Unlocked,
}

impl SessionState {
    /// Returns true if unlocked.
    #[must_use]
    pub const fn is_unlocked(self) -> bool {
        matches!(self, Self::Unlocked)
    }
}

/// Whether the vault still needs its master password set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupMode {
    /// `initialize` has not been called yet.
    Unknown,
    /// No master password exists; the first unlock sets it.
    FirstRun,
    /// A master password exists and must be verified.
    Returning,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    /// The user asked for it.
    User,
    /// The local countdown reached zero.
    Expired,
    /// A resync found the backend already locked.
    BackendLocked,
    /// The backend stopped answering (fail closed).
    BackendUnreachable,
    /// The controller was shut down.
    Disposed,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Expired => write!(f, "expired"),
            Self::BackendLocked => write!(f, "backend_locked"),
            Self::BackendUnreachable => write!(f, "backend_unreachable"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Per-secret exposure state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureState {
    /// No plaintext exists.
    Hidden,
    /// A decrypt call is in flight.
    Decrypting,
    /// Plaintext is held and an auto-hide is pending.
    Revealed,
}
