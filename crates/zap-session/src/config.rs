//! Controller configuration.
//!
//! The defaults are the production timings: a 1s local tick, a 5s resync
//! against the vault, a 2s drift tolerance and a 30s exposure ceiling.
//! Embedders normally keep them; tests and tools may load overrides from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Interval of the local countdown decrement.
    pub tick_interval: Duration,
    /// Interval between authoritative resyncs against the vault.
    pub resync_interval: Duration,
    /// Largest predicted-vs-backend difference, in seconds, left uncorrected.
    pub drift_tolerance_secs: u64,
    /// How long a revealed secret stays visible.
    pub auto_hide_after: Duration,
    /// Minimum master password length on first-run setup.
    pub min_password_length: usize,
    /// Maximum number of audit entries kept in memory.
    pub audit_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            resync_interval: Duration::from_secs(5),
            drift_tolerance_secs: 2,
            auto_hide_after: Duration::from_secs(30),
            min_password_length: 8,
            audit_capacity: 1000,
        }
    }
}

/// On-disk representation; every field is optional and falls back to the default.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    tick_interval_ms: Option<u64>,
    resync_interval_secs: Option<u64>,
    drift_tolerance_secs: Option<u64>,
    auto_hide_secs: Option<u64>,
    min_password_length: Option<usize>,
    audit_capacity: Option<usize>,
}

impl ControllerConfig {
    /// Set the local tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the resync interval.
    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the drift tolerance in seconds.
    #[must_use]
    pub const fn with_drift_tolerance_secs(mut self, secs: u64) -> Self {
        self.drift_tolerance_secs = secs;
        self
    }

    /// Set the exposure ceiling for revealed secrets.
    #[must_use]
    pub const fn with_auto_hide_after(mut self, after: Duration) -> Self {
        self.auto_hide_after = after;
        self
    }

    /// Set the first-run minimum password length.
    #[must_use]
    pub const fn with_min_password_length(mut self, len: usize) -> Self {
        self.min_password_length = len;
        self
    }

    /// Set the audit log capacity.
    #[must_use]
    pub const fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ),
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or a value fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(content).map_err(|e| Error::Config {
            reason: format!("invalid JSON: {e}"),
        })?;

        let defaults = Self::default();
        let config = Self {
            tick_interval: file
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            resync_interval: file
                .resync_interval_secs
                .map_or(defaults.resync_interval, Duration::from_secs),
            drift_tolerance_secs: file
                .drift_tolerance_secs
                .unwrap_or(defaults.drift_tolerance_secs),
            auto_hide_after: file
                .auto_hide_secs
                .map_or(defaults.auto_hide_after, Duration::from_secs),
            min_password_length: file
                .min_password_length
                .unwrap_or(defaults.min_password_length),
            audit_capacity: file.audit_capacity.unwrap_or(defaults.audit_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any interval is zero or a limit is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(config_error("tick interval cannot be zero"));
        }

        if self.resync_interval.is_zero() {
            return Err(config_error("resync interval cannot be zero"));
        }

        if self.resync_interval < self.tick_interval {
            return Err(config_error(
                "resync interval cannot be shorter than the tick interval",
            ));
        }

        if self.auto_hide_after.is_zero() {
            return Err(config_error("auto-hide delay cannot be zero"));
        }

        if self.min_password_length == 0 {
            return Err(config_error("minimum password length cannot be zero"));
        }

        if self.audit_capacity == 0 {
            return Err(config_error("audit capacity cannot be zero"));
        }

        Ok(())
    }
}

fn config_error(reason: &str) -> Error {
    Error::Config {
        reason: reason.to_string(),
    }
}
