//! Audit trail for session and exposure events.
//!
//! Every unlock, lock, reveal, hide and copy is recorded with a timestamp.
//! Entries never contain plaintext or passwords. The log is bounded; the
//! oldest entries are evicted first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::SecretId;

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A session was opened.
    Unlocked,
    /// An unlock attempt was rejected.
    UnlockFailed,
    /// A session was closed.
    Locked,
    /// A secret became visible.
    Revealed,
    /// A decrypt for display failed.
    RevealFailed,
    /// A visible secret was hidden.
    Hidden,
    /// A secret was written to the clipboard.
    Copied,
    /// A clipboard export failed.
    CopyFailed,
    /// The session timeout setting changed.
    TimeoutUpdated,
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub action: AuditAction,
    /// The secret involved, if any.
    pub secret_id: Option<SecretId>,
    /// Free-form context such as a lock reason.
    pub detail: String,
}

impl AuditEntry {
    /// Creates an entry for a session-level event.
    #[must_use]
    pub fn session(action: AuditAction, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            secret_id: None,
            detail: detail.into(),
        }
    }

    /// Creates an entry for an event on one secret.
    #[must_use]
    pub fn secret(action: AuditAction, secret_id: &SecretId, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            secret_id: Some(secret_id.clone()),
            detail: detail.into(),
        }
    }
}

/// Which entries [`AuditLog::query`] returns. An empty filter returns all.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only entries about this secret.
    pub secret_id: Option<SecretId>,
    /// Only these actions; empty means any.
    pub actions: Vec<AuditAction>,
    /// Only entries recorded at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// At most this many entries.
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// A filter matching every entry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one secret.
    #[must_use]
    pub fn for_secret(mut self, secret_id: SecretId) -> Self {
        self.secret_id = Some(secret_id);
        self
    }

    /// Also accept `action`. Repeatable.
    #[must_use]
    pub fn with_action(mut self, action: AuditAction) -> Self {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
        self
    }

    /// Restrict to entries recorded at or after `time`.
    #[must_use]
    pub fn since(mut self, time: DateTime<Utc>) -> Self {
        self.since = Some(time);
        self
    }

    /// Cap the number of returned entries.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        let secret_ok = self
            .secret_id
            .as_ref()
            .is_none_or(|id| entry.secret_id.as_ref() == Some(id));
        let action_ok = self.actions.is_empty() || self.actions.contains(&entry.action);
        let time_ok = self.since.is_none_or(|since| entry.timestamp >= since);
        secret_ok && action_ok && time_ok
    }
}

/// A bounded in-memory audit log.
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    /// Creates an empty log keeping at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Records an entry, evicting the oldest if full.
    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Queries the log, newest first.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Returns the number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries_count", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
