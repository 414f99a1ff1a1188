//! Progress entries: the append-only operation activity feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::OperationKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    InProgress,
    Completed,
    Failed,
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One entry of the operation progress feed. Entries are append-only within
/// an operation; the last entry is authoritative for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub account_id: String,
    pub site_domain: String,
    pub operation_id: String,
    pub created: DateTime<Utc>,
    /// Per-producer tiebreaker so no two entries compare equal. Assigned by
    /// the backend on insert.
    #[serde(default)]
    pub sequence: i64,
    /// Percent complete, 0..=100.
    pub completion: u8,
    pub state: ProgressState,
    pub message: String,
}

impl ProgressEntry {
    pub fn new(key: &OperationKey, completion: u8, message: impl Into<String>) -> Self {
        Self {
            account_id: key.account_id.clone(),
            site_domain: key.site_domain.clone(),
            operation_id: key.operation_id.clone(),
            created: Utc::now(),
            sequence: 0,
            completion: completion.min(100),
            state: ProgressState::InProgress,
            message: message.into(),
        }
    }

    pub fn completed(key: &OperationKey, message: impl Into<String>) -> Self {
        let mut entry = Self::new(key, 100, message);
        entry.state = ProgressState::Completed;
        entry
    }

    pub fn failed(key: &OperationKey, completion: u8, message: impl Into<String>) -> Self {
        let mut entry = Self::new(key, completion, message);
        entry.state = ProgressState::Failed;
        entry
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            site_domain: self.site_domain.clone(),
            operation_id: self.operation_id.clone(),
        }
    }

    /// Two entries are duplicates when they would render identically; the
    /// engine drops those instead of appending.
    pub fn same_as(&self, other: &ProgressEntry) -> bool {
        self.completion == other.completion
            && self.state == other.state
            && self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OperationKey {
        OperationKey {
            account_id: "acc".into(),
            site_domain: "example.com".into(),
            operation_id: "op-1".into(),
        }
    }

    #[test]
    fn completion_is_clamped() {
        let entry = ProgressEntry::new(&key(), 150, "overflow");
        assert_eq!(entry.completion, 100);
    }

    #[test]
    fn completed_entry_is_terminal() {
        let entry = ProgressEntry::completed(&key(), "done");
        assert!(entry.state.is_terminal());
        assert_eq!(entry.completion, 100);
    }

    #[test]
    fn duplicate_detection_ignores_timestamps() {
        let a = ProgressEntry::new(&key(), 10, "pulling packages");
        let mut b = ProgressEntry::new(&key(), 10, "pulling packages");
        b.created = a.created + chrono::Duration::seconds(5);
        assert!(a.same_as(&b));

        let c = ProgressEntry::new(&key(), 11, "pulling packages");
        assert!(!a.same_as(&c));
    }
}
