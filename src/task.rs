//! Task entity and status model.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::interval::BucketInterval;

/// Lifecycle state of a task.
///
/// ```text
/// AVAILABLE --> ACQUIRED --> (COMPLETE | SKIP)
///     /\            |
///     |             |  fail (fail_count + 1)
///     \-------------/
/// ```
///
/// `COMPLETE` and `SKIP` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Eligible for acquisition: freshly created, or returned after a failure.
    Available,
    /// Leased by a worker.
    Acquired,
    /// Finished without error; never processed again.
    Complete,
    /// Manually retired; never processed again.
    Skip,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Acquired => "ACQUIRED",
            Self::Complete => "COMPLETE",
            Self::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(Self::Available),
            "ACQUIRED" => Some(Self::Acquired),
            "COMPLETE" => Some(Self::Complete),
            "SKIP" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Skip)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a task. Uniqueness of `(name, bucket_time)` is
/// enforced by the store's primary key, not by application logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskKey {
    pub name: String,
    pub bucket_time: DateTime<Utc>,
}

impl TaskKey {
    pub fn new(name: impl Into<String>, bucket_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            bucket_time,
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.bucket_time.to_rfc3339())
    }
}

/// A persisted task row.
///
/// `acquired_by` and `acquired_at` describe the most recent acquisition
/// attempt and are not cleared when a task returns to `AVAILABLE`; treat them
/// as an audit trail, not as a liveness signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub bucket_time: DateTime<Utc>,
    pub bucket_interval: BucketInterval,
    pub status: TaskStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acquired_by: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Number of recorded failures. Never decreases.
    pub fail_count: i32,
}

impl TaskRecord {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.name.clone(), self.bucket_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Available,
            TaskStatus::Acquired,
            TaskStatus::Complete,
            TaskStatus::Skip,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Skip.is_terminal());
        assert!(!TaskStatus::Available.is_terminal());
        assert!(!TaskStatus::Acquired.is_terminal());
    }
}
