//! Declarative task filters.

use chrono::{DateTime, Utc};

use crate::task::{TaskRecord, TaskStatus};

/// Filter over the task table. Absent fields are omitted from the predicate,
/// present fields are ANDed together, and the status set is a disjunction.
/// Both time ranges are half-open: `[from, before)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub name: Option<String>,
    pub bucket_time_from: Option<DateTime<Utc>>,
    pub bucket_time_before: Option<DateTime<Utc>>,
    pub acquired_at_from: Option<DateTime<Utc>>,
    pub acquired_at_before: Option<DateTime<Utc>>,
    pub statuses: Vec<TaskStatus>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bucket_time_from(mut self, from: DateTime<Utc>) -> Self {
        self.bucket_time_from = Some(from);
        self
    }

    pub fn bucket_time_before(mut self, before: DateTime<Utc>) -> Self {
        self.bucket_time_before = Some(before);
        self
    }

    pub fn acquired_at_from(mut self, from: DateTime<Utc>) -> Self {
        self.acquired_at_from = Some(from);
        self
    }

    pub fn acquired_at_before(mut self, before: DateTime<Utc>) -> Self {
        self.acquired_at_before = Some(before);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        for status in statuses {
            self = self.status(status);
        }
        self
    }

    /// True when the query places no constraint at all.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.bucket_time_from.is_none()
            && self.bucket_time_before.is_none()
            && self.acquired_at_from.is_none()
            && self.acquired_at_before.is_none()
            && self.statuses.is_empty()
    }

    /// Evaluate the query against an in-memory record. This is the reference
    /// semantics the SQL compilation must agree with.
    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(name) = &self.name {
            if record.name != *name {
                return false;
            }
        }
        if let Some(from) = self.bucket_time_from {
            if record.bucket_time < from {
                return false;
            }
        }
        if let Some(before) = self.bucket_time_before {
            if record.bucket_time >= before {
                return false;
            }
        }
        if let Some(from) = self.acquired_at_from {
            match record.acquired_at {
                Some(at) if at >= from => {}
                _ => return false,
            }
        }
        if let Some(before) = self.acquired_at_before {
            match record.acquired_at {
                Some(at) if at < before => {}
                _ => return false,
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::BucketInterval;

    fn record(name: &str, bucket_time: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            name: name.to_string(),
            bucket_time: bucket_time.parse().unwrap(),
            bucket_interval: BucketInterval::of_minutes(5),
            status,
            created_by: Some("w1".to_string()),
            created_at: Utc::now(),
            acquired_by: None,
            acquired_at: None,
            completed_at: None,
            message: None,
            fail_count: 0,
        }
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let query = TaskQuery::new();
        assert!(query.is_empty());
        assert!(query.matches(&record("a", "2024-01-01T00:00:00Z", TaskStatus::Available)));
        assert!(query.matches(&record("b", "2024-01-01T00:00:00Z", TaskStatus::Skip)));
    }

    #[test]
    fn test_statuses_are_disjoined() {
        let query = TaskQuery::new().statuses([TaskStatus::Available, TaskStatus::Skip]);
        assert!(query.matches(&record("a", "2024-01-01T00:00:00Z", TaskStatus::Available)));
        assert!(query.matches(&record("a", "2024-01-01T00:00:00Z", TaskStatus::Skip)));
        assert!(!query.matches(&record("a", "2024-01-01T00:00:00Z", TaskStatus::Complete)));
    }

    #[test]
    fn test_bucket_range_is_half_open() {
        let query = TaskQuery::new()
            .bucket_time_from("2024-01-01T00:00:00Z".parse().unwrap())
            .bucket_time_before("2024-01-02T00:00:00Z".parse().unwrap());
        assert!(query.matches(&record("a", "2024-01-01T00:00:00Z", TaskStatus::Available)));
        assert!(query.matches(&record("a", "2024-01-01T23:59:59Z", TaskStatus::Available)));
        assert!(!query.matches(&record("a", "2024-01-02T00:00:00Z", TaskStatus::Available)));
        assert!(!query.matches(&record("a", "2023-12-31T23:59:59Z", TaskStatus::Available)));
    }

    #[test]
    fn test_conjunction_of_name_range_and_status() {
        let query = TaskQuery::new()
            .name("a")
            .bucket_time_from("2024-01-01T00:00:00Z".parse().unwrap())
            .status(TaskStatus::Available);
        assert!(query.matches(&record("a", "2024-01-05T00:00:00Z", TaskStatus::Available)));
        assert!(!query.matches(&record("b", "2024-01-05T00:00:00Z", TaskStatus::Available)));
        assert!(!query.matches(&record("a", "2024-01-05T00:00:00Z", TaskStatus::Acquired)));
    }

    #[test]
    fn test_acquired_at_range_excludes_unacquired_rows() {
        let query =
            TaskQuery::new().acquired_at_from("2024-01-01T00:00:00Z".parse().unwrap());
        let mut rec = record("a", "2024-01-01T00:00:00Z", TaskStatus::Acquired);
        assert!(!query.matches(&rec));
        rec.acquired_at = Some("2024-01-02T00:00:00Z".parse().unwrap());
        assert!(query.matches(&rec));
    }

    #[test]
    fn test_duplicate_statuses_collapse() {
        let query = TaskQuery::new()
            .status(TaskStatus::Available)
            .status(TaskStatus::Available);
        assert_eq!(query.statuses.len(), 1);
    }
}
