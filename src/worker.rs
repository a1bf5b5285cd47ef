//! Worker protocol: find-or-create-and-acquire.
//!
//! A [`TaskWorker`] ties a task name and bucket interval to a store and turns
//! "give me something to do" into the full protocol: scan the backlog with a
//! skip-locked query, fall back to creating the current bucket's task, and
//! acquire it. Losing a creation race or finding every row locked is a normal
//! idle outcome here, never an error.

use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use crate::bucket::{align_to_epoch, BucketError};
use crate::error::{TaskError, TaskResult};
use crate::interval::BucketInterval;
use crate::query::TaskQuery;
use crate::store::{TaskLease, TaskStore};
use crate::task::{TaskRecord, TaskStatus};

/// Result of one pass over the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A task was acquired and the handler succeeded.
    Completed { message: String },
    /// A task was acquired and the handler failed; the task is back in
    /// `AVAILABLE` for the next attempt.
    Failed { message: String },
    /// Nothing to do: the current bucket is already resolved or every
    /// candidate row is held by another worker.
    Idle,
}

/// One worker's view of a recurring task.
///
/// Cloneable and cheap; each protocol pass runs independently, so any number
/// of workers (in one process or many) can poll the same task name and the
/// store guarantees each bucket is handed to at most one of them.
#[derive(Debug, Clone)]
pub struct TaskWorker<S> {
    store: S,
    worker_name: String,
    task_name: String,
    bucket_interval: BucketInterval,
    backlog_window: TimeDelta,
}

impl<S: TaskStore> TaskWorker<S> {
    pub fn new(
        store: S,
        worker_name: impl Into<String>,
        task_name: impl Into<String>,
        bucket_interval: BucketInterval,
    ) -> TaskResult<Self> {
        if !bucket_interval.is_positive() {
            return Err(TaskError::Bucket(BucketError::NonPositiveInterval));
        }
        Ok(Self {
            store,
            worker_name: worker_name.into(),
            task_name: task_name.into(),
            bucket_interval,
            backlog_window: TimeDelta::zero(),
        })
    }

    /// How far behind the current bucket the backlog scan reaches. Zero (the
    /// default) restricts the worker to the current bucket only.
    pub fn backlog_window(mut self, window: TimeDelta) -> Self {
        self.backlog_window = window;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Find an available task for this worker and acquire it, creating the
    /// current bucket's task if it does not exist yet. Returns `None` when
    /// there is nothing for this worker to do right now.
    pub async fn find_or_create_and_acquire(&self) -> TaskResult<Option<S::Lease>> {
        self.find_or_create_and_acquire_at(Utc::now()).await
    }

    async fn find_or_create_and_acquire_at(
        &self,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<S::Lease>> {
        let bucket_time = align_to_epoch(now, &self.bucket_interval)?;
        let window_start = bucket_time
            .checked_sub_signed(self.backlog_window)
            .ok_or(BucketError::Overflow)?;
        let window_end = self
            .bucket_interval
            .add_to(bucket_time)
            .ok_or(BucketError::Overflow)?;

        // Backlog first: earliest unheld AVAILABLE bucket in the window,
        // current bucket included.
        let backlog = TaskQuery::new()
            .name(&self.task_name)
            .status(TaskStatus::Available)
            .bucket_time_from(window_start)
            .bucket_time_before(window_end);
        if let Some(lease) = self.store.get_and_acquire_first_task(&backlog).await? {
            debug!(
                task = %lease.record().key(),
                worker = %self.worker_name,
                "acquired task from backlog scan"
            );
            return Ok(Some(lease));
        }

        // Nothing scannable; make sure the current bucket's task exists.
        match self
            .store
            .create_task(
                &self.task_name,
                bucket_time,
                self.bucket_interval,
                &self.worker_name,
            )
            .await
        {
            Ok(record) => {
                info!(task = %record.key(), worker = %self.worker_name, "created task");
            }
            Err(TaskError::Duplicate { .. }) => {}
            Err(err) => return Err(err),
        }

        let Some(record) = self.store.get_task(&self.task_name, bucket_time).await? else {
            return Ok(None);
        };
        if record.status != TaskStatus::Available {
            debug!(task = %record.key(), status = %record.status, "task not available");
            return Ok(None);
        }

        let mut lease = self.store.lease(record);
        match lease.acquire(&self.worker_name).await {
            Ok(()) => {
                debug!(
                    task = %lease.record().key(),
                    worker = %self.worker_name,
                    "acquired task"
                );
                Ok(Some(lease))
            }
            // Held elsewhere, or resolved between our read and the lock.
            Err(TaskError::LockUnavailable { .. } | TaskError::InvalidState(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Run `handler` under an acquired lease and resolve it from the result:
    /// `Ok` completes the task, `Err` records a retryable failure.
    pub async fn process<F, Fut, E>(&self, lease: S::Lease, handler: F) -> TaskResult<WorkOutcome>
    where
        F: FnOnce(TaskRecord) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        if !lease.is_acquired() {
            return Err(TaskError::InvalidState(
                "process requires an acquired lease".to_string(),
            ));
        }
        let key = lease.record().key();
        match handler(lease.record().clone()).await {
            Ok(message) => {
                lease.complete(Some(&message)).await?;
                info!(task = %key, worker = %self.worker_name, "task completed");
                Ok(WorkOutcome::Completed { message })
            }
            Err(err) => {
                let message = err.to_string();
                let record = lease.fail(Some(&message)).await?;
                info!(
                    task = %key,
                    worker = %self.worker_name,
                    fail_count = record.fail_count,
                    error = %message,
                    "task failed"
                );
                Ok(WorkOutcome::Failed { message })
            }
        }
    }

    /// One full protocol pass: acquire and process, or report [`WorkOutcome::Idle`].
    pub async fn run_once<F, Fut, E>(&self, handler: F) -> TaskResult<WorkOutcome>
    where
        F: FnOnce(TaskRecord) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        match self.find_or_create_and_acquire().await? {
            Some(lease) => self.process(lease, handler).await,
            None => Ok(WorkOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryTaskStore;

    const FIVE_MINUTES: BucketInterval = BucketInterval::of_minutes(5);

    fn utc(text: &str) -> DateTime<Utc> {
        text.parse().expect("valid timestamp")
    }

    fn worker(store: &MemoryTaskStore, name: &str) -> TaskWorker<MemoryTaskStore> {
        TaskWorker::new(store.clone(), name, "report", FIVE_MINUTES).unwrap()
    }

    async fn ok_handler(_: TaskRecord) -> Result<String, std::convert::Infallible> {
        Ok("done".to_string())
    }

    #[tokio::test]
    async fn test_rejects_non_positive_interval() {
        let store = MemoryTaskStore::new();
        let err =
            TaskWorker::new(store, "w1", "report", BucketInterval::new(0, 0, 0)).unwrap_err();
        assert!(matches!(err, TaskError::Bucket(_)));
    }

    #[tokio::test]
    async fn test_creates_and_completes_current_bucket() {
        let store = MemoryTaskStore::new();
        let w = worker(&store, "w1");
        let now = utc("2024-06-01T10:03:21Z");

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T10:00:00Z"));
        assert_eq!(lease.record().created_by.as_deref(), Some("w1"));

        let outcome = w.process(lease, ok_handler).await.unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::Completed {
                message: "done".to_string()
            }
        );
        let stored = store
            .get_task("report", utc("2024-06-01T10:00:00Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
        assert_eq!(stored.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_resolved_bucket_is_idle() {
        let store = MemoryTaskStore::new();
        let w = worker(&store, "w1");
        let now = utc("2024-06-01T10:03:21Z");

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        w.process(lease, ok_handler).await.unwrap();

        // later in the same bucket: nothing to do
        let later = utc("2024-06-01T10:04:59Z");
        assert!(w.find_or_create_and_acquire_at(later).await.unwrap().is_none());

        // next bucket gets a fresh task
        let next = utc("2024-06-01T10:05:00Z");
        let lease = w.find_or_create_and_acquire_at(next).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T10:05:00Z"));
    }

    #[tokio::test]
    async fn test_held_bucket_is_idle_for_other_workers() {
        let store = MemoryTaskStore::new();
        let now = utc("2024-06-01T10:03:21Z");

        let w1 = worker(&store, "w1");
        let held = w1.find_or_create_and_acquire_at(now).await.unwrap().unwrap();

        let w2 = worker(&store, "w2");
        assert!(w2.find_or_create_and_acquire_at(now).await.unwrap().is_none());

        // w1 releasing without resolving puts the bucket back in play
        held.release().await.unwrap();
        let lease = w2.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().acquired_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_in_same_bucket() {
        let store = MemoryTaskStore::new();
        let w = worker(&store, "w1");
        let now = utc("2024-06-01T10:03:21Z");

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        let outcome = w
            .process(lease, |_| async { Err::<String, _>("boom") })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::Failed {
                message: "boom".to_string()
            }
        );

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().fail_count, 1);
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T10:00:00Z"));
        w.process(lease, ok_handler).await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_scan_picks_earliest_available_bucket() {
        let store = MemoryTaskStore::new();
        store
            .create_task("report", utc("2024-06-01T09:50:00Z"), FIVE_MINUTES, "seed")
            .await
            .unwrap();
        store
            .create_task("report", utc("2024-06-01T09:55:00Z"), FIVE_MINUTES, "seed")
            .await
            .unwrap();

        let w = worker(&store, "w1").backlog_window(TimeDelta::hours(1));
        let now = utc("2024-06-01T10:03:21Z");

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T09:50:00Z"));
        lease.complete(None).await.unwrap();

        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T09:55:00Z"));
        lease.complete(None).await.unwrap();

        // backlog drained: falls through to creating the current bucket
        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_zero_backlog_window_ignores_older_buckets() {
        let store = MemoryTaskStore::new();
        store
            .create_task("report", utc("2024-06-01T09:55:00Z"), FIVE_MINUTES, "seed")
            .await
            .unwrap();

        let w = worker(&store, "w1");
        let now = utc("2024-06-01T10:03:21Z");
        let lease = w.find_or_create_and_acquire_at(now).await.unwrap().unwrap();
        assert_eq!(lease.record().bucket_time, utc("2024-06-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_process_rejects_unacquired_lease() {
        let store = MemoryTaskStore::new();
        let record = store
            .create_task("report", utc("2024-06-01T10:00:00Z"), FIVE_MINUTES, "seed")
            .await
            .unwrap();
        let w = worker(&store, "w1");
        let err = w
            .process(store.lease(record), ok_handler)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_run_once_is_idle_when_bucket_resolved() {
        let store = MemoryTaskStore::new();
        let w = worker(&store, "w1");
        // first pass does real work, second is idle within the same bucket
        let first = w.run_once(ok_handler).await.unwrap();
        assert!(matches!(first, WorkOutcome::Completed { .. }));
        let second = w.run_once(ok_handler).await.unwrap();
        assert_eq!(second, WorkOutcome::Idle);
    }
}
