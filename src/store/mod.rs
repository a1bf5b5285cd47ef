//! Task storage.
//!
//! The [`TaskStore`] and [`TaskLease`] traits are the narrow seam between the
//! lifecycle protocol and the backing store. A conforming store needs exactly
//! three locking primitives:
//!
//! 1. lock one identified row, failing immediately if it is held elsewhere;
//! 2. lock the first unlocked row matching a predicate, skipping held rows,
//!    capped at one result;
//! 3. lock a named set of rows in one transaction, aborting entirely if any
//!    one of them is held.
//!
//! [`postgres::PgTaskStore`] maps these onto `FOR UPDATE NOWAIT`,
//! `FOR UPDATE SKIP LOCKED ... LIMIT 1`, and a NOWAIT batch select.
//! [`memory::MemoryTaskStore`] emulates them with in-process lock flags for
//! tests and local development.

pub mod memory;
pub mod postgres;
mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bucket::BucketError;
use crate::error::{TaskError, TaskResult};
use crate::interval::BucketInterval;
use crate::query::TaskQuery;
use crate::task::{TaskKey, TaskRecord, TaskStatus};

/// Creation, lookup, bulk update, and lease acquisition over one task table.
///
/// Implementations hold no mutable shared state beyond configuration and are
/// safe for concurrent use; each operation runs on its own connection or
/// transaction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    type Lease: TaskLease;

    /// Insert a new task in state `AVAILABLE`.
    ///
    /// There is deliberately no existence pre-check: under concurrent creation
    /// exactly one caller succeeds and the rest get [`TaskError::Duplicate`]
    /// from the uniqueness constraint, which a check-then-insert sequence
    /// could never guarantee.
    async fn create_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
        bucket_interval: BucketInterval,
        created_by: &str,
    ) -> TaskResult<TaskRecord>;

    /// Committed read of one task, no lock taken.
    async fn get_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
    ) -> TaskResult<Option<TaskRecord>>;

    /// Committed read of every task matching `query`, ordered by
    /// `(name, bucket_time)` for determinism.
    async fn get_tasks(&self, query: &TaskQuery) -> TaskResult<Vec<TaskRecord>>;

    /// Lock and return the first matching row, silently skipping rows locked
    /// by other live transactions. `None` means nothing is available to this
    /// caller right now; it is not an error.
    ///
    /// The returned lease is already acquired and holds the open transaction.
    async fn get_and_acquire_first_task(&self, query: &TaskQuery)
        -> TaskResult<Option<Self::Lease>>;

    /// Administrative bulk re-triage: move every row in `keys` to `status`
    /// within a single transaction. If any row cannot be locked immediately
    /// the whole batch fails with [`TaskError::PartialLock`] and nothing
    /// changes. Acquisition bookkeeping is stamped with `actor` when the new
    /// status is `ACQUIRED`.
    async fn set_task_status(
        &self,
        keys: &[TaskKey],
        status: TaskStatus,
        actor: &str,
    ) -> TaskResult<()>;

    /// Wrap an already-fetched record in an unacquired lease handle.
    fn lease(&self, record: TaskRecord) -> Self::Lease;
}

/// Exclusive, transactionally-backed ownership of one task row.
///
/// State machine per instance: unacquired → acquired → resolved, one-shot.
/// The resolving calls consume the lease, so a resolved lease cannot be
/// touched again by construction. Dropping an unresolved lease releases the
/// underlying lock on every exit path, including panics and early returns.
#[async_trait]
pub trait TaskLease: Send {
    /// This lease's local view of the row, including uncommitted acquisition
    /// bookkeeping while the lease is held.
    fn record(&self) -> &TaskRecord;

    /// Whether this instance currently holds the row lock. A local flag,
    /// never a fresh query.
    fn is_acquired(&self) -> bool;

    /// Take an immediate exclusive lock on the row, failing fast with
    /// [`TaskError::LockUnavailable`] if another transaction holds it. On
    /// success the transaction stays open across subsequent calls with
    /// `status = ACQUIRED` and the bookkeeping applied but not yet committed.
    ///
    /// Acquiring an already-acquired lease or a task in a terminal status is
    /// [`TaskError::InvalidState`].
    async fn acquire(&mut self, acquired_by: &str) -> TaskResult<()>;

    /// Mark the task `COMPLETE`, commit, and release. Terminal.
    async fn complete(self, message: Option<&str>) -> TaskResult<TaskRecord>;

    /// Record a retryable failure: the task returns to `AVAILABLE` with
    /// `fail_count` incremented by one, immediately eligible for
    /// re-acquisition by any worker.
    async fn fail(self, message: Option<&str>) -> TaskResult<TaskRecord>;

    /// Mark the task `SKIP`, commit, and release. Terminal.
    async fn skip(self, message: Option<&str>) -> TaskResult<TaskRecord>;

    /// Release the lock without changing the row.
    async fn release(self) -> TaskResult<()>;
}

/// Create `count` consecutive buckets starting at `first_bucket`, swallowing
/// duplicates so the call is idempotent over an existing backlog. Returns only
/// the tasks that were actually created.
pub async fn create_tasks_in_range<S: TaskStore>(
    store: &S,
    name: &str,
    first_bucket: DateTime<Utc>,
    bucket_interval: BucketInterval,
    count: u32,
    created_by: &str,
) -> TaskResult<Vec<TaskRecord>> {
    let mut created = Vec::new();
    let mut bucket_time = first_bucket;
    for _ in 0..count {
        match store
            .create_task(name, bucket_time, bucket_interval, created_by)
            .await
        {
            Ok(record) => created.push(record),
            Err(TaskError::Duplicate { .. }) => {}
            Err(err) => return Err(err),
        }
        bucket_time = bucket_interval
            .add_to(bucket_time)
            .ok_or(BucketError::Overflow)?;
    }
    Ok(created)
}
