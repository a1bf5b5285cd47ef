//! Error taxonomy.
//!
//! Every failure surfaces synchronously and typed; nothing here retries. The
//! two "expected" variants are [`TaskError::Duplicate`] (lose the creation
//! race, look up the existing row) and [`TaskError::LockUnavailable`] (row
//! held elsewhere, retry later or move on). The worker protocol is the only
//! layer that absorbs one of these instead of propagating it.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::bucket::BucketError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// A row with the same `(name, bucket_time)` already exists. Raised by the
    /// store's uniqueness constraint, which is the race-resolution mechanism
    /// for concurrent creation.
    #[error("task {name} at bucket {bucket_time} already exists")]
    Duplicate {
        name: String,
        bucket_time: DateTime<Utc>,
    },

    /// The row is exclusively locked by another live transaction.
    #[error("task {name} at bucket {bucket_time} is locked by another session")]
    LockUnavailable {
        name: String,
        bucket_time: DateTime<Utc>,
    },

    /// No row with this identity exists.
    #[error("task {name} at bucket {bucket_time} does not exist")]
    NotFound {
        name: String,
        bucket_time: DateTime<Utc>,
    },

    /// A lifecycle call that the lease's current state does not permit:
    /// double-acquire, resolving an unacquired lease, or acquiring a task in a
    /// terminal status. Programmer error, not retried.
    #[error("invalid lease state: {0}")]
    InvalidState(String),

    /// A bulk status update could not immediately lock every requested row.
    /// The whole batch was rolled back; no row changed.
    #[error("locked only {locked} of {requested} rows; batch aborted with no changes")]
    PartialLock { requested: usize, locked: usize },

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Bucket(#[from] BucketError),

    /// Connectivity or any other store-side failure, surfaced as-is.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// PostgreSQL SQLSTATE for a unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL SQLSTATE raised by `FOR UPDATE NOWAIT` on a contended row.
const LOCK_NOT_AVAILABLE: &str = "55P03";

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, UNIQUE_VIOLATION)
}

pub(crate) fn is_lock_unavailable(err: &sqlx::Error) -> bool {
    has_sqlstate(err, LOCK_NOT_AVAILABLE)
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(code),
        _ => false,
    }
}
