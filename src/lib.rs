//! Distributed coordination for recurring tasks, built on a relational
//! store's row locks.
//!
//! Time is cut into buckets of a fixed [`BucketInterval`]; each `(name,
//! bucket_time)` pair is one task row, and the store's primary key plus
//! `FOR UPDATE` row locks guarantee at most one worker owns a task at a time.
//! There are no heartbeats and no expiry timers: a lease is an open
//! transaction, so a crashed worker's lock disappears when its connection
//! does, and the task is immediately available again.
//!
//! ```no_run
//! use tidelock::{BucketInterval, PgTaskStore, TaskWorker, WorkOutcome};
//!
//! # async fn run() -> Result<(), tidelock::TaskError> {
//! let store = PgTaskStore::connect("postgres://localhost/app").await?;
//! store.ensure_schema().await?;
//!
//! let worker = TaskWorker::new(store, "worker-1", "hourly-report", BucketInterval::of_hours(1))?;
//! match worker.run_once(|task| async move {
//!     // at most one worker in the fleet gets here per bucket
//!     Ok::<_, std::io::Error>(format!("report for {}", task.bucket_time))
//! })
//! .await?
//! {
//!     WorkOutcome::Completed { .. } | WorkOutcome::Failed { .. } => {}
//!     WorkOutcome::Idle => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod error;
pub mod interval;
pub mod query;
pub mod store;
pub mod task;
pub mod worker;

pub use bucket::{align, align_to_epoch, bucket_bounds, BucketError};
pub use error::{TaskError, TaskResult};
pub use interval::{BucketInterval, ParseIntervalError};
pub use query::TaskQuery;
pub use store::memory::{MemoryTaskLease, MemoryTaskStore};
pub use store::postgres::{PgTaskLease, PgTaskStore};
pub use store::{create_tasks_in_range, TaskLease, TaskStore};
pub use task::{TaskKey, TaskRecord, TaskStatus};
pub use worker::{TaskWorker, WorkOutcome};
