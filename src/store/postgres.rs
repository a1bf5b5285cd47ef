//! PostgreSQL-backed task store.
//!
//! The coordination mechanism is the database itself:
//!
//! - creation races resolve through the `(name, bucket_time)` primary key,
//! - single-row acquisition uses `FOR UPDATE NOWAIT` (fail fast),
//! - backlog scans use `FOR UPDATE SKIP LOCKED LIMIT 1` (losers never wait),
//! - and a lease *is* its open transaction: the row lock is held from
//!   `acquire` until the resolving call commits, or until the connection dies.
//!
//! There is no heartbeat or expiry. A worker that crashes while holding a
//! lease leaves the row locked until the server reclaims the dead connection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::{is_lock_unavailable, is_unique_violation, TaskError, TaskResult};
use crate::interval::BucketInterval;
use crate::query::TaskQuery;
use crate::store::sql::SqlBuilder;
use crate::store::{TaskLease, TaskStore};
use crate::task::{TaskKey, TaskRecord, TaskStatus};

const DEFAULT_POOL_SIZE: u32 = 10;

/// Task store over a PostgreSQL connection pool.
///
/// Cloning is cheap and every clone shares the pool. Each operation checks a
/// connection out of the pool for itself, so concurrent callers never share a
/// transaction.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    sql: Arc<SqlBuilder>,
}

impl PgTaskStore {
    /// Wrap an existing pool, using the default `tasks` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sql: Arc::new(SqlBuilder::default()),
        }
    }

    /// Wrap an existing pool with a custom table name and identifier length.
    pub fn with_table(pool: PgPool, table: &str, id_len: u16) -> TaskResult<Self> {
        Ok(Self {
            pool,
            sql: Arc::new(SqlBuilder::new(table, id_len)?),
        })
    }

    /// Connect with the default pool size.
    pub async fn connect(database_url: &str) -> TaskResult<Self> {
        Self::connect_with_pool_size(database_url, DEFAULT_POOL_SIZE).await
    }

    /// Connect with a custom pool size.
    ///
    /// The pool must be large enough for the number of leases held at once:
    /// every acquired lease pins one connection until it resolves.
    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> TaskResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the task table if it does not exist.
    pub async fn ensure_schema(&self) -> TaskResult<()> {
        sqlx::query(&self.sql.create_table())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    type Lease = PgTaskLease;

    async fn create_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
        bucket_interval: BucketInterval,
        created_by: &str,
    ) -> TaskResult<TaskRecord> {
        let created_at = Utc::now();
        let result = sqlx::query(&self.sql.insert_task())
            .bind(name)
            .bind(bucket_time)
            .bind(PgInterval::from(bucket_interval))
            .bind(TaskStatus::Available.as_str())
            .bind(created_by)
            .bind(created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(TaskRecord {
                name: name.to_string(),
                bucket_time,
                bucket_interval,
                status: TaskStatus::Available,
                created_by: Some(created_by.to_string()),
                created_at,
                acquired_by: None,
                acquired_at: None,
                completed_at: None,
                message: None,
                fail_count: 0,
            }),
            Err(err) if is_unique_violation(&err) => Err(TaskError::Duplicate {
                name: name.to_string(),
                bucket_time,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
    ) -> TaskResult<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(&self.sql.select_task())
            .bind(name)
            .bind(bucket_time)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn get_tasks(&self, query: &TaskQuery) -> TaskResult<Vec<TaskRecord>> {
        let mut qb = self.sql.select_by_query(query);
        let rows = qb
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn get_and_acquire_first_task(
        &self,
        query: &TaskQuery,
    ) -> TaskResult<Option<PgTaskLease>> {
        let mut tx = self.pool.begin().await?;
        let mut qb = self.sql.select_first_for_acquire(query);
        let row = qb
            .build_query_as::<TaskRow>()
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            None => {
                tx.rollback().await?;
                Ok(None)
            }
            Some(row) => {
                let record = TaskRecord::try_from(row)?;
                Ok(Some(PgTaskLease {
                    pool: self.pool.clone(),
                    sql: Arc::clone(&self.sql),
                    record,
                    tx: Some(tx),
                }))
            }
        }
    }

    async fn set_task_status(
        &self,
        keys: &[TaskKey],
        status: TaskStatus,
        actor: &str,
    ) -> TaskResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let mut lock = self.sql.lock_keys_nowait(keys);
        let locked = match lock.build().fetch_all(&mut *tx).await {
            Ok(rows) => rows.len(),
            Err(err) if is_lock_unavailable(&err) => {
                tx.rollback().await.ok();
                return Err(TaskError::PartialLock {
                    requested: keys.len(),
                    locked: 0,
                });
            }
            Err(err) => return Err(err.into()),
        };
        if locked != keys.len() {
            tx.rollback().await.ok();
            return Err(TaskError::PartialLock {
                requested: keys.len(),
                locked,
            });
        }

        let now = Utc::now();
        let mut update = self.sql.update_status_for_keys(keys, status, actor, now);
        update.build().execute(&mut *tx).await?;
        tx.commit().await?;
        debug!(rows = keys.len(), status = %status, actor, "bulk status update committed");
        Ok(())
    }

    fn lease(&self, record: TaskRecord) -> PgTaskLease {
        PgTaskLease {
            pool: self.pool.clone(),
            sql: Arc::clone(&self.sql),
            record,
            tx: None,
        }
    }
}

/// A lease over one task row, backed by an open PostgreSQL transaction.
///
/// The transaction (and so the row lock) is held from a successful `acquire`
/// until one of the consuming calls commits it. Dropping an unresolved lease
/// rolls the transaction back when its connection returns to the pool, so an
/// early return or panic in the holder's code cannot leak the lock.
pub struct PgTaskLease {
    pool: PgPool,
    sql: Arc<SqlBuilder>,
    record: TaskRecord,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTaskLease {
    fn take_tx(&mut self, op: &str) -> TaskResult<Transaction<'static, Postgres>> {
        self.tx.take().ok_or_else(|| {
            TaskError::InvalidState(format!("lease must be acquired before {op}"))
        })
    }
}

#[async_trait]
impl TaskLease for PgTaskLease {
    fn record(&self) -> &TaskRecord {
        &self.record
    }

    fn is_acquired(&self) -> bool {
        self.tx.is_some()
    }

    async fn acquire(&mut self, acquired_by: &str) -> TaskResult<()> {
        if self.tx.is_some() {
            return Err(TaskError::InvalidState(
                "attempt to re-acquire a lease that is already held".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TaskRow>(&self.sql.select_for_update_nowait())
            .bind(self.record.name.as_str())
            .bind(self.record.bucket_time)
            .fetch_optional(&mut *tx)
            .await;

        let row = match row {
            Ok(row) => row,
            Err(err) if is_lock_unavailable(&err) => {
                return Err(TaskError::LockUnavailable {
                    name: self.record.name.clone(),
                    bucket_time: self.record.bucket_time,
                });
            }
            Err(err) => return Err(err.into()),
        };
        let Some(row) = row else {
            return Err(TaskError::NotFound {
                name: self.record.name.clone(),
                bucket_time: self.record.bucket_time,
            });
        };

        let current = TaskRecord::try_from(row)?;
        if current.status != TaskStatus::Available {
            return Err(TaskError::InvalidState(format!(
                "task {} is {}, not {}",
                current.key(),
                current.status,
                TaskStatus::Available
            )));
        }

        let now = Utc::now();
        sqlx::query(&self.sql.update_acquired())
            .bind(TaskStatus::Acquired.as_str())
            .bind(acquired_by)
            .bind(now)
            .bind(self.record.name.as_str())
            .bind(self.record.bucket_time)
            .execute(&mut *tx)
            .await?;

        self.record = TaskRecord {
            status: TaskStatus::Acquired,
            acquired_by: Some(acquired_by.to_string()),
            acquired_at: Some(now),
            ..current
        };
        self.tx = Some(tx);
        Ok(())
    }

    async fn complete(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        let mut tx = self.take_tx("complete")?;
        let now = Utc::now();
        sqlx::query(&self.sql.update_completed())
            .bind(TaskStatus::Complete.as_str())
            .bind(now)
            .bind(message)
            .bind(self.record.name.as_str())
            .bind(self.record.bucket_time)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // local state changes only after a successful commit
        self.record.status = TaskStatus::Complete;
        self.record.completed_at = Some(now);
        self.record.message = message.map(str::to_string);
        Ok(self.record)
    }

    async fn fail(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        let mut tx = self.take_tx("fail")?;
        sqlx::query(&self.sql.update_failed())
            .bind(TaskStatus::Available.as_str())
            .bind(message)
            .bind(self.record.name.as_str())
            .bind(self.record.bucket_time)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.record.status = TaskStatus::Available;
        self.record.fail_count += 1;
        self.record.message = message.map(str::to_string);
        Ok(self.record)
    }

    async fn skip(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        let mut tx = self.take_tx("skip")?;
        sqlx::query(&self.sql.update_status_message())
            .bind(TaskStatus::Skip.as_str())
            .bind(message)
            .bind(self.record.name.as_str())
            .bind(self.record.bucket_time)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.record.status = TaskStatus::Skip;
        self.record.message = message.map(str::to_string);
        Ok(self.record)
    }

    async fn release(mut self) -> TaskResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    name: String,
    bucket_time: DateTime<Utc>,
    bucket_interval: PgInterval,
    status: String,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    acquired_by: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    message: Option<String>,
    fail_count: i32,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> TaskResult<TaskRecord> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            TaskError::Db(sqlx::Error::Decode(
                format!("unrecognized task status {:?}", row.status).into(),
            ))
        })?;
        Ok(TaskRecord {
            name: row.name,
            bucket_time: row.bucket_time,
            bucket_interval: row.bucket_interval.into(),
            status,
            created_by: row.created_by,
            created_at: row.created_at,
            acquired_by: row.acquired_by,
            acquired_at: row.acquired_at,
            completed_at: row.completed_at,
            message: row.message,
            fail_count: row.fail_count,
        })
    }
}
