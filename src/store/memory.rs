//! In-memory task store.
//!
//! Emulates the store's locking primitives with per-row lock flags behind a
//! mutex, mirroring the row-lock semantics without requiring a database:
//! acquisition bookkeeping stays local to the lease ("uncommitted") until a
//! resolving call writes it back, and dropping an unresolved lease releases
//! its lock. Intended for tests and local development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{TaskError, TaskResult};
use crate::interval::BucketInterval;
use crate::query::TaskQuery;
use crate::store::{TaskLease, TaskStore};
use crate::task::{TaskKey, TaskRecord, TaskStatus};

type RowKey = (String, DateTime<Utc>);

#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    // BTreeMap keeps scans in (name, bucket_time) order.
    rows: BTreeMap<RowKey, MemoryRow>,
}

#[derive(Debug)]
struct MemoryRow {
    record: TaskRecord,
    locked: bool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self, key: &RowKey) {
        if let Some(row) = self.state().rows.get_mut(key) {
            row.locked = false;
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    type Lease = MemoryTaskLease;

    async fn create_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
        bucket_interval: BucketInterval,
        created_by: &str,
    ) -> TaskResult<TaskRecord> {
        let mut state = self.state();
        let key = (name.to_string(), bucket_time);
        if state.rows.contains_key(&key) {
            return Err(TaskError::Duplicate {
                name: name.to_string(),
                bucket_time,
            });
        }
        let record = TaskRecord {
            name: name.to_string(),
            bucket_time,
            bucket_interval,
            status: TaskStatus::Available,
            created_by: Some(created_by.to_string()),
            created_at: Utc::now(),
            acquired_by: None,
            acquired_at: None,
            completed_at: None,
            message: None,
            fail_count: 0,
        };
        state.rows.insert(
            key,
            MemoryRow {
                record: record.clone(),
                locked: false,
            },
        );
        Ok(record)
    }

    async fn get_task(
        &self,
        name: &str,
        bucket_time: DateTime<Utc>,
    ) -> TaskResult<Option<TaskRecord>> {
        let state = self.state();
        Ok(state
            .rows
            .get(&(name.to_string(), bucket_time))
            .map(|row| row.record.clone()))
    }

    async fn get_tasks(&self, query: &TaskQuery) -> TaskResult<Vec<TaskRecord>> {
        let state = self.state();
        Ok(state
            .rows
            .values()
            .filter(|row| query.matches(&row.record))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn get_and_acquire_first_task(
        &self,
        query: &TaskQuery,
    ) -> TaskResult<Option<MemoryTaskLease>> {
        let mut state = self.state();
        let found = state
            .rows
            .iter_mut()
            .find(|(_, row)| !row.locked && query.matches(&row.record));
        match found {
            None => Ok(None),
            Some((_, row)) => {
                row.locked = true;
                Ok(Some(MemoryTaskLease {
                    store: self.clone(),
                    record: row.record.clone(),
                    held: true,
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
        let mut state = self.state();
        let lockable = keys
            .iter()
            .filter(|key| {
                state
                    .rows
                    .get(&(key.name.clone(), key.bucket_time))
                    .is_some_and(|row| !row.locked)
            })
            .count();
        if lockable != keys.len() {
            return Err(TaskError::PartialLock {
                requested: keys.len(),
                locked: lockable,
            });
        }

        let now = Utc::now();
        for key in keys {
            if let Some(row) = state.rows.get_mut(&(key.name.clone(), key.bucket_time)) {
                row.record.status = status;
                match status {
                    TaskStatus::Acquired => {
                        row.record.acquired_by = Some(actor.to_string());
                        row.record.acquired_at = Some(now);
                    }
                    TaskStatus::Complete => {
                        row.record.completed_at = Some(now);
                    }
                    TaskStatus::Available | TaskStatus::Skip => {}
                }
            }
        }
        Ok(())
    }

    fn lease(&self, record: TaskRecord) -> MemoryTaskLease {
        MemoryTaskLease {
            store: self.clone(),
            record,
            held: false,
        }
    }
}

/// Lease over one in-memory row, holding its lock flag.
pub struct MemoryTaskLease {
    store: MemoryTaskStore,
    record: TaskRecord,
    held: bool,
}

impl MemoryTaskLease {
    fn key(&self) -> RowKey {
        (self.record.name.clone(), self.record.bucket_time)
    }

    fn ensure_held(&self, op: &str) -> TaskResult<()> {
        if self.held {
            Ok(())
        } else {
            Err(TaskError::InvalidState(format!(
                "lease must be acquired before {op}"
            )))
        }
    }
}

#[async_trait]
impl TaskLease for MemoryTaskLease {
    fn record(&self) -> &TaskRecord {
        &self.record
    }

    fn is_acquired(&self) -> bool {
        self.held
    }

    async fn acquire(&mut self, acquired_by: &str) -> TaskResult<()> {
        if self.held {
            return Err(TaskError::InvalidState(
                "attempt to re-acquire a lease that is already held".to_string(),
            ));
        }
        let key = self.key();
        let mut state = self.store.state();
        let Some(row) = state.rows.get_mut(&key) else {
            return Err(TaskError::NotFound {
                name: self.record.name.clone(),
                bucket_time: self.record.bucket_time,
            });
        };
        if row.locked {
            return Err(TaskError::LockUnavailable {
                name: self.record.name.clone(),
                bucket_time: self.record.bucket_time,
            });
        }
        if row.record.status != TaskStatus::Available {
            return Err(TaskError::InvalidState(format!(
                "task {} is {}, not {}",
                row.record.key(),
                row.record.status,
                TaskStatus::Available
            )));
        }
        row.locked = true;
        // pending state stays on the lease until a resolving call writes back
        self.record = TaskRecord {
            status: TaskStatus::Acquired,
            acquired_by: Some(acquired_by.to_string()),
            acquired_at: Some(Utc::now()),
            ..row.record.clone()
        };
        self.held = true;
        Ok(())
    }

    async fn complete(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        self.ensure_held("complete")?;
        let key = self.key();
        self.record.status = TaskStatus::Complete;
        self.record.completed_at = Some(Utc::now());
        self.record.message = message.map(str::to_string);
        {
            let mut state = self.store.state();
            if let Some(row) = state.rows.get_mut(&key) {
                row.record = self.record.clone();
                row.locked = false;
            }
        }
        self.held = false;
        Ok(self.record.clone())
    }

    async fn fail(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        self.ensure_held("fail")?;
        let key = self.key();
        self.record.status = TaskStatus::Available;
        self.record.fail_count += 1;
        self.record.message = message.map(str::to_string);
        {
            let mut state = self.store.state();
            if let Some(row) = state.rows.get_mut(&key) {
                row.record = self.record.clone();
                row.locked = false;
            }
        }
        self.held = false;
        Ok(self.record.clone())
    }

    async fn skip(mut self, message: Option<&str>) -> TaskResult<TaskRecord> {
        self.ensure_held("skip")?;
        let key = self.key();
        self.record.status = TaskStatus::Skip;
        self.record.message = message.map(str::to_string);
        {
            let mut state = self.store.state();
            if let Some(row) = state.rows.get_mut(&key) {
                row.record = self.record.clone();
                row.locked = false;
            }
        }
        self.held = false;
        Ok(self.record.clone())
    }

    async fn release(mut self) -> TaskResult<()> {
        if self.held {
            self.store.unlock(&self.key());
            self.held = false;
        }
        Ok(())
    }
}

impl Drop for MemoryTaskLease {
    fn drop(&mut self) {
        if self.held {
            self.store.unlock(&self.key());
        }
    }
}
