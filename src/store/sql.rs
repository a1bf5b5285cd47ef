//! SQL statement construction for the task table.
//!
//! The table name is configurable, so it is validated once here and then
//! interpolated; every caller-supplied value goes through bound parameters,
//! never through string concatenation.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use crate::error::{TaskError, TaskResult};
use crate::query::TaskQuery;
use crate::task::{TaskKey, TaskStatus};

const ALL_COLUMNS: &str = "name, bucket_time, bucket_interval, status, created_by, created_at, \
     acquired_by, acquired_at, completed_at, message, fail_count";

pub(crate) const DEFAULT_TABLE: &str = "tasks";
pub(crate) const DEFAULT_ID_LEN: u16 = 32;

#[derive(Debug, Clone)]
pub(crate) struct SqlBuilder {
    table: String,
    id_len: u16,
}

impl Default for SqlBuilder {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            id_len: DEFAULT_ID_LEN,
        }
    }
}

impl SqlBuilder {
    pub(crate) fn new(table: &str, id_len: u16) -> TaskResult<Self> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(TaskError::Config(format!(
                "table name must consist of characters from [a-zA-Z0-9_.] but was {table:?}"
            )));
        }
        if id_len == 0 || id_len > 255 {
            return Err(TaskError::Config(format!(
                "identifier length must be in 1..=255 but was {id_len}"
            )));
        }
        Ok(Self {
            table: table.to_string(),
            id_len,
        })
    }

    pub(crate) fn create_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             name VARCHAR({id}) NOT NULL, \
             bucket_time TIMESTAMPTZ NOT NULL, \
             bucket_interval INTERVAL NOT NULL, \
             status VARCHAR(16) NOT NULL, \
             created_by VARCHAR({id}), \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             acquired_by VARCHAR({id}), \
             acquired_at TIMESTAMPTZ, \
             completed_at TIMESTAMPTZ, \
             message TEXT, \
             fail_count INTEGER NOT NULL DEFAULT 0, \
             PRIMARY KEY (name, bucket_time))",
            table = self.table,
            id = self.id_len,
        )
    }

    pub(crate) fn insert_task(&self) -> String {
        format!(
            "INSERT INTO {} (name, bucket_time, bucket_interval, status, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        )
    }

    pub(crate) fn select_task(&self) -> String {
        format!(
            "SELECT {ALL_COLUMNS} FROM {} WHERE name = $1 AND bucket_time = $2",
            self.table
        )
    }

    pub(crate) fn select_for_update_nowait(&self) -> String {
        format!(
            "SELECT {ALL_COLUMNS} FROM {} WHERE name = $1 AND bucket_time = $2 FOR UPDATE NOWAIT",
            self.table
        )
    }

    pub(crate) fn update_acquired(&self) -> String {
        format!(
            "UPDATE {} SET status = $1, acquired_by = $2, acquired_at = $3 \
             WHERE name = $4 AND bucket_time = $5",
            self.table
        )
    }

    pub(crate) fn update_completed(&self) -> String {
        format!(
            "UPDATE {} SET status = $1, completed_at = $2, message = $3 \
             WHERE name = $4 AND bucket_time = $5",
            self.table
        )
    }

    pub(crate) fn update_failed(&self) -> String {
        format!(
            "UPDATE {} SET status = $1, fail_count = fail_count + 1, message = $2 \
             WHERE name = $3 AND bucket_time = $4",
            self.table
        )
    }

    pub(crate) fn update_status_message(&self) -> String {
        format!(
            "UPDATE {} SET status = $1, message = $2 WHERE name = $3 AND bucket_time = $4",
            self.table
        )
    }

    /// Committed read of everything matching `query`, in `(name, bucket_time)`
    /// order.
    pub(crate) fn select_by_query<'q>(&self, query: &'q TaskQuery) -> QueryBuilder<'q, Postgres> {
        let mut qb = QueryBuilder::new(format!("SELECT {ALL_COLUMNS} FROM {}", self.table));
        push_where(&mut qb, query);
        qb.push(" ORDER BY name, bucket_time");
        qb
    }

    /// Skip-locked scan: lock the first matching row that nobody else holds.
    pub(crate) fn select_first_for_acquire<'q>(
        &self,
        query: &'q TaskQuery,
    ) -> QueryBuilder<'q, Postgres> {
        let mut qb = self.select_by_query(query);
        qb.push(" FOR UPDATE SKIP LOCKED LIMIT 1");
        qb
    }

    /// Fail-fast batch lock over an explicit key set.
    pub(crate) fn lock_keys_nowait<'q>(&self, keys: &'q [TaskKey]) -> QueryBuilder<'q, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT name, bucket_time FROM {} WHERE (name, bucket_time) IN (",
            self.table
        ));
        push_key_tuples(&mut qb, keys);
        qb.push(") FOR UPDATE NOWAIT");
        qb
    }

    /// Move every row in `keys` to `status`, stamping acquisition bookkeeping
    /// for `ACQUIRED` and the completion time for `COMPLETE`.
    pub(crate) fn update_status_for_keys<'q>(
        &self,
        keys: &'q [TaskKey],
        status: TaskStatus,
        actor: &'q str,
        now: DateTime<Utc>,
    ) -> QueryBuilder<'q, Postgres> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET status = ", self.table));
        qb.push_bind(status.as_str());
        match status {
            TaskStatus::Acquired => {
                qb.push(", acquired_by = ").push_bind(actor);
                qb.push(", acquired_at = ").push_bind(now);
            }
            TaskStatus::Complete => {
                qb.push(", completed_at = ").push_bind(now);
            }
            TaskStatus::Available | TaskStatus::Skip => {}
        }
        qb.push(" WHERE (name, bucket_time) IN (");
        push_key_tuples(&mut qb, keys);
        qb.push(")");
        qb
    }
}

fn push_where<'q>(qb: &mut QueryBuilder<'q, Postgres>, query: &'q TaskQuery) {
    let mut has_predicate = false;
    if let Some(name) = query.name.as_deref() {
        push_separator(qb, &mut has_predicate);
        qb.push("name = ").push_bind(name);
    }
    if let Some(from) = query.bucket_time_from {
        push_separator(qb, &mut has_predicate);
        qb.push("bucket_time >= ").push_bind(from);
    }
    if let Some(before) = query.bucket_time_before {
        push_separator(qb, &mut has_predicate);
        qb.push("bucket_time < ").push_bind(before);
    }
    if let Some(from) = query.acquired_at_from {
        push_separator(qb, &mut has_predicate);
        qb.push("acquired_at >= ").push_bind(from);
    }
    if let Some(before) = query.acquired_at_before {
        push_separator(qb, &mut has_predicate);
        qb.push("acquired_at < ").push_bind(before);
    }
    if !query.statuses.is_empty() {
        push_separator(qb, &mut has_predicate);
        qb.push("status IN (");
        let mut sep = qb.separated(", ");
        for status in &query.statuses {
            sep.push_bind(status.as_str());
        }
        qb.push(")");
    }
}

fn push_separator(qb: &mut QueryBuilder<'_, Postgres>, has_predicate: &mut bool) {
    if *has_predicate {
        qb.push(" AND ");
    } else {
        qb.push(" WHERE ");
        *has_predicate = true;
    }
}

fn push_key_tuples<'q>(qb: &mut QueryBuilder<'q, Postgres>, keys: &'q [TaskKey]) {
    let mut sep = qb.separated(", ");
    for key in keys {
        sep.push("(");
        sep.push_bind_unseparated(key.name.as_str());
        sep.push_unseparated(", ");
        sep.push_bind_unseparated(key.bucket_time);
        sep.push_unseparated(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn builder() -> SqlBuilder {
        SqlBuilder::new(DEFAULT_TABLE, DEFAULT_ID_LEN).unwrap()
    }

    #[test]
    fn test_table_name_validation() {
        assert!(SqlBuilder::new("tasks", 32).is_ok());
        assert!(SqlBuilder::new("myschema.tasks", 32).is_ok());
        assert!(SqlBuilder::new("", 32).is_err());
        assert!(SqlBuilder::new("tasks; DROP TABLE tasks", 32).is_err());
        assert!(SqlBuilder::new("tasks'--", 32).is_err());
    }

    #[test]
    fn test_id_length_validation() {
        assert!(SqlBuilder::new("tasks", 0).is_err());
        assert!(SqlBuilder::new("tasks", 256).is_err());
        assert!(SqlBuilder::new("tasks", 255).is_ok());
    }

    #[test]
    fn test_query_predicates_use_bound_parameters() {
        let now = Utc::now();
        let query = TaskQuery::new()
            .name("ingest")
            .bucket_time_from(now)
            .bucket_time_before(now)
            .statuses([TaskStatus::Available, TaskStatus::Skip]);
        let qb = builder().select_by_query(&query);
        let sql = qb.sql();
        assert!(
            sql.ends_with(
                "WHERE name = $1 AND bucket_time >= $2 AND bucket_time < $3 \
                 AND status IN ($4, $5) ORDER BY name, bucket_time"
            ),
            "{sql}"
        );
        assert!(!sql.contains("ingest"), "literal leaked into SQL: {sql}");
    }

    #[test]
    fn test_empty_query_has_no_where_clause() {
        let query = TaskQuery::new();
        let qb = builder().select_by_query(&query);
        assert_eq!(
            qb.sql(),
            format!("SELECT {ALL_COLUMNS} FROM tasks ORDER BY name, bucket_time")
        );
    }

    #[test]
    fn test_acquire_scan_is_skip_locked_and_capped() {
        let query = TaskQuery::new().status(TaskStatus::Available);
        let qb = builder().select_first_for_acquire(&query);
        assert!(
            qb.sql()
                .ends_with("ORDER BY name, bucket_time FOR UPDATE SKIP LOCKED LIMIT 1"),
            "{}",
            qb.sql()
        );
    }

    #[test]
    fn test_lock_keys_nowait() {
        let now = Utc::now();
        let keys = vec![TaskKey::new("a", now), TaskKey::new("b", now)];
        let qb = builder().lock_keys_nowait(&keys);
        assert_eq!(
            qb.sql(),
            "SELECT name, bucket_time FROM tasks \
             WHERE (name, bucket_time) IN (($1, $2), ($3, $4)) FOR UPDATE NOWAIT"
        );
    }

    #[test]
    fn test_bulk_update_stamps_acquisition_bookkeeping() {
        let now = Utc::now();
        let keys = vec![TaskKey::new("a", now)];
        let qb = builder().update_status_for_keys(&keys, TaskStatus::Acquired, "ops", now);
        assert_eq!(
            qb.sql(),
            "UPDATE tasks SET status = $1, acquired_by = $2, acquired_at = $3 \
             WHERE (name, bucket_time) IN (($4, $5))"
        );

        let qb = builder().update_status_for_keys(&keys, TaskStatus::Skip, "ops", now);
        assert_eq!(
            qb.sql(),
            "UPDATE tasks SET status = $1 WHERE (name, bucket_time) IN (($2, $3))"
        );
    }

    #[test]
    fn test_single_row_statements() {
        let sql = builder();
        assert_eq!(
            sql.select_for_update_nowait(),
            format!(
                "SELECT {ALL_COLUMNS} FROM tasks \
                 WHERE name = $1 AND bucket_time = $2 FOR UPDATE NOWAIT"
            )
        );
        assert!(sql.update_failed().contains("fail_count = fail_count + 1"));
        assert!(sql.create_table().contains("PRIMARY KEY (name, bucket_time)"));
    }
}
