//! Durable task rows
//!
//! Every state transition is a single SQL statement so that concurrent
//! workers can never observe or claim a half-updated row.

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{opt_ts_column, ts_column, ts_to_sql, TaskRecord, Timestamp};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const TASK_COLUMNS: &str = "unique_name, task_type, priority, status, payload, attempts, \
     max_attempts, error, not_before, created_date, updated_date";

fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        unique_name: row.get(0)?,
        task_type: row.get(1)?,
        priority: row.get(2)?,
        status: row.get(3)?,
        payload: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        error: row.get(7)?,
        not_before: opt_ts_column(row, 8)?,
        created_date: ts_column(row, 9)?,
        updated_date: ts_column(row, 10)?,
    })
}

/// Row counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u32,
    pub active: u32,
    pub failed: u32,
}

/// Repository for Task rows
pub struct TaskRepository {
    db: Arc<DatabaseManager>,
}

impl TaskRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Insert a pending row unless one with the same unique name is pending
    /// or active. A terminally failed row is replaced.
    /// Returns true if a row was written.
    pub async fn insert_pending(&self, record: &TaskRecord) -> Result<bool> {
        let record = record.clone();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO tasks (unique_name, task_type, priority, status, payload, attempts, \
                     max_attempts, error, not_before, created_date, updated_date) \
                     VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, NULL, NULL, ?6, ?6) \
                     ON CONFLICT(unique_name) DO UPDATE SET task_type = excluded.task_type, \
                     priority = excluded.priority, status = 'pending', payload = excluded.payload, \
                     attempts = 0, max_attempts = excluded.max_attempts, error = NULL, \
                     not_before = NULL, created_date = excluded.created_date, \
                     updated_date = excluded.updated_date \
                     WHERE tasks.status = 'failed'",
                    params![
                        record.unique_name,
                        record.task_type,
                        record.priority,
                        record.payload,
                        record.max_attempts,
                        ts_to_sql(&record.created_date),
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Claim the highest-priority eligible pending row, oldest first.
    ///
    /// The select and the status flip are one `UPDATE ... RETURNING`, so two
    /// workers can never claim the same row.
    pub async fn claim_next(&self, at: Timestamp) -> Result<Option<TaskRecord>> {
        self.db
            .execute(move |conn| {
                let at = ts_to_sql(&at);
                Ok(conn
                    .query_row(
                        &format!(
                            "UPDATE tasks SET status = 'active', updated_date = ?1 \
                             WHERE status = 'pending' AND unique_name = ( \
                                 SELECT unique_name FROM tasks \
                                 WHERE status = 'pending' AND (not_before IS NULL OR not_before <= ?1) \
                                 ORDER BY priority DESC, created_date ASC, rowid ASC LIMIT 1) \
                             RETURNING {TASK_COLUMNS}"
                        ),
                        [&at],
                        map_task,
                    )
                    .optional()?)
            })
            .await
    }

    /// Delete a row. Returns false if it did not exist.
    pub async fn delete(&self, unique_name: &str) -> Result<bool> {
        let unique_name = unique_name.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn.execute("DELETE FROM tasks WHERE unique_name = ?", [&unique_name])? > 0)
            })
            .await
    }

    /// Delete a pending or failed row. Active rows are left to their worker.
    pub async fn delete_inactive(&self, unique_name: &str) -> Result<bool> {
        let unique_name = unique_name.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM tasks WHERE unique_name = ? AND status <> 'active'",
                    [&unique_name],
                )? > 0)
            })
            .await
    }

    /// Put an active row back to pending after a failed attempt
    pub async fn reschedule(
        &self,
        unique_name: &str,
        attempts: i32,
        not_before: Timestamp,
        error: &str,
    ) -> Result<bool> {
        let unique_name = unique_name.to_string();
        let error = error.to_string();
        self.db
            .execute(move |conn| {
                let now = ts_to_sql(&crate::db::models::now());
                Ok(conn.execute(
                    "UPDATE tasks SET status = 'pending', attempts = ?, not_before = ?, error = ?, \
                     updated_date = ? WHERE unique_name = ? AND status = 'active'",
                    params![attempts, ts_to_sql(&not_before), error, now, unique_name],
                )? > 0)
            })
            .await
    }

    /// Move an active row to the terminal `failed` status
    pub async fn mark_failed(&self, unique_name: &str, attempts: i32, error: &str) -> Result<bool> {
        let unique_name = unique_name.to_string();
        let error = error.to_string();
        self.db
            .execute(move |conn| {
                let now = ts_to_sql(&crate::db::models::now());
                Ok(conn.execute(
                    "UPDATE tasks SET status = 'failed', attempts = ?, error = ?, not_before = NULL, \
                     updated_date = ? WHERE unique_name = ? AND status = 'active'",
                    params![attempts, error, now, unique_name],
                )? > 0)
            })
            .await
    }

    /// Return an active row to pending without counting an attempt
    pub async fn release(&self, unique_name: &str) -> Result<bool> {
        let unique_name = unique_name.to_string();
        self.db
            .execute(move |conn| {
                let now = ts_to_sql(&crate::db::models::now());
                Ok(conn.execute(
                    "UPDATE tasks SET status = 'pending', updated_date = ? \
                     WHERE unique_name = ? AND status = 'active'",
                    params![now, unique_name],
                )? > 0)
            })
            .await
    }

    /// Reset every active row to pending. Returns how many were reset.
    pub async fn reset_active(&self) -> Result<usize> {
        self.db
            .execute(|conn| {
                let now = ts_to_sql(&crate::db::models::now());
                Ok(conn.execute(
                    "UPDATE tasks SET status = 'pending', updated_date = ? WHERE status = 'active'",
                    [now],
                )?)
            })
            .await
    }

    pub async fn get(&self, unique_name: &str) -> Result<Option<TaskRecord>> {
        let unique_name = unique_name.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE unique_name = ?"),
                        [&unique_name],
                        map_task,
                    )
                    .optional()?)
            })
            .await
    }

    /// Rows in dequeue order, optionally of one status only
    pub async fn list(&self, status: Option<&str>) -> Result<Vec<TaskRecord>> {
        let status = status.map(str::to_string);
        self.db
            .execute(move |conn| {
                let order = "ORDER BY priority DESC, created_date ASC, rowid ASC";
                let tasks = match status {
                    Some(status) => {
                        let mut stmt = conn
                            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? {order}"))?;
                        let tasks = stmt
                            .query_map([&status], map_task)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        tasks
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {order}"))?;
                        let tasks = stmt
                            .query_map([], map_task)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        tasks
                    }
                };
                Ok(tasks)
            })
            .await
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        self.db
            .execute(|conn| {
                let mut counts = TaskCounts::default();
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                for (status, count) in rows {
                    match status.as_str() {
                        "pending" => counts.pending = count,
                        "active" => counts.active = count,
                        "failed" => counts.failed = count,
                        _ => {}
                    }
                }
                Ok(counts)
            })
            .await
    }

    /// Earliest backoff deadline among pending rows that are not yet eligible
    pub async fn next_eligible_at(&self, at: Timestamp) -> Result<Option<Timestamp>> {
        self.db
            .execute(move |conn| {
                let raw: Option<String> = conn.query_row(
                    "SELECT MIN(not_before) FROM tasks WHERE status = 'pending' AND not_before > ?",
                    [ts_to_sql(&at)],
                    |row| row.get(0),
                )?;
                Ok(raw.and_then(|s| {
                    chrono::DateTime::parse_from_rfc3339(&s)
                        .ok()
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                }))
            })
            .await
    }

    /// Re-queue every failed row with a fresh attempt budget
    pub async fn retry_failed(&self) -> Result<usize> {
        self.db
            .execute(|conn| {
                let now = ts_to_sql(&crate::db::models::now());
                Ok(conn.execute(
                    "UPDATE tasks SET status = 'pending', attempts = 0, error = NULL, not_before = NULL, \
                     updated_date = ? WHERE status = 'failed'",
                    [now],
                )?)
            })
            .await
    }

    /// Drop every failed row
    pub async fn purge_failed(&self) -> Result<usize> {
        self.db
            .execute(|conn| Ok(conn.execute("DELETE FROM tasks WHERE status = 'failed'", [])?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;
    use chrono::Duration;

    fn record(name: &str, priority: i32, created_day: u32) -> TaskRecord {
        TaskRecord {
            unique_name: name.to_string(),
            task_type: name.split(':').next().unwrap_or(name).to_string(),
            priority,
            status: "pending".to_string(),
            payload: "{}".to_string(),
            attempts: 0,
            max_attempts: 5,
            error: None,
            not_before: None,
            created_date: fixtures::ts(created_day),
            updated_date: fixtures::ts(created_day),
        }
    }

    #[tokio::test]
    async fn test_insert_dedup_and_failed_replacement() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = TaskRepository::new(db);

        assert!(repo.insert_pending(&record("download_book:b1", 1, 1)).await.unwrap());
        assert!(!repo.insert_pending(&record("download_book:b1", 3, 2)).await.unwrap());

        let claimed = repo.claim_next(fixtures::ts(5)).await.unwrap().unwrap();
        assert_eq!(claimed.priority, 1);
        assert!(!repo.insert_pending(&record("download_book:b1", 3, 2)).await.unwrap());

        repo.mark_failed("download_book:b1", 5, "disk full").await.unwrap();
        assert_eq!(repo.counts().await.unwrap().failed, 1);
        assert!(repo.insert_pending(&record("download_book:b1", 3, 3)).await.unwrap());

        let row = repo.get("download_book:b1").await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.attempts, 0);
        assert_eq!(row.priority, 3);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_claim_order_and_backoff() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = TaskRepository::new(db);

        repo.insert_pending(&record("refresh_series:s1", 2, 1)).await.unwrap();
        repo.insert_pending(&record("download_book:b1", 1, 1)).await.unwrap();
        repo.insert_pending(&record("push_read_progress:b2:u1", 3, 3)).await.unwrap();
        repo.insert_pending(&record("refresh_series:s0", 2, 2)).await.unwrap();

        let at = fixtures::ts(10);
        let order: Vec<String> = {
            let mut names = Vec::new();
            while let Some(task) = repo.claim_next(at).await.unwrap() {
                names.push(task.unique_name);
            }
            names
        };
        assert_eq!(
            order,
            vec![
                "push_read_progress:b2:u1",
                "refresh_series:s1",
                "refresh_series:s0",
                "download_book:b1"
            ]
        );

        let not_before = at + Duration::seconds(30);
        assert!(repo.reschedule("refresh_series:s1", 1, not_before, "timeout").await.unwrap());
        assert!(repo.claim_next(at).await.unwrap().is_none());
        assert_eq!(repo.next_eligible_at(at).await.unwrap(), Some(not_before));

        let retried = repo.claim_next(not_before).await.unwrap().unwrap();
        assert_eq!(retried.unique_name, "refresh_series:s1");
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_reset_release_and_diagnostics() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = TaskRepository::new(db);

        repo.insert_pending(&record("download_book:b1", 1, 1)).await.unwrap();
        repo.insert_pending(&record("download_book:b2", 1, 2)).await.unwrap();
        repo.claim_next(fixtures::ts(3)).await.unwrap().unwrap();
        repo.claim_next(fixtures::ts(3)).await.unwrap().unwrap();

        assert!(repo.release("download_book:b1").await.unwrap());
        assert!(!repo.release("download_book:b1").await.unwrap());
        assert_eq!(repo.get("download_book:b1").await.unwrap().unwrap().attempts, 0);

        assert_eq!(repo.reset_active().await.unwrap(), 1);
        assert_eq!(
            repo.counts().await.unwrap(),
            TaskCounts { pending: 2, active: 0, failed: 0 }
        );

        repo.claim_next(fixtures::ts(3)).await.unwrap().unwrap();
        repo.mark_failed("download_book:b1", 5, "gone").await.unwrap();
        assert_eq!(repo.list(Some("failed")).await.unwrap().len(), 1);
        assert_eq!(repo.retry_failed().await.unwrap(), 1);
        assert_eq!(repo.list(Some("pending")).await.unwrap().len(), 2);

        repo.claim_next(fixtures::ts(3)).await.unwrap().unwrap();
        repo.mark_failed("download_book:b1", 5, "gone").await.unwrap();
        assert_eq!(repo.purge_failed().await.unwrap(), 1);
        assert!(repo.delete("download_book:b2").await.unwrap());
        assert!(repo.list(None).await.unwrap().is_empty());
    }
}
