//! Append-only diagnostic journal

use crate::core::error::{ReplicaError, Result};
use crate::db::manager::DatabaseManager;
use crate::db::models::{now, ts_column, ts_to_sql, JournalEntry, JournalType};
use rusqlite::{params, Connection};
use std::sync::Arc;

pub(crate) fn append(conn: &Connection, entry_type: JournalType, message: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO log_journal (message, type, timestamp) VALUES (?, ?, ?)",
        params![message, entry_type.as_str(), ts_to_sql(&now())],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, crate::db::models::Timestamp)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, ts_column(row, 3)?))
}

/// Repository for LogJournal entries
pub struct JournalRepository {
    db: Arc<DatabaseManager>,
}

impl JournalRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry_type: JournalType, message: impl Into<String>) -> Result<i64> {
        let message = message.into();
        self.db.execute(move |conn| append(conn, entry_type, &message)).await
    }

    /// Newest entries first, optionally of one type only
    pub async fn list(&self, entry_type: Option<JournalType>, limit: u32) -> Result<Vec<JournalEntry>> {
        self.db
            .execute(move |conn| {
                let rows = match entry_type {
                    Some(t) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, message, type, timestamp FROM log_journal \
                             WHERE type = ? ORDER BY id DESC LIMIT ?",
                        )?;
                        let rows = stmt
                            .query_map(params![t.as_str(), limit], map_entry)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, message, type, timestamp FROM log_journal ORDER BY id DESC LIMIT ?",
                        )?;
                        let rows = stmt
                            .query_map([limit], map_entry)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                };

                rows.into_iter()
                    .map(|(id, message, raw_type, timestamp)| -> Result<JournalEntry> {
                        let entry_type = JournalType::parse(&raw_type)
                            .ok_or_else(|| ReplicaError::corrupt("log_journal", format!("unknown type {raw_type}")))?;
                        Ok(JournalEntry { id, message, entry_type, timestamp })
                    })
                    .collect()
            })
            .await
    }

    /// Keep only the newest `keep` entries. Returns how many were removed.
    pub async fn prune(&self, keep: u32) -> Result<usize> {
        self.db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM log_journal WHERE id NOT IN \
                     (SELECT id FROM log_journal ORDER BY id DESC LIMIT ?)",
                    [keep],
                )?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_list_prune() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = JournalRepository::new(db);

        repo.append(JournalType::Info, "pass started").await.unwrap();
        repo.append(JournalType::Conflict, "book b1: kept server page 12").await.unwrap();
        repo.append(JournalType::Error, "page write failed").await.unwrap();

        let all = repo.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "page write failed");

        let conflicts = repo.list(Some(JournalType::Conflict), 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);

        assert_eq!(repo.prune(1).await.unwrap(), 2);
        assert_eq!(repo.list(None, 10).await.unwrap().len(), 1);
    }
}
