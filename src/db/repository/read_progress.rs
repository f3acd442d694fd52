//! Read progress per (book, user) and the per-series counts derived from it

use crate::core::error::{ReplicaError, Result};
use crate::db::manager::DatabaseManager;
use crate::db::models::{
    now, ts_column, ts_to_sql, ReadProgress, ReadProgressSeries, ReadProgressUpdate,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

const PROGRESS_COLUMNS: &str = "book_id, user_id, page, completed, read_date, device_id, \
     device_name, locator, created_date, last_modified_date";

fn map_progress(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadProgress> {
    let locator: Option<String> = row.get(7)?;
    let locator = locator
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(ReadProgress {
        book_id: row.get(0)?,
        user_id: row.get(1)?,
        page: row.get(2)?,
        completed: row.get(3)?,
        read_date: ts_column(row, 4)?,
        device_id: row.get(5)?,
        device_name: row.get(6)?,
        locator,
        created_date: ts_column(row, 8)?,
        last_modified_date: ts_column(row, 9)?,
    })
}

pub(crate) fn read(conn: &Connection, book_id: &str, user_id: &str) -> Result<Option<ReadProgress>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROGRESS_COLUMNS} FROM read_progress WHERE book_id = ? AND user_id = ?"),
            [book_id, user_id],
            map_progress,
        )
        .optional()?)
}

/// Store a progress row as-is and refresh the series counts
pub(crate) fn write(conn: &Connection, progress: &ReadProgress) -> Result<()> {
    let locator = progress.locator.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO read_progress (book_id, user_id, page, completed, read_date, device_id, \
         device_name, locator, created_date, last_modified_date) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(book_id, user_id) DO UPDATE SET page = excluded.page, \
         completed = excluded.completed, read_date = excluded.read_date, \
         device_id = excluded.device_id, device_name = excluded.device_name, \
         locator = excluded.locator, created_date = excluded.created_date, \
         last_modified_date = excluded.last_modified_date",
        params![
            progress.book_id,
            progress.user_id,
            progress.page,
            progress.completed,
            ts_to_sql(&progress.read_date),
            progress.device_id,
            progress.device_name,
            locator,
            ts_to_sql(&progress.created_date),
            ts_to_sql(&progress.last_modified_date),
        ],
    )?;
    refresh_for_book(conn, &progress.book_id, &progress.user_id)
}

/// Remove a progress row. Returns false if there was none.
pub(crate) fn remove(conn: &Connection, book_id: &str, user_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM read_progress WHERE book_id = ? AND user_id = ?",
        [book_id, user_id],
    )?;
    refresh_for_book(conn, book_id, user_id)?;
    Ok(removed > 0)
}

fn refresh_for_book(conn: &Connection, book_id: &str, user_id: &str) -> Result<()> {
    let series_id: Option<String> = conn
        .query_row("SELECT series_id FROM book WHERE id = ?", [book_id], |row| row.get(0))
        .optional()?;
    match series_id {
        Some(series_id) => recompute_series(conn, &series_id, user_id),
        None => Ok(()),
    }
}

/// Rebuild the read counts of one (series, user)
pub(crate) fn recompute_series(conn: &Connection, series_id: &str, user_id: &str) -> Result<()> {
    let (total, read, in_progress): (i32, i32, i32) = conn.query_row(
        "SELECT COUNT(b.id), \
         COALESCE(SUM(CASE WHEN p.completed = 1 THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN p.completed = 0 THEN 1 ELSE 0 END), 0) \
         FROM book b LEFT JOIN read_progress p ON p.book_id = b.id AND p.user_id = ?2 \
         WHERE b.series_id = ?1 AND b.deleted = 0",
        [series_id, user_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    conn.execute(
        "INSERT INTO read_progress_series (series_id, user_id, books_read, books_unread, books_in_progress) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(series_id, user_id) DO UPDATE SET books_read = excluded.books_read, \
         books_unread = excluded.books_unread, books_in_progress = excluded.books_in_progress",
        params![series_id, user_id, read, total - read - in_progress, in_progress],
    )?;
    Ok(())
}

/// Rebuild the read counts of a series for every user that has any
pub(crate) fn recompute_series_for_all_users(conn: &Connection, series_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM read_progress_series WHERE series_id = ?1 \
         UNION SELECT p.user_id FROM read_progress p JOIN book b ON b.id = p.book_id \
         WHERE b.series_id = ?1",
    )?;
    let users = stmt
        .query_map([series_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for user_id in users {
        recompute_series(conn, series_id, &user_id)?;
    }
    Ok(())
}

/// Apply a client-side change to a reading position and store it.
///
/// Marking completed moves to the last page; reaching the last page marks
/// completed. The row is stamped with the current time so it wins the next
/// reconciliation against an older server value.
pub(crate) fn apply_update(
    conn: &Connection,
    book_id: &str,
    user_id: &str,
    update: &ReadProgressUpdate,
    device_name: &str,
) -> Result<ReadProgress> {
    let pages_count: Option<i32> = conn
        .query_row(
            "SELECT md.pages_count FROM book b JOIN media md ON md.book_id = b.id \
             WHERE b.id = ? AND b.deleted = 0",
            [book_id],
            |row| row.get(0),
        )
        .optional()?;
    let pages_count = pages_count.ok_or_else(|| ReplicaError::NotFound(format!("book {book_id}")))?;

    let (page, completed) = match (update.page, update.completed) {
        (_, Some(true)) => (pages_count.max(1), true),
        (Some(page), completed) => {
            if page < 1 || (pages_count > 0 && page > pages_count) {
                return Err(ReplicaError::Validation(format!(
                    "page {page} outside 1..={pages_count} for book {book_id}"
                )));
            }
            (page, completed.unwrap_or(page >= pages_count))
        }
        (None, Some(false)) => (1, false),
        (None, None) => {
            return Err(ReplicaError::Validation("empty read progress update".to_string()));
        }
    };

    let stamp = now();
    let existing = read(conn, book_id, user_id)?;
    let progress = ReadProgress {
        book_id: book_id.to_string(),
        user_id: user_id.to_string(),
        page,
        completed,
        read_date: stamp,
        device_id: existing.as_ref().map(|p| p.device_id.clone()).unwrap_or_default(),
        device_name: device_name.to_string(),
        locator: existing.as_ref().and_then(|p| p.locator.clone()),
        created_date: existing.map(|p| p.created_date).unwrap_or(stamp),
        last_modified_date: stamp,
    };
    write(conn, &progress)?;
    Ok(progress)
}

/// Repository for ReadProgress rows
pub struct ReadProgressRepository {
    db: Arc<DatabaseManager>,
}

impl ReadProgressRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn get(&self, book_id: &str, user_id: &str) -> Result<Option<ReadProgress>> {
        let book_id = book_id.to_string();
        let user_id = user_id.to_string();
        self.db.execute(move |conn| read(conn, &book_id, &user_id)).await
    }

    /// All rows of one user, most recently modified first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ReadProgress>> {
        let user_id = user_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROGRESS_COLUMNS} FROM read_progress WHERE user_id = ? \
                     ORDER BY last_modified_date DESC"
                ))?;
                let rows = stmt
                    .query_map([&user_id], map_progress)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn upsert(&self, progress: &ReadProgress) -> Result<()> {
        let progress = progress.clone();
        self.db.transaction(move |tx| write(tx, &progress)).await
    }

    pub async fn delete(&self, book_id: &str, user_id: &str) -> Result<bool> {
        let book_id = book_id.to_string();
        let user_id = user_id.to_string();
        self.db.transaction(move |tx| remove(tx, &book_id, &user_id)).await
    }

    /// See [`apply_update`]
    pub async fn mark(
        &self,
        book_id: &str,
        user_id: &str,
        update: ReadProgressUpdate,
        device_name: &str,
    ) -> Result<ReadProgress> {
        let book_id = book_id.to_string();
        let user_id = user_id.to_string();
        let device_name = device_name.to_string();
        self.db
            .transaction(move |tx| apply_update(tx, &book_id, &user_id, &update, &device_name))
            .await
    }

    /// Mark every live book of a series read (or unread, which removes the
    /// rows). Returns the ids of the books that changed.
    pub async fn mark_series(
        &self,
        series_id: &str,
        user_id: &str,
        completed: bool,
        device_name: &str,
    ) -> Result<Vec<String>> {
        let series_id = series_id.to_string();
        let user_id = user_id.to_string();
        let device_name = device_name.to_string();
        self.db
            .transaction(move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT id FROM book WHERE series_id = ? AND deleted = 0 ORDER BY number",
                )?;
                let book_ids = stmt
                    .query_map([&series_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut changed = Vec::new();
                for book_id in book_ids {
                    if completed {
                        let update = ReadProgressUpdate { page: None, completed: Some(true) };
                        apply_update(tx, &book_id, &user_id, &update, &device_name)?;
                        changed.push(book_id);
                    } else if remove(tx, &book_id, &user_id)? {
                        changed.push(book_id);
                    }
                }
                recompute_series(tx, &series_id, &user_id)?;
                Ok(changed)
            })
            .await
    }

    /// Read counts of one (series, user)
    pub async fn series_progress(&self, series_id: &str, user_id: &str) -> Result<Option<ReadProgressSeries>> {
        let series_id = series_id.to_string();
        let user_id = user_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT series_id, user_id, books_read, books_unread, books_in_progress \
                         FROM read_progress_series WHERE series_id = ? AND user_id = ?",
                        [&series_id, &user_id],
                        |row| {
                            Ok(ReadProgressSeries {
                                series_id: row.get(0)?,
                                user_id: row.get(1)?,
                                books_read: row.get(2)?,
                                books_unread: row.get(3)?,
                                books_in_progress: row.get(4)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;
    use crate::db::repository::{
        BookRepository, LibraryRepository, Repository, SeriesRepository, ServerRepository, UserRepository,
    };

    async fn setup() -> (Arc<DatabaseManager>, ReadProgressRepository) {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        ServerRepository::new(db.clone()).upsert(&fixtures::server()).await.unwrap();
        UserRepository::new(db.clone()).upsert(&fixtures::user("u1")).await.unwrap();
        LibraryRepository::new(db.clone()).upsert(&fixtures::library("l1")).await.unwrap();
        SeriesRepository::new(db.clone())
            .upsert_page(vec![fixtures::series("s1", "l1")])
            .await
            .unwrap();
        BookRepository::new(db.clone())
            .upsert_page(vec![
                fixtures::book("b1", "s1", "l1", 1),
                fixtures::book("b2", "s1", "l1", 2),
                fixtures::book("b3", "s1", "l1", 3),
            ])
            .await
            .unwrap();
        (db.clone(), ReadProgressRepository::new(db))
    }

    #[tokio::test]
    async fn test_series_counts_follow_progress() {
        let (_db, repo) = setup().await;

        repo.mark("b1", "u1", ReadProgressUpdate { page: None, completed: Some(true) }, "Tablet")
            .await
            .unwrap();
        repo.mark("b2", "u1", ReadProgressUpdate { page: Some(2), completed: None }, "Tablet")
            .await
            .unwrap();

        let counts = repo.series_progress("s1", "u1").await.unwrap().unwrap();
        assert_eq!((counts.books_read, counts.books_in_progress, counts.books_unread), (1, 1, 1));

        repo.delete("b1", "u1").await.unwrap();
        let counts = repo.series_progress("s1", "u1").await.unwrap().unwrap();
        assert_eq!((counts.books_read, counts.books_in_progress, counts.books_unread), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_last_page_completes() {
        let (_db, repo) = setup().await;
        let progress = repo
            .mark("b1", "u1", ReadProgressUpdate { page: Some(3), completed: None }, "Tablet")
            .await
            .unwrap();
        assert!(progress.completed);

        let err = repo
            .mark("b1", "u1", ReadProgressUpdate { page: Some(9), completed: None }, "Tablet")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Validation(_)));

        let err = repo
            .mark("missing", "u1", ReadProgressUpdate { page: Some(1), completed: None }, "Tablet")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_series() {
        let (_db, repo) = setup().await;
        let changed = repo.mark_series("s1", "u1", true, "Tablet").await.unwrap();
        assert_eq!(changed.len(), 3);
        assert!(repo.get("b3", "u1").await.unwrap().unwrap().completed);

        let changed = repo.mark_series("s1", "u1", false, "Tablet").await.unwrap();
        assert_eq!(changed.len(), 3);
        let counts = repo.series_progress("s1", "u1").await.unwrap().unwrap();
        assert_eq!(counts.books_unread, 3);
        assert!(repo.list_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_book_and_user() {
        let (_db, repo) = setup().await;
        repo.upsert(&fixtures::progress("b1", "u1", 1, fixtures::ts(3))).await.unwrap();
        repo.upsert(&fixtures::progress("b1", "u1", 2, fixtures::ts(4))).await.unwrap();

        let rows = repo.list_for_user("u1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page, 2);
    }
}
