//! Repository pattern implementation for the replica
//!
//! Each repository owns the SQL for one aggregate. Besides the async methods,
//! most modules expose `pub(crate)` functions over a plain `&Connection` so
//! the sync orchestrator can compose several aggregates inside one
//! transaction (a page write, a leaf-to-root purge).

use crate::core::error::Result;
use async_trait::async_trait;
use rusqlite::Connection;

pub mod book;
pub mod journal;
pub mod library;
pub mod read_progress;
pub mod referential;
pub mod series;
pub mod server;
pub mod settings;
pub mod task;
pub mod thumbnail;
pub mod user;

pub use book::BookRepository;
pub use journal::JournalRepository;
pub use library::LibraryRepository;
pub use read_progress::ReadProgressRepository;
pub use referential::ReferentialRepository;
pub use series::SeriesRepository;
pub use server::ServerRepository;
pub use settings::SettingsRepository;
pub use task::{TaskCounts, TaskRepository};
pub use thumbnail::ThumbnailRepository;
pub use user::UserRepository;

/// Generic repository trait for CRUD operations
#[async_trait]
pub trait Repository<T>: Send + Sync {
    /// Find an entity by its ID
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Find all entities
    async fn find_all(&self) -> Result<Vec<T>>;

    /// Insert or fully replace an entity together with its child rows
    async fn upsert(&self, entity: &T) -> Result<()>;

    /// Delete an entity by its ID, children first
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Replace a one-to-many string set (delete-then-insert)
pub(crate) fn replace_strings(
    conn: &Connection,
    table: &str,
    owner_column: &str,
    owner_id: &str,
    value_column: &str,
    values: &[String],
) -> Result<()> {
    conn.execute(&format!("DELETE FROM {table} WHERE {owner_column} = ?"), [owner_id])?;
    let mut stmt = conn.prepare(&format!(
        "INSERT OR IGNORE INTO {table} ({owner_column}, {value_column}) VALUES (?, ?)"
    ))?;
    for value in values {
        stmt.execute([owner_id, value.as_str()])?;
    }
    Ok(())
}

/// Load a one-to-many string set in insertion order
pub(crate) fn load_strings(
    conn: &Connection,
    table: &str,
    owner_column: &str,
    owner_id: &str,
    value_column: &str,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {value_column} FROM {table} WHERE {owner_column} = ? ORDER BY rowid"
    ))?;
    let values = stmt
        .query_map([owner_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(values)
}

/// Explicit leaf-to-root deletes. Foreign keys carry no cascade, so each
/// function removes every dependent row before its parent.
pub(crate) mod cascade {
    use crate::core::error::Result;
    use rusqlite::{Connection, OptionalExtension};

    /// Delete one book and everything hanging off it.
    /// Returns the local download path, if the book had one.
    pub(crate) fn delete_book(conn: &Connection, book_id: &str) -> Result<Option<String>> {
        let path: Option<Option<String>> = conn
            .query_row(
                "SELECT file_download_path FROM book WHERE id = ?",
                [book_id],
                |row| row.get(0),
            )
            .optional()?;

        for table in [
            "read_progress",
            "thumbnail_book",
            "media_pages",
            "media",
            "book_metadata_links",
            "book_metadata_tags",
            "book_metadata_authors",
            "book_metadata",
        ] {
            conn.execute(&format!("DELETE FROM {table} WHERE book_id = ?"), [book_id])?;
        }
        conn.execute("DELETE FROM book WHERE id = ?", [book_id])?;

        Ok(path.flatten())
    }

    /// Delete one series, its books first. Returns removed download paths.
    pub(crate) fn delete_series(conn: &Connection, series_id: &str) -> Result<Vec<String>> {
        let book_ids = ids(conn, "SELECT id FROM book WHERE series_id = ?", series_id)?;
        let mut files = Vec::new();
        for book_id in book_ids {
            files.extend(delete_book(conn, &book_id)?);
        }

        for table in [
            "read_progress_series",
            "thumbnail_series",
            "metadata_aggregation_authors",
            "metadata_aggregation_tags",
            "metadata_aggregation",
            "series_sharing_labels",
            "series_links",
            "series_alternate_titles",
            "series_genres",
            "series_tags",
            "series_metadata",
        ] {
            conn.execute(&format!("DELETE FROM {table} WHERE series_id = ?"), [series_id])?;
        }
        conn.execute("DELETE FROM series WHERE id = ?", [series_id])?;

        Ok(files)
    }

    /// Delete one library with all of its series and books
    pub(crate) fn delete_library(conn: &Connection, library_id: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        // books whose series sits in another library still belong here
        for book_id in ids(conn, "SELECT id FROM book WHERE library_id = ?", library_id)? {
            files.extend(delete_book(conn, &book_id)?);
        }
        for series_id in ids(conn, "SELECT id FROM series WHERE library_id = ?", library_id)? {
            files.extend(delete_series(conn, &series_id)?);
        }
        conn.execute("DELETE FROM library_exclusions WHERE library_id = ?", [library_id])?;
        conn.execute("DELETE FROM library WHERE id = ?", [library_id])?;
        Ok(files)
    }

    pub(crate) fn delete_user(conn: &Connection, user_id: &str) -> Result<()> {
        for table in [
            "read_progress",
            "read_progress_series",
            "user_roles",
            "user_shared_libraries",
            "user_sharing_labels",
        ] {
            conn.execute(&format!("DELETE FROM {table} WHERE user_id = ?"), [user_id])?;
        }
        conn.execute("DELETE FROM users WHERE id = ?", [user_id])?;
        conn.execute("UPDATE settings SET user_id = NULL WHERE user_id = ?", [user_id])?;
        Ok(())
    }

    /// Delete a server identity and every entity scoped to it
    pub(crate) fn delete_server(conn: &Connection, server_id: &str) -> Result<Vec<String>> {
        for user_id in ids(conn, "SELECT id FROM users WHERE server_id = ?", server_id)? {
            delete_user(conn, &user_id)?;
        }
        let mut files = Vec::new();
        for library_id in ids(conn, "SELECT id FROM library WHERE media_server_id = ?", server_id)? {
            files.extend(delete_library(conn, &library_id)?);
        }
        conn.execute("DELETE FROM media_server WHERE id = ?", [server_id])?;
        conn.execute("UPDATE settings SET server_id = NULL WHERE server_id = ?", [server_id])?;
        Ok(files)
    }

    fn ids(conn: &Connection, sql: &str, param: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map([param], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
