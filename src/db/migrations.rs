//! Database migrations
//!
//! The replica schema is the durable on-disk contract: columns may be added by
//! later migrations but never renamed or retyped. Foreign keys carry no
//! `ON DELETE CASCADE`; repositories delete children before parents so a
//! wrong deletion order fails loudly instead of silently orphaning rows.

use crate::core::error::{Result, StorageError};
use rusqlite::Connection;
use tracing::{info, warn};

/// Migration version tracking table
const MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Initial replica schema (version 1)
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS media_server (
    id TEXT PRIMARY KEY,
    base_url TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS library (
    id TEXT PRIMARY KEY,
    media_server_id TEXT NOT NULL REFERENCES media_server(id),
    name TEXT NOT NULL,
    root TEXT NOT NULL,
    import_comicinfo_book INTEGER NOT NULL DEFAULT 1,
    import_comicinfo_series INTEGER NOT NULL DEFAULT 1,
    import_comicinfo_collection INTEGER NOT NULL DEFAULT 1,
    import_comicinfo_readlist INTEGER NOT NULL DEFAULT 1,
    import_epub_book INTEGER NOT NULL DEFAULT 1,
    import_epub_series INTEGER NOT NULL DEFAULT 1,
    import_local_artwork INTEGER NOT NULL DEFAULT 1,
    import_barcode_isbn INTEGER NOT NULL DEFAULT 1,
    scan_force_modified_time INTEGER NOT NULL DEFAULT 0,
    scan_on_startup INTEGER NOT NULL DEFAULT 0,
    scan_interval TEXT NOT NULL DEFAULT 'EVERY_6H',
    hash_files INTEGER NOT NULL DEFAULT 1,
    hash_pages INTEGER NOT NULL DEFAULT 0,
    analyze_dimensions INTEGER NOT NULL DEFAULT 1,
    oneshots_directory TEXT,
    unavailable INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS library_exclusions (
    library_id TEXT NOT NULL REFERENCES library(id),
    pattern TEXT NOT NULL,
    PRIMARY KEY (library_id, pattern)
);

CREATE TABLE IF NOT EXISTS series (
    id TEXT PRIMARY KEY,
    library_id TEXT NOT NULL REFERENCES library(id),
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    book_count INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    oneshot INTEGER NOT NULL DEFAULT 0,
    created_date TEXT NOT NULL,
    last_modified_date TEXT NOT NULL,
    file_last_modified TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS series_metadata (
    series_id TEXT PRIMARY KEY REFERENCES series(id),
    status TEXT NOT NULL,
    status_lock INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL,
    title_lock INTEGER NOT NULL DEFAULT 0,
    title_sort TEXT NOT NULL,
    title_sort_lock INTEGER NOT NULL DEFAULT 0,
    summary TEXT NOT NULL DEFAULT '',
    summary_lock INTEGER NOT NULL DEFAULT 0,
    reading_direction TEXT,
    reading_direction_lock INTEGER NOT NULL DEFAULT 0,
    publisher TEXT NOT NULL DEFAULT '',
    publisher_lock INTEGER NOT NULL DEFAULT 0,
    age_rating INTEGER,
    age_rating_lock INTEGER NOT NULL DEFAULT 0,
    language TEXT NOT NULL DEFAULT '',
    language_lock INTEGER NOT NULL DEFAULT 0,
    genres_lock INTEGER NOT NULL DEFAULT 0,
    tags_lock INTEGER NOT NULL DEFAULT 0,
    total_book_count INTEGER,
    total_book_count_lock INTEGER NOT NULL DEFAULT 0,
    sharing_labels_lock INTEGER NOT NULL DEFAULT 0,
    links_lock INTEGER NOT NULL DEFAULT 0,
    alternate_titles_lock INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS series_tags (
    series_id TEXT NOT NULL REFERENCES series(id),
    tag TEXT NOT NULL,
    PRIMARY KEY (series_id, tag)
);

CREATE TABLE IF NOT EXISTS series_genres (
    series_id TEXT NOT NULL REFERENCES series(id),
    genre TEXT NOT NULL,
    PRIMARY KEY (series_id, genre)
);

CREATE TABLE IF NOT EXISTS series_alternate_titles (
    series_id TEXT NOT NULL REFERENCES series(id),
    label TEXT NOT NULL,
    title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS series_links (
    series_id TEXT NOT NULL REFERENCES series(id),
    label TEXT NOT NULL,
    url TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS series_sharing_labels (
    series_id TEXT NOT NULL REFERENCES series(id),
    label TEXT NOT NULL,
    PRIMARY KEY (series_id, label)
);

CREATE TABLE IF NOT EXISTS book (
    id TEXT PRIMARY KEY,
    series_id TEXT NOT NULL REFERENCES series(id),
    library_id TEXT NOT NULL REFERENCES library(id),
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    number INTEGER NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    file_hash TEXT NOT NULL DEFAULT '',
    deleted INTEGER NOT NULL DEFAULT 0,
    oneshot INTEGER NOT NULL DEFAULT 0,
    created_date TEXT NOT NULL,
    last_modified_date TEXT NOT NULL,
    remote_file_last_modified TEXT NOT NULL,
    local_file_last_modified TEXT,
    remote_unavailable INTEGER NOT NULL DEFAULT 0,
    file_download_path TEXT
);

CREATE TABLE IF NOT EXISTS book_metadata (
    book_id TEXT PRIMARY KEY REFERENCES book(id),
    title TEXT NOT NULL,
    title_lock INTEGER NOT NULL DEFAULT 0,
    summary TEXT NOT NULL DEFAULT '',
    summary_lock INTEGER NOT NULL DEFAULT 0,
    number TEXT NOT NULL,
    number_lock INTEGER NOT NULL DEFAULT 0,
    number_sort REAL NOT NULL,
    number_sort_lock INTEGER NOT NULL DEFAULT 0,
    release_date TEXT,
    release_date_lock INTEGER NOT NULL DEFAULT 0,
    isbn TEXT NOT NULL DEFAULT '',
    isbn_lock INTEGER NOT NULL DEFAULT 0,
    authors_lock INTEGER NOT NULL DEFAULT 0,
    tags_lock INTEGER NOT NULL DEFAULT 0,
    links_lock INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS book_metadata_authors (
    book_id TEXT NOT NULL REFERENCES book(id),
    name TEXT NOT NULL,
    role TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS book_metadata_tags (
    book_id TEXT NOT NULL REFERENCES book(id),
    tag TEXT NOT NULL,
    PRIMARY KEY (book_id, tag)
);

CREATE TABLE IF NOT EXISTS book_metadata_links (
    book_id TEXT NOT NULL REFERENCES book(id),
    label TEXT NOT NULL,
    url TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS media (
    book_id TEXT PRIMARY KEY REFERENCES book(id),
    status TEXT NOT NULL,
    media_type TEXT NOT NULL,
    media_profile TEXT NOT NULL DEFAULT '',
    pages_count INTEGER NOT NULL DEFAULT 0,
    comment TEXT NOT NULL DEFAULT '',
    epub_divina_compatible INTEGER NOT NULL DEFAULT 0,
    epub_is_kepub INTEGER NOT NULL DEFAULT 0,
    extension TEXT
);

CREATE TABLE IF NOT EXISTS media_pages (
    book_id TEXT NOT NULL REFERENCES book(id),
    number INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    media_type TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    size_bytes INTEGER,
    PRIMARY KEY (book_id, number)
);

CREATE TABLE IF NOT EXISTS metadata_aggregation (
    series_id TEXT PRIMARY KEY REFERENCES series(id),
    release_date TEXT,
    summary TEXT NOT NULL DEFAULT '',
    summary_number TEXT NOT NULL DEFAULT '',
    last_modified_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata_aggregation_tags (
    series_id TEXT NOT NULL REFERENCES series(id),
    tag TEXT NOT NULL,
    PRIMARY KEY (series_id, tag)
);

CREATE TABLE IF NOT EXISTS metadata_aggregation_authors (
    series_id TEXT NOT NULL REFERENCES series(id),
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    PRIMARY KEY (series_id, name, role)
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL REFERENCES media_server(id),
    email TEXT NOT NULL,
    shared_all_libraries INTEGER NOT NULL DEFAULT 1,
    age_restriction INTEGER,
    age_restriction_type TEXT
);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id TEXT NOT NULL REFERENCES users(id),
    role TEXT NOT NULL,
    PRIMARY KEY (user_id, role)
);

CREATE TABLE IF NOT EXISTS user_shared_libraries (
    user_id TEXT NOT NULL REFERENCES users(id),
    library_id TEXT NOT NULL,
    PRIMARY KEY (user_id, library_id)
);

CREATE TABLE IF NOT EXISTS user_sharing_labels (
    user_id TEXT NOT NULL REFERENCES users(id),
    label TEXT NOT NULL,
    allow INTEGER NOT NULL,
    PRIMARY KEY (user_id, label, allow)
);

CREATE TABLE IF NOT EXISTS read_progress (
    book_id TEXT NOT NULL REFERENCES book(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    page INTEGER NOT NULL,
    completed INTEGER NOT NULL,
    read_date TEXT NOT NULL,
    device_id TEXT NOT NULL DEFAULT '',
    device_name TEXT NOT NULL DEFAULT '',
    locator TEXT,
    created_date TEXT NOT NULL,
    last_modified_date TEXT NOT NULL,
    PRIMARY KEY (book_id, user_id)
);

CREATE TABLE IF NOT EXISTS read_progress_series (
    series_id TEXT NOT NULL REFERENCES series(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    books_read INTEGER NOT NULL,
    books_unread INTEGER NOT NULL,
    books_in_progress INTEGER NOT NULL,
    PRIMARY KEY (series_id, user_id)
);

CREATE TABLE IF NOT EXISTS thumbnail_book (
    id TEXT PRIMARY KEY,
    book_id TEXT NOT NULL REFERENCES book(id),
    thumbnail BLOB,
    url TEXT,
    type TEXT NOT NULL,
    selected INTEGER NOT NULL DEFAULT 0,
    media_type TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS thumbnail_series (
    id TEXT PRIMARY KEY,
    series_id TEXT NOT NULL REFERENCES series(id),
    thumbnail BLOB,
    url TEXT,
    type TEXT NOT NULL,
    selected INTEGER NOT NULL DEFAULT 0,
    media_type TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS thumbnail_readlist (
    id TEXT PRIMARY KEY,
    readlist_id TEXT NOT NULL,
    thumbnail BLOB,
    url TEXT,
    type TEXT NOT NULL,
    selected INTEGER NOT NULL DEFAULT 0,
    media_type TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS thumbnail_collection (
    id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL,
    thumbnail BLOB,
    url TEXT,
    type TEXT NOT NULL,
    selected INTEGER NOT NULL DEFAULT 0,
    media_type TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS settings (
    version INTEGER PRIMARY KEY,
    offline_mode INTEGER NOT NULL DEFAULT 0,
    user_id TEXT,
    server_id TEXT,
    download_directory TEXT,
    last_read_progress_sync TEXT,
    last_full_sync TEXT
);

CREATE TABLE IF NOT EXISTS log_journal (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message TEXT NOT NULL,
    type TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    unique_name TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    error TEXT,
    not_before TEXT,
    created_date TEXT NOT NULL,
    updated_date TEXT NOT NULL
);

-- At most one selected thumbnail per owner
CREATE UNIQUE INDEX IF NOT EXISTS idx_thumbnail_book_selected ON thumbnail_book(book_id) WHERE selected = 1;
CREATE UNIQUE INDEX IF NOT EXISTS idx_thumbnail_series_selected ON thumbnail_series(series_id) WHERE selected = 1;
CREATE UNIQUE INDEX IF NOT EXISTS idx_thumbnail_readlist_selected ON thumbnail_readlist(readlist_id) WHERE selected = 1;
CREATE UNIQUE INDEX IF NOT EXISTS idx_thumbnail_collection_selected ON thumbnail_collection(collection_id) WHERE selected = 1;

CREATE INDEX IF NOT EXISTS idx_library_server ON library(media_server_id);
CREATE INDEX IF NOT EXISTS idx_series_library ON series(library_id);
CREATE INDEX IF NOT EXISTS idx_book_series ON book(series_id);
CREATE INDEX IF NOT EXISTS idx_book_library ON book(library_id);
CREATE INDEX IF NOT EXISTS idx_book_metadata_authors_book ON book_metadata_authors(book_id);
CREATE INDEX IF NOT EXISTS idx_read_progress_user ON read_progress(user_id);
CREATE INDEX IF NOT EXISTS idx_thumbnail_book_owner ON thumbnail_book(book_id);
CREATE INDEX IF NOT EXISTS idx_thumbnail_series_owner ON thumbnail_series(series_id);
CREATE INDEX IF NOT EXISTS idx_tasks_dequeue ON tasks(status, priority DESC, created_date ASC);
"#;

/// Run all pending database migrations
///
/// Applied versions are tracked in `schema_migrations`; each version runs in
/// its own transaction so a failure leaves the previous schema intact.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_TABLE).map_err(StorageError::Sqlite)?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(StorageError::Sqlite)?;

    info!(version = current_version, "Current replica schema version");

    if current_version < 1 {
        info!("Applying migration v1: Replica schema");
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    Ok(())
}

/// Apply a single migration
fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction().map_err(StorageError::Sqlite)?;

    tx.execute_batch(sql).map_err(|e| {
        warn!(version = version, error = %e, "Migration failed");
        StorageError::Sqlite(e)
    })?;

    tx.execute("INSERT INTO schema_migrations (version) VALUES (?)", [version])
        .map_err(StorageError::Sqlite)?;

    tx.commit().map_err(StorageError::Sqlite)?;

    info!(version = version, "Migration applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_selected_thumbnail_is_unique_per_owner() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO thumbnail_readlist (id, readlist_id, type, selected, media_type) VALUES ('t1', 'r1', 'GENERATED', 1, 'image/jpeg')",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO thumbnail_readlist (id, readlist_id, type, selected, media_type) VALUES ('t2', 'r1', 'USER_UPLOADED', 1, 'image/jpeg')",
            [],
        );
        assert!(second.is_err());

        // unselected siblings are fine
        conn.execute(
            "INSERT INTO thumbnail_readlist (id, readlist_id, type, selected, media_type) VALUES ('t3', 'r1', 'USER_UPLOADED', 0, 'image/jpeg')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_parent_delete_with_children_fails() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&mut conn).unwrap();

        conn.execute("INSERT INTO media_server (id, base_url) VALUES ('s', 'http://x')", []).unwrap();
        conn.execute(
            "INSERT INTO library (id, media_server_id, name, root) VALUES ('l', 's', 'Comics', '/comics')",
            [],
        )
        .unwrap();

        assert!(conn.execute("DELETE FROM media_server WHERE id = 's'", []).is_err());
    }
}
