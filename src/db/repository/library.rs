//! Library aggregate (library row + exclusion patterns)

use super::{cascade, load_strings, replace_strings, series, Repository};
use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::Library;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

const LIBRARY_COLUMNS: &str = "id, media_server_id, name, root, import_comicinfo_book, \
     import_comicinfo_series, import_comicinfo_collection, import_comicinfo_readlist, \
     import_epub_book, import_epub_series, import_local_artwork, import_barcode_isbn, \
     scan_force_modified_time, scan_on_startup, scan_interval, hash_files, hash_pages, \
     analyze_dimensions, oneshots_directory, unavailable";

fn map_library(row: &rusqlite::Row<'_>) -> rusqlite::Result<Library> {
    Ok(Library {
        id: row.get(0)?,
        media_server_id: row.get(1)?,
        name: row.get(2)?,
        root: row.get(3)?,
        import_comicinfo_book: row.get(4)?,
        import_comicinfo_series: row.get(5)?,
        import_comicinfo_collection: row.get(6)?,
        import_comicinfo_readlist: row.get(7)?,
        import_epub_book: row.get(8)?,
        import_epub_series: row.get(9)?,
        import_local_artwork: row.get(10)?,
        import_barcode_isbn: row.get(11)?,
        scan_force_modified_time: row.get(12)?,
        scan_on_startup: row.get(13)?,
        scan_interval: row.get(14)?,
        hash_files: row.get(15)?,
        hash_pages: row.get(16)?,
        analyze_dimensions: row.get(17)?,
        oneshots_directory: row.get(18)?,
        unavailable: row.get(19)?,
        scan_directory_exclusions: Vec::new(),
    })
}

pub(crate) fn write_library(conn: &Connection, library: &Library) -> Result<()> {
    conn.execute(
        "INSERT INTO library (id, media_server_id, name, root, import_comicinfo_book, \
         import_comicinfo_series, import_comicinfo_collection, import_comicinfo_readlist, \
         import_epub_book, import_epub_series, import_local_artwork, import_barcode_isbn, \
         scan_force_modified_time, scan_on_startup, scan_interval, hash_files, hash_pages, \
         analyze_dimensions, oneshots_directory, unavailable) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20) \
         ON CONFLICT(id) DO UPDATE SET \
         media_server_id = excluded.media_server_id, name = excluded.name, root = excluded.root, \
         import_comicinfo_book = excluded.import_comicinfo_book, \
         import_comicinfo_series = excluded.import_comicinfo_series, \
         import_comicinfo_collection = excluded.import_comicinfo_collection, \
         import_comicinfo_readlist = excluded.import_comicinfo_readlist, \
         import_epub_book = excluded.import_epub_book, import_epub_series = excluded.import_epub_series, \
         import_local_artwork = excluded.import_local_artwork, \
         import_barcode_isbn = excluded.import_barcode_isbn, \
         scan_force_modified_time = excluded.scan_force_modified_time, \
         scan_on_startup = excluded.scan_on_startup, scan_interval = excluded.scan_interval, \
         hash_files = excluded.hash_files, hash_pages = excluded.hash_pages, \
         analyze_dimensions = excluded.analyze_dimensions, \
         oneshots_directory = excluded.oneshots_directory, unavailable = excluded.unavailable",
        params![
            library.id,
            library.media_server_id,
            library.name,
            library.root,
            library.import_comicinfo_book,
            library.import_comicinfo_series,
            library.import_comicinfo_collection,
            library.import_comicinfo_readlist,
            library.import_epub_book,
            library.import_epub_series,
            library.import_local_artwork,
            library.import_barcode_isbn,
            library.scan_force_modified_time,
            library.scan_on_startup,
            library.scan_interval,
            library.hash_files,
            library.hash_pages,
            library.analyze_dimensions,
            library.oneshots_directory,
            library.unavailable,
        ],
    )?;

    replace_strings(
        conn,
        "library_exclusions",
        "library_id",
        &library.id,
        "pattern",
        &library.scan_directory_exclusions,
    )
}

pub(crate) fn read_library(conn: &Connection, id: &str) -> Result<Option<Library>> {
    let library = conn
        .query_row(
            &format!("SELECT {LIBRARY_COLUMNS} FROM library WHERE id = ?"),
            [id],
            map_library,
        )
        .optional()?;

    match library {
        Some(mut library) => {
            library.scan_directory_exclusions =
                load_strings(conn, "library_exclusions", "library_id", &library.id, "pattern")?;
            Ok(Some(library))
        }
        None => Ok(None),
    }
}

fn read_libraries(conn: &Connection, filter: &str, param: Option<&str>) -> Result<Vec<Library>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LIBRARY_COLUMNS} FROM library {filter} ORDER BY name"
    ))?;
    let rows = match param {
        Some(p) => stmt.query_map([p], map_library)?.collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map_library)?.collect::<std::result::Result<Vec<_>, _>>()?,
    };

    let mut libraries = Vec::with_capacity(rows.len());
    for mut library in rows {
        library.scan_directory_exclusions =
            load_strings(conn, "library_exclusions", "library_id", &library.id, "pattern")?;
        libraries.push(library);
    }
    Ok(libraries)
}

/// Repository for Library entities
pub struct LibraryRepository {
    db: Arc<DatabaseManager>,
}

impl LibraryRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Libraries of one server
    pub async fn find_by_server(&self, server_id: &str) -> Result<Vec<Library>> {
        let server_id = server_id.to_string();
        self.db
            .execute(move |conn| read_libraries(conn, "WHERE media_server_id = ?", Some(&server_id)))
            .await
    }

    /// Flag libraries of a server that the last listing no longer reported.
    /// Returns the ids that changed state.
    pub async fn mark_unavailable_except(&self, server_id: &str, seen: Vec<String>) -> Result<Vec<String>> {
        let server_id = server_id.to_string();
        self.db
            .transaction(move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT id FROM library WHERE media_server_id = ? AND unavailable = 0",
                )?;
                let current = stmt
                    .query_map([&server_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let gone: Vec<String> = current.into_iter().filter(|id| !seen.contains(id)).collect();
                for id in &gone {
                    tx.execute("UPDATE library SET unavailable = 1 WHERE id = ?", [id])?;
                }
                Ok(gone)
            })
            .await
    }

    /// Flag one library unavailable and soft-delete its series and books.
    /// Returns false if it was unknown or already unavailable.
    pub async fn mark_unavailable(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE library SET unavailable = 1 WHERE id = ? AND unavailable = 0",
                    [&id],
                )?;
                if changed == 0 {
                    return Ok(false);
                }
                series::soft_delete_unseen(tx, &id, &[])?;
                Ok(true)
            })
            .await
    }

    /// Delete a library, its series and books. Returns removed download paths.
    pub async fn purge(&self, id: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        self.db.transaction(move |tx| cascade::delete_library(tx, &id)).await
    }
}

#[async_trait]
impl Repository<Library> for LibraryRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Library>> {
        let id = id.to_string();
        self.db.execute(move |conn| read_library(conn, &id)).await
    }

    async fn find_all(&self) -> Result<Vec<Library>> {
        self.db.execute(|conn| read_libraries(conn, "", None)).await
    }

    async fn upsert(&self, library: &Library) -> Result<()> {
        let library = library.clone();
        self.db.transaction(move |tx| write_library(tx, &library)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.purge(id).await.map(|_| ())
    }
}
