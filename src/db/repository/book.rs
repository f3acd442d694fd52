//! Book aggregate: book row, metadata with authors/tags/links, media with
//! its pages. Every write recomputes the owning series' metadata
//! aggregation and read counts in the same transaction.

use super::{cascade, load_strings, read_progress, replace_strings, series, Repository};
use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{
    date_to_sql, opt_date_column, opt_ts_column, ts_column, ts_to_sql, Author, Book, BookMetadata,
    BookQuery, Media, MediaPage, MetadataAggregation, Page, PageRequest, Timestamp, WebLink,
};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const BOOK_SELECT: &str = "SELECT b.id, b.series_id, b.library_id, b.name, b.url, b.number, \
     b.file_size, b.file_hash, b.deleted, b.oneshot, b.created_date, b.last_modified_date, \
     b.remote_file_last_modified, b.local_file_last_modified, b.remote_unavailable, \
     b.file_download_path, \
     m.title, m.title_lock, m.summary, m.summary_lock, m.number, m.number_lock, m.number_sort, \
     m.number_sort_lock, m.release_date, m.release_date_lock, m.isbn, m.isbn_lock, \
     m.authors_lock, m.tags_lock, m.links_lock, \
     md.status, md.media_type, md.media_profile, md.pages_count, md.comment, \
     md.epub_divina_compatible, md.epub_is_kepub, md.extension \
     FROM book b JOIN book_metadata m ON m.book_id = b.id JOIN media md ON md.book_id = b.id";

/// Direction for sibling lookups inside a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    Previous,
    Next,
}

fn map_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    let extension: Option<String> = row.get(38)?;
    let extension = extension
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(38, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Book {
        id: row.get(0)?,
        series_id: row.get(1)?,
        library_id: row.get(2)?,
        name: row.get(3)?,
        url: row.get(4)?,
        number: row.get(5)?,
        file_size: row.get(6)?,
        file_hash: row.get(7)?,
        deleted: row.get(8)?,
        oneshot: row.get(9)?,
        created_date: ts_column(row, 10)?,
        last_modified_date: ts_column(row, 11)?,
        remote_file_last_modified: ts_column(row, 12)?,
        local_file_last_modified: opt_ts_column(row, 13)?,
        remote_unavailable: row.get(14)?,
        file_download_path: row.get(15)?,
        metadata: BookMetadata {
            title: row.get(16)?,
            title_lock: row.get(17)?,
            summary: row.get(18)?,
            summary_lock: row.get(19)?,
            number: row.get(20)?,
            number_lock: row.get(21)?,
            number_sort: row.get(22)?,
            number_sort_lock: row.get(23)?,
            release_date: opt_date_column(row, 24)?,
            release_date_lock: row.get(25)?,
            isbn: row.get(26)?,
            isbn_lock: row.get(27)?,
            authors: Vec::new(),
            authors_lock: row.get(28)?,
            tags: Vec::new(),
            tags_lock: row.get(29)?,
            links: Vec::new(),
            links_lock: row.get(30)?,
        },
        media: Media {
            status: row.get(31)?,
            media_type: row.get(32)?,
            media_profile: row.get(33)?,
            pages_count: row.get(34)?,
            comment: row.get(35)?,
            epub_divina_compatible: row.get(36)?,
            epub_is_kepub: row.get(37)?,
            extension,
            pages: Vec::new(),
        },
        read_progress: None,
    })
}

fn hydrate(conn: &Connection, book: &mut Book, user_id: Option<&str>) -> Result<()> {
    let id = book.id.as_str();
    book.metadata.tags = load_strings(conn, "book_metadata_tags", "book_id", id, "tag")?;

    let mut stmt =
        conn.prepare("SELECT name, role FROM book_metadata_authors WHERE book_id = ? ORDER BY rowid")?;
    book.metadata.authors = stmt
        .query_map([id], |row| Ok(Author { name: row.get(0)?, role: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT label, url FROM book_metadata_links WHERE book_id = ? ORDER BY rowid")?;
    book.metadata.links = stmt
        .query_map([id], |row| Ok(WebLink { label: row.get(0)?, url: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    book.media.pages = read_pages(conn, id)?;

    if let Some(user_id) = user_id {
        book.read_progress = read_progress::read(conn, id, user_id)?;
    }
    Ok(())
}

fn read_pages(conn: &Connection, book_id: &str) -> Result<Vec<MediaPage>> {
    let mut stmt = conn.prepare(
        "SELECT number, file_name, media_type, width, height, size_bytes \
         FROM media_pages WHERE book_id = ? ORDER BY number",
    )?;
    let pages = stmt
        .query_map([book_id], |row| {
            Ok(MediaPage {
                number: row.get(0)?,
                file_name: row.get(1)?,
                media_type: row.get(2)?,
                width: row.get(3)?,
                height: row.get(4)?,
                size_bytes: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(pages)
}

/// Load one hydrated book, embedding `user_id`'s progress when given
pub(crate) fn read_book(conn: &Connection, id: &str, user_id: Option<&str>) -> Result<Option<Book>> {
    let book = conn
        .query_row(&format!("{BOOK_SELECT} WHERE b.id = ?"), [id], map_book)
        .optional()?;
    match book {
        Some(mut book) => {
            hydrate(conn, &mut book, user_id)?;
            Ok(Some(book))
        }
        None => Ok(None),
    }
}

/// Upsert one book without touching locally owned columns (download path,
/// local file timestamp). Does not recompute series roll-ups.
pub(crate) fn write_book(conn: &Connection, book: &Book) -> Result<()> {
    let previous_file: Option<String> = conn
        .query_row(
            "SELECT remote_file_last_modified FROM book WHERE id = ?",
            [&book.id],
            |row| row.get(0),
        )
        .optional()?;
    let file_changed = previous_file
        .map(|prev| prev != ts_to_sql(&book.remote_file_last_modified))
        .unwrap_or(false);

    conn.execute(
        "INSERT INTO book (id, series_id, library_id, name, url, number, file_size, file_hash, \
         deleted, oneshot, created_date, last_modified_date, remote_file_last_modified, remote_unavailable) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
         ON CONFLICT(id) DO UPDATE SET series_id = excluded.series_id, library_id = excluded.library_id, \
         name = excluded.name, url = excluded.url, number = excluded.number, \
         file_size = excluded.file_size, file_hash = excluded.file_hash, deleted = excluded.deleted, \
         oneshot = excluded.oneshot, created_date = excluded.created_date, \
         last_modified_date = excluded.last_modified_date, \
         remote_file_last_modified = excluded.remote_file_last_modified, \
         remote_unavailable = excluded.remote_unavailable",
        params![
            book.id,
            book.series_id,
            book.library_id,
            book.name,
            book.url,
            book.number,
            book.file_size,
            book.file_hash,
            book.deleted,
            book.oneshot,
            ts_to_sql(&book.created_date),
            ts_to_sql(&book.last_modified_date),
            ts_to_sql(&book.remote_file_last_modified),
            book.remote_unavailable,
        ],
    )?;

    let m = &book.metadata;
    conn.execute(
        "INSERT OR REPLACE INTO book_metadata (book_id, title, title_lock, summary, summary_lock, \
         number, number_lock, number_sort, number_sort_lock, release_date, release_date_lock, \
         isbn, isbn_lock, authors_lock, tags_lock, links_lock) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            book.id,
            m.title,
            m.title_lock,
            m.summary,
            m.summary_lock,
            m.number,
            m.number_lock,
            m.number_sort,
            m.number_sort_lock,
            date_to_sql(&m.release_date),
            m.release_date_lock,
            m.isbn,
            m.isbn_lock,
            m.authors_lock,
            m.tags_lock,
            m.links_lock,
        ],
    )?;

    replace_strings(conn, "book_metadata_tags", "book_id", &book.id, "tag", &m.tags)?;

    conn.execute("DELETE FROM book_metadata_authors WHERE book_id = ?", [&book.id])?;
    for author in &m.authors {
        conn.execute(
            "INSERT INTO book_metadata_authors (book_id, name, role) VALUES (?, ?, ?)",
            [&book.id, &author.name, &author.role],
        )?;
    }

    conn.execute("DELETE FROM book_metadata_links WHERE book_id = ?", [&book.id])?;
    for link in &m.links {
        conn.execute(
            "INSERT INTO book_metadata_links (book_id, label, url) VALUES (?, ?, ?)",
            [&book.id, &link.label, &link.url],
        )?;
    }

    let media = &book.media;
    let extension = media.extension.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO media (book_id, status, media_type, media_profile, pages_count, \
         comment, epub_divina_compatible, epub_is_kepub, extension) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            book.id,
            media.status,
            media.media_type,
            media.media_profile,
            media.pages_count,
            media.comment,
            media.epub_divina_compatible,
            media.epub_is_kepub,
            extension,
        ],
    )?;

    // Listings do not carry pages: keep the stored set unless the payload
    // brings a new one or the backing file changed underneath it.
    if !media.pages.is_empty() {
        write_pages(conn, &book.id, &media.pages)?;
    } else if file_changed {
        conn.execute("DELETE FROM media_pages WHERE book_id = ?", [&book.id])?;
    }

    Ok(())
}

pub(crate) fn write_pages(conn: &Connection, book_id: &str, pages: &[MediaPage]) -> Result<()> {
    conn.execute("DELETE FROM media_pages WHERE book_id = ?", [book_id])?;
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO media_pages (book_id, number, file_name, media_type, width, height, size_bytes) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for page in pages {
        stmt.execute(params![
            book_id,
            page.number,
            page.file_name,
            page.media_type,
            page.width,
            page.height,
            page.size_bytes,
        ])?;
    }
    Ok(())
}

/// Rebuild the metadata aggregation of a series from its live books.
///
/// Release date is the earliest book release date, summary the first
/// non-empty book summary in reading order, tags the union of book tags and
/// authors the distinct (name, role) pairs. The timestamp is the newest book
/// modification so that re-applying the same payload changes nothing.
pub(crate) fn recompute_aggregation(conn: &Connection, series_id: &str) -> Result<()> {
    let series_modified: Option<String> = conn
        .query_row(
            "SELECT last_modified_date FROM series WHERE id = ?",
            [series_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(series_modified) = series_modified else {
        return Ok(());
    };

    let (release_date, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(m.release_date), MAX(b.last_modified_date) FROM book b \
         JOIN book_metadata m ON m.book_id = b.id WHERE b.series_id = ? AND b.deleted = 0",
        [series_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let (summary, summary_number) = conn
        .query_row(
            "SELECT m.summary, m.number FROM book b JOIN book_metadata m ON m.book_id = b.id \
             WHERE b.series_id = ? AND b.deleted = 0 AND m.summary <> '' \
             ORDER BY m.number_sort, b.number LIMIT 1",
            [series_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?
        .unwrap_or_default();

    let mut stmt = conn.prepare(
        "SELECT DISTINCT t.tag FROM book_metadata_tags t JOIN book b ON b.id = t.book_id \
         WHERE b.series_id = ? AND b.deleted = 0",
    )?;
    let tags: BTreeSet<String> = stmt
        .query_map([series_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT a.name, a.role FROM book_metadata_authors a JOIN book b ON b.id = a.book_id \
         WHERE b.series_id = ? AND b.deleted = 0 ORDER BY a.role, a.name",
    )?;
    let authors = stmt
        .query_map([series_id], |row| Ok(Author { name: row.get(0)?, role: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let modified = newest.unwrap_or(series_modified);
    let aggregation = MetadataAggregation {
        authors,
        tags: tags.into_iter().collect(),
        release_date: release_date
            .and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        summary,
        summary_number,
        last_modified_date: chrono::DateTime::parse_from_rfc3339(&modified)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| crate::core::error::ReplicaError::corrupt("book", e))?,
    };

    series::write_aggregation(conn, series_id, &aggregation)
}

/// Recompute every roll-up that depends on the books of `series_id`
pub(crate) fn refresh_series_rollups(conn: &Connection, series_id: &str) -> Result<()> {
    recompute_aggregation(conn, series_id)?;
    read_progress::recompute_series_for_all_users(conn, series_id)
}

/// Soft-delete the live books of a series that are not in `seen`
pub(crate) fn soft_delete_unseen(conn: &Connection, series_id: &str, seen: &[String]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM book WHERE series_id = ? AND deleted = 0")?;
    let current = stmt
        .query_map([series_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let gone: Vec<String> = current.into_iter().filter(|id| !seen.contains(id)).collect();
    for id in &gone {
        conn.execute(
            "UPDATE book SET deleted = 1, remote_unavailable = 1 WHERE id = ?",
            [id],
        )?;
    }
    if !gone.is_empty() {
        refresh_series_rollups(conn, series_id)?;
    }
    Ok(gone)
}

/// Repository for Book aggregates
pub struct BookRepository {
    db: Arc<DatabaseManager>,
}

impl BookRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Write a page of books atomically, then refresh the roll-ups of every
    /// series the page touched
    pub async fn upsert_page(&self, page: Vec<Book>) -> Result<()> {
        self.db
            .transaction(move |tx| {
                let mut touched = BTreeSet::new();
                for book in &page {
                    write_book(tx, book)?;
                    touched.insert(book.series_id.clone());
                }
                for series_id in touched {
                    refresh_series_rollups(tx, &series_id)?;
                }
                Ok(())
            })
            .await
    }

    /// Find a book with `user_id`'s progress embedded
    pub async fn find_for_user(&self, id: &str, user_id: &str) -> Result<Option<Book>> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        self.db
            .execute(move |conn| read_book(conn, &id, Some(&user_id)))
            .await
    }

    /// Paged, filtered listing ordered by series then reading order
    pub async fn list(&self, query: BookQuery, request: PageRequest, user_id: Option<String>) -> Result<Page<Book>> {
        self.db
            .execute(move |conn| {
                let mut clauses: Vec<String> = Vec::new();
                let mut params: Vec<String> = Vec::new();

                if !query.include_deleted {
                    clauses.push("b.deleted = 0".to_string());
                }
                if !query.library_ids.is_empty() {
                    let marks = vec!["?"; query.library_ids.len()].join(", ");
                    clauses.push(format!("b.library_id IN ({marks})"));
                    params.extend(query.library_ids.iter().cloned());
                }
                if let Some(series_id) = &query.series_id {
                    clauses.push("b.series_id = ?".to_string());
                    params.push(series_id.clone());
                }
                if let Some(search) = &query.search {
                    clauses.push("(b.name LIKE ? OR m.title LIKE ?)".to_string());
                    let pattern = format!("%{search}%");
                    params.push(pattern.clone());
                    params.push(pattern);
                }

                let filter = if clauses.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", clauses.join(" AND "))
                };

                let total: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM book b JOIN book_metadata m ON m.book_id = b.id{filter}"
                    ),
                    params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;

                let sql = format!(
                    "{BOOK_SELECT}{filter} ORDER BY b.series_id, m.number_sort, b.number LIMIT {} OFFSET {}",
                    request.size,
                    request.offset()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params.iter()), map_book)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut content = Vec::with_capacity(rows.len());
                for mut book in rows {
                    hydrate(conn, &mut book, user_id.as_deref())?;
                    content.push(book);
                }
                Ok(Page::from_parts(content, request, total as u64))
            })
            .await
    }

    /// Previous or next live book of the same series in reading order
    pub async fn sibling(&self, id: &str, direction: Sibling, user_id: Option<String>) -> Result<Option<Book>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let (cmp, order) = match direction {
                    Sibling::Previous => ("<", "DESC"),
                    Sibling::Next => (">", "ASC"),
                };
                let sibling: Option<String> = conn
                    .query_row(
                        &format!(
                            "SELECT b.id FROM book b JOIN book_metadata m ON m.book_id = b.id \
                             JOIN book cur ON cur.series_id = b.series_id \
                             JOIN book_metadata cm ON cm.book_id = cur.id \
                             WHERE cur.id = ?1 AND b.deleted = 0 AND m.number_sort {cmp} cm.number_sort \
                             ORDER BY m.number_sort {order} LIMIT 1"
                        ),
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match sibling {
                    Some(sibling) => read_book(conn, &sibling, user_id.as_deref()),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Stored page count and remote file timestamp per book, for deciding
    /// which books need their page list fetched
    pub async fn stored_page_state(&self, ids: Vec<String>) -> Result<HashMap<String, (i64, Timestamp)>> {
        self.db
            .execute(move |conn| {
                let mut state = HashMap::new();
                let mut stmt = conn.prepare(
                    "SELECT b.remote_file_last_modified, \
                     (SELECT COUNT(*) FROM media_pages p WHERE p.book_id = b.id) \
                     FROM book b WHERE b.id = ?",
                )?;
                for id in ids {
                    let row = stmt
                        .query_row([&id], |row| Ok((ts_column(row, 0)?, row.get::<_, i64>(1)?)))
                        .optional()?;
                    if let Some((modified, count)) = row {
                        state.insert(id, (count, modified));
                    }
                }
                Ok(state)
            })
            .await
    }

    /// Replace the page list of one book
    pub async fn replace_pages(&self, book_id: &str, pages: Vec<MediaPage>) -> Result<()> {
        let book_id = book_id.to_string();
        self.db.transaction(move |tx| write_pages(tx, &book_id, &pages)).await
    }

    /// Soft-delete books of a series missing from the last listing
    pub async fn soft_delete_unseen(&self, series_id: &str, seen: Vec<String>) -> Result<Vec<String>> {
        let series_id = series_id.to_string();
        self.db
            .transaction(move |tx| soft_delete_unseen(tx, &series_id, &seen))
            .await
    }

    /// Soft-delete one book. Returns false if unknown or already deleted.
    pub async fn mark_deleted(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let series_id: Option<String> = tx
                    .query_row(
                        "SELECT series_id FROM book WHERE id = ? AND deleted = 0",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(series_id) = series_id else {
                    return Ok(false);
                };
                tx.execute(
                    "UPDATE book SET deleted = 1, remote_unavailable = 1 WHERE id = ?",
                    [&id],
                )?;
                refresh_series_rollups(tx, &series_id)?;
                Ok(true)
            })
            .await
    }

    /// Record a completed download
    pub async fn set_downloaded(&self, id: &str, path: &str, file_modified: Timestamp) -> Result<()> {
        let id = id.to_string();
        let path = path.to_string();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE book SET file_download_path = ?, local_file_last_modified = ? WHERE id = ?",
                    params![path, ts_to_sql(&file_modified), id],
                )?;
                if changed == 0 {
                    return Err(crate::core::error::ReplicaError::NotFound(format!("book {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Forget a local download. Returns the path that was recorded.
    pub async fn clear_download(&self, id: &str) -> Result<Option<String>> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let path: Option<String> = tx
                    .query_row("SELECT file_download_path FROM book WHERE id = ?", [&id], |row| row.get(0))
                    .optional()?
                    .flatten();
                tx.execute(
                    "UPDATE book SET file_download_path = NULL, local_file_last_modified = NULL WHERE id = ?",
                    [&id],
                )?;
                Ok(path)
            })
            .await
    }

    /// Ids of books with a local download
    pub async fn downloaded_ids(&self) -> Result<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM book WHERE file_download_path IS NOT NULL ORDER BY id",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Remove every soft-deleted book for good. Returns removed download paths.
    pub async fn purge_deleted(&self) -> Result<Vec<String>> {
        self.db
            .transaction(|tx| {
                let mut stmt = tx.prepare("SELECT id, series_id FROM book WHERE deleted = 1")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut files = Vec::new();
                let mut touched = BTreeSet::new();
                for (id, series_id) in rows {
                    files.extend(cascade::delete_book(tx, &id)?);
                    touched.insert(series_id);
                }
                for series_id in touched {
                    refresh_series_rollups(tx, &series_id)?;
                }
                Ok(files)
            })
            .await
    }
}

#[async_trait]
impl Repository<Book> for BookRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Book>> {
        let id = id.to_string();
        self.db.execute(move |conn| read_book(conn, &id, None)).await
    }

    async fn find_all(&self) -> Result<Vec<Book>> {
        let page = self
            .list(BookQuery::default(), PageRequest::new(0, u32::MAX), None)
            .await?;
        Ok(page.content)
    }

    async fn upsert(&self, book: &Book) -> Result<()> {
        self.upsert_page(vec![book.clone()]).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let series_id: Option<String> = tx
                    .query_row("SELECT series_id FROM book WHERE id = ?", [&id], |row| row.get(0))
                    .optional()?;
                cascade::delete_book(tx, &id)?;
                if let Some(series_id) = series_id {
                    refresh_series_rollups(tx, &series_id)?;
                }
                Ok(())
            })
            .await
    }
}
