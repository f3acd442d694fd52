//! Series aggregate: series row, 1:1 metadata, tag/genre/title/link/label
//! sets and the series-scoped metadata aggregation.

use super::{cascade, load_strings, replace_strings, Repository};
use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{
    date_to_sql, opt_date_column, ts_column, ts_to_sql, AlternateTitle, Author, MetadataAggregation,
    Page, PageRequest, Series, SeriesMetadata, SeriesQuery, WebLink,
};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Arc;

const SERIES_SELECT: &str = "SELECT s.id, s.library_id, s.name, s.url, s.book_count, s.deleted, \
     s.oneshot, s.created_date, s.last_modified_date, s.file_last_modified, \
     m.status, m.status_lock, m.title, m.title_lock, m.title_sort, m.title_sort_lock, \
     m.summary, m.summary_lock, m.reading_direction, m.reading_direction_lock, \
     m.publisher, m.publisher_lock, m.age_rating, m.age_rating_lock, m.language, m.language_lock, \
     m.genres_lock, m.tags_lock, m.total_book_count, m.total_book_count_lock, \
     m.sharing_labels_lock, m.links_lock, m.alternate_titles_lock \
     FROM series s JOIN series_metadata m ON m.series_id = s.id";

fn map_series(row: &rusqlite::Row<'_>) -> rusqlite::Result<Series> {
    let last_modified = ts_column(row, 8)?;
    Ok(Series {
        id: row.get(0)?,
        library_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        book_count: row.get(4)?,
        deleted: row.get(5)?,
        oneshot: row.get(6)?,
        created_date: ts_column(row, 7)?,
        last_modified_date: last_modified,
        file_last_modified: ts_column(row, 9)?,
        metadata: SeriesMetadata {
            status: row.get(10)?,
            status_lock: row.get(11)?,
            title: row.get(12)?,
            title_lock: row.get(13)?,
            title_sort: row.get(14)?,
            title_sort_lock: row.get(15)?,
            summary: row.get(16)?,
            summary_lock: row.get(17)?,
            reading_direction: row.get(18)?,
            reading_direction_lock: row.get(19)?,
            publisher: row.get(20)?,
            publisher_lock: row.get(21)?,
            age_rating: row.get(22)?,
            age_rating_lock: row.get(23)?,
            language: row.get(24)?,
            language_lock: row.get(25)?,
            genres: Vec::new(),
            genres_lock: row.get(26)?,
            tags: Vec::new(),
            tags_lock: row.get(27)?,
            total_book_count: row.get(28)?,
            total_book_count_lock: row.get(29)?,
            sharing_labels: Vec::new(),
            sharing_labels_lock: row.get(30)?,
            links: Vec::new(),
            links_lock: row.get(31)?,
            alternate_titles: Vec::new(),
            alternate_titles_lock: row.get(32)?,
        },
        aggregation: MetadataAggregation {
            authors: Vec::new(),
            tags: Vec::new(),
            release_date: None,
            summary: String::new(),
            summary_number: String::new(),
            last_modified_date: last_modified,
        },
    })
}

/// Fill child collections and the aggregation of a series loaded by `map_series`
fn hydrate(conn: &Connection, series: &mut Series) -> Result<()> {
    let id = series.id.as_str();
    series.metadata.tags = load_strings(conn, "series_tags", "series_id", id, "tag")?;
    series.metadata.genres = load_strings(conn, "series_genres", "series_id", id, "genre")?;
    series.metadata.sharing_labels =
        load_strings(conn, "series_sharing_labels", "series_id", id, "label")?;

    let mut stmt = conn.prepare("SELECT label, url FROM series_links WHERE series_id = ? ORDER BY rowid")?;
    series.metadata.links = stmt
        .query_map([id], |row| Ok(WebLink { label: row.get(0)?, url: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn
        .prepare("SELECT label, title FROM series_alternate_titles WHERE series_id = ? ORDER BY rowid")?;
    series.metadata.alternate_titles = stmt
        .query_map([id], |row| Ok(AlternateTitle { label: row.get(0)?, title: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some(aggregation) = read_aggregation(conn, id)? {
        series.aggregation = aggregation;
    }
    Ok(())
}

pub(crate) fn read_series(conn: &Connection, id: &str) -> Result<Option<Series>> {
    let series = conn
        .query_row(&format!("{SERIES_SELECT} WHERE s.id = ?"), [id], map_series)
        .optional()?;
    match series {
        Some(mut series) => {
            hydrate(conn, &mut series)?;
            Ok(Some(series))
        }
        None => Ok(None),
    }
}

pub(crate) fn write_series(conn: &Connection, series: &Series) -> Result<()> {
    conn.execute(
        "INSERT INTO series (id, library_id, name, url, book_count, deleted, oneshot, \
         created_date, last_modified_date, file_last_modified) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(id) DO UPDATE SET library_id = excluded.library_id, name = excluded.name, \
         url = excluded.url, book_count = excluded.book_count, deleted = excluded.deleted, \
         oneshot = excluded.oneshot, created_date = excluded.created_date, \
         last_modified_date = excluded.last_modified_date, \
         file_last_modified = excluded.file_last_modified",
        params![
            series.id,
            series.library_id,
            series.name,
            series.url,
            series.book_count,
            series.deleted,
            series.oneshot,
            ts_to_sql(&series.created_date),
            ts_to_sql(&series.last_modified_date),
            ts_to_sql(&series.file_last_modified),
        ],
    )?;

    let m = &series.metadata;
    conn.execute(
        "INSERT OR REPLACE INTO series_metadata (series_id, status, status_lock, title, title_lock, \
         title_sort, title_sort_lock, summary, summary_lock, reading_direction, reading_direction_lock, \
         publisher, publisher_lock, age_rating, age_rating_lock, language, language_lock, \
         genres_lock, tags_lock, total_book_count, total_book_count_lock, sharing_labels_lock, \
         links_lock, alternate_titles_lock) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
         ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            series.id,
            m.status,
            m.status_lock,
            m.title,
            m.title_lock,
            m.title_sort,
            m.title_sort_lock,
            m.summary,
            m.summary_lock,
            m.reading_direction,
            m.reading_direction_lock,
            m.publisher,
            m.publisher_lock,
            m.age_rating,
            m.age_rating_lock,
            m.language,
            m.language_lock,
            m.genres_lock,
            m.tags_lock,
            m.total_book_count,
            m.total_book_count_lock,
            m.sharing_labels_lock,
            m.links_lock,
            m.alternate_titles_lock,
        ],
    )?;

    replace_strings(conn, "series_tags", "series_id", &series.id, "tag", &m.tags)?;
    replace_strings(conn, "series_genres", "series_id", &series.id, "genre", &m.genres)?;
    replace_strings(
        conn,
        "series_sharing_labels",
        "series_id",
        &series.id,
        "label",
        &m.sharing_labels,
    )?;

    conn.execute("DELETE FROM series_links WHERE series_id = ?", [&series.id])?;
    for link in &m.links {
        conn.execute(
            "INSERT INTO series_links (series_id, label, url) VALUES (?, ?, ?)",
            [&series.id, &link.label, &link.url],
        )?;
    }

    conn.execute("DELETE FROM series_alternate_titles WHERE series_id = ?", [&series.id])?;
    for title in &m.alternate_titles {
        conn.execute(
            "INSERT INTO series_alternate_titles (series_id, label, title) VALUES (?, ?, ?)",
            [&series.id, &title.label, &title.title],
        )?;
    }

    write_aggregation(conn, &series.id, &series.aggregation)
}

pub(crate) fn read_aggregation(conn: &Connection, series_id: &str) -> Result<Option<MetadataAggregation>> {
    let aggregation = conn
        .query_row(
            "SELECT release_date, summary, summary_number, last_modified_date \
             FROM metadata_aggregation WHERE series_id = ?",
            [series_id],
            |row| {
                Ok(MetadataAggregation {
                    authors: Vec::new(),
                    tags: Vec::new(),
                    release_date: opt_date_column(row, 0)?,
                    summary: row.get(1)?,
                    summary_number: row.get(2)?,
                    last_modified_date: ts_column(row, 3)?,
                })
            },
        )
        .optional()?;

    let Some(mut aggregation) = aggregation else {
        return Ok(None);
    };

    aggregation.tags = load_strings(conn, "metadata_aggregation_tags", "series_id", series_id, "tag")?;
    let mut stmt = conn.prepare(
        "SELECT name, role FROM metadata_aggregation_authors WHERE series_id = ? ORDER BY rowid",
    )?;
    aggregation.authors = stmt
        .query_map([series_id], |row| Ok(Author { name: row.get(0)?, role: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(aggregation))
}

pub(crate) fn write_aggregation(
    conn: &Connection,
    series_id: &str,
    aggregation: &MetadataAggregation,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata_aggregation \
         (series_id, release_date, summary, summary_number, last_modified_date) \
         VALUES (?, ?, ?, ?, ?)",
        params![
            series_id,
            date_to_sql(&aggregation.release_date),
            aggregation.summary,
            aggregation.summary_number,
            ts_to_sql(&aggregation.last_modified_date),
        ],
    )?;

    replace_strings(conn, "metadata_aggregation_tags", "series_id", series_id, "tag", &aggregation.tags)?;

    conn.execute("DELETE FROM metadata_aggregation_authors WHERE series_id = ?", [series_id])?;
    for author in &aggregation.authors {
        conn.execute(
            "INSERT OR IGNORE INTO metadata_aggregation_authors (series_id, name, role) VALUES (?, ?, ?)",
            params![series_id, author.name, author.role],
        )?;
    }
    Ok(())
}

/// Soft-delete the live series of a library that are not in `seen`,
/// together with their books. Returns the series ids that were flagged.
pub(crate) fn soft_delete_unseen(conn: &Connection, library_id: &str, seen: &[String]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM series WHERE library_id = ? AND deleted = 0")?;
    let current = stmt
        .query_map([library_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let gone: Vec<String> = current.into_iter().filter(|id| !seen.contains(id)).collect();
    for id in &gone {
        mark_deleted(conn, id)?;
    }
    Ok(gone)
}

pub(crate) fn mark_deleted(conn: &Connection, series_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE series SET deleted = 1 WHERE id = ? AND deleted = 0",
        [series_id],
    )?;
    conn.execute(
        "UPDATE book SET deleted = 1, remote_unavailable = 1 WHERE series_id = ?",
        [series_id],
    )?;
    Ok(changed > 0)
}

/// Repository for Series aggregates
pub struct SeriesRepository {
    db: Arc<DatabaseManager>,
}

impl SeriesRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Write a whole page of series atomically
    pub async fn upsert_page(&self, page: Vec<Series>) -> Result<()> {
        self.db
            .transaction(move |tx| {
                for series in &page {
                    write_series(tx, series)?;
                }
                Ok(())
            })
            .await
    }

    /// Paged, filtered listing ordered by sort title
    pub async fn list(&self, query: SeriesQuery, request: PageRequest) -> Result<Page<Series>> {
        self.db
            .execute(move |conn| {
                let mut clauses: Vec<String> = Vec::new();
                let mut params: Vec<String> = Vec::new();

                if !query.include_deleted {
                    clauses.push("s.deleted = 0".to_string());
                }
                if !query.library_ids.is_empty() {
                    let marks = vec!["?"; query.library_ids.len()].join(", ");
                    clauses.push(format!("s.library_id IN ({marks})"));
                    params.extend(query.library_ids.iter().cloned());
                }
                if let Some(search) = &query.search {
                    clauses.push("(s.name LIKE ? OR m.title LIKE ?)".to_string());
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
                        "SELECT COUNT(*) FROM series s JOIN series_metadata m ON m.series_id = s.id{filter}"
                    ),
                    params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;

                let sql = format!(
                    "{SERIES_SELECT}{filter} ORDER BY m.title_sort COLLATE NOCASE, s.id LIMIT {} OFFSET {}",
                    request.size,
                    request.offset()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params.iter()), map_series)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut content = Vec::with_capacity(rows.len());
                for mut series in rows {
                    hydrate(conn, &mut series)?;
                    content.push(series);
                }
                Ok(Page::from_parts(content, request, total as u64))
            })
            .await
    }

    /// See [`soft_delete_unseen`]
    pub async fn soft_delete_unseen(&self, library_id: &str, seen: Vec<String>) -> Result<Vec<String>> {
        let library_id = library_id.to_string();
        self.db
            .transaction(move |tx| soft_delete_unseen(tx, &library_id, &seen))
            .await
    }

    /// Soft-delete one series and its books. Returns false if it was
    /// unknown or already deleted.
    pub async fn mark_deleted(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.transaction(move |tx| mark_deleted(tx, &id)).await
    }

    /// Remove every soft-deleted series for good. Returns removed download paths.
    pub async fn purge_deleted(&self) -> Result<Vec<String>> {
        self.db
            .transaction(|tx| {
                let mut stmt = tx.prepare("SELECT id FROM series WHERE deleted = 1")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut files = Vec::new();
                for id in ids {
                    files.extend(cascade::delete_series(tx, &id)?);
                }
                Ok(files)
            })
            .await
    }
}

#[async_trait]
impl Repository<Series> for SeriesRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Series>> {
        let id = id.to_string();
        self.db.execute(move |conn| read_series(conn, &id)).await
    }

    async fn find_all(&self) -> Result<Vec<Series>> {
        let page = self
            .list(SeriesQuery::default(), PageRequest::new(0, u32::MAX))
            .await?;
        Ok(page.content)
    }

    async fn upsert(&self, series: &Series) -> Result<()> {
        self.upsert_page(vec![series.clone()]).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| cascade::delete_series(tx, &id).map(|_| ()))
            .await
    }
}
