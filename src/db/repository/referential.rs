//! Distinct metadata values across live series and books

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::Author;
use rusqlite::{params_from_iter, Connection};
use std::sync::Arc;

/// Run a single-column DISTINCT query, restricted to one library when given.
/// `sql` must alias a table carrying `library_id` as `s` and end with a
/// WHERE clause the library filter can be appended to.
fn distinct_values(conn: &Connection, sql: &str, library_id: Option<&str>) -> Result<Vec<String>> {
    let mut params: Vec<&str> = Vec::new();
    let mut sql = sql.to_string();
    if let Some(library_id) = library_id {
        sql.push_str(" AND s.library_id = ?");
        params.push(library_id);
    }
    sql.push_str(" ORDER BY 1 COLLATE NOCASE");

    let mut stmt = conn.prepare(&sql)?;
    let values = stmt
        .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values)
}

/// Read-only queries backing filter lists while offline
pub struct ReferentialRepository {
    db: Arc<DatabaseManager>,
}

impl ReferentialRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn authors(&self, search: Option<String>, library_id: Option<String>) -> Result<Vec<Author>> {
        self.db
            .execute(move |conn| {
                let mut sql = "SELECT DISTINCT a.name, a.role FROM book_metadata_authors a \
                               JOIN book b ON b.id = a.book_id WHERE b.deleted = 0"
                    .to_string();
                let mut params: Vec<String> = Vec::new();
                if let Some(search) = &search {
                    sql.push_str(" AND a.name LIKE ?");
                    params.push(format!("%{search}%"));
                }
                if let Some(library_id) = &library_id {
                    sql.push_str(" AND b.library_id = ?");
                    params.push(library_id.clone());
                }
                sql.push_str(" ORDER BY a.name COLLATE NOCASE, a.role");

                let mut stmt = conn.prepare(&sql)?;
                let authors = stmt
                    .query_map(params_from_iter(params.iter()), |row| {
                        Ok(Author { name: row.get(0)?, role: row.get(1)? })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(authors)
            })
            .await
    }

    pub async fn genres(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.db
            .execute(move |conn| {
                distinct_values(
                    conn,
                    "SELECT DISTINCT g.genre FROM series_genres g JOIN series s ON s.id = g.series_id \
                     WHERE s.deleted = 0",
                    library_id.as_deref(),
                )
            })
            .await
    }

    /// Series tags and book tags together
    pub async fn tags(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.db
            .execute(move |conn| {
                let mut tags = distinct_values(
                    conn,
                    "SELECT DISTINCT t.tag FROM series_tags t JOIN series s ON s.id = t.series_id \
                     WHERE s.deleted = 0",
                    library_id.as_deref(),
                )?;
                tags.extend(distinct_values(
                    conn,
                    "SELECT DISTINCT t.tag FROM book_metadata_tags t JOIN book s ON s.id = t.book_id \
                     WHERE s.deleted = 0",
                    library_id.as_deref(),
                )?);
                tags.sort_by_key(|t| t.to_lowercase());
                tags.dedup();
                Ok(tags)
            })
            .await
    }

    pub async fn languages(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.series_metadata_values("language", library_id).await
    }

    pub async fn publishers(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.series_metadata_values("publisher", library_id).await
    }

    pub async fn age_ratings(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.db
            .execute(move |conn| {
                let mut sql = "SELECT DISTINCT m.age_rating FROM series_metadata m \
                               JOIN series s ON s.id = m.series_id \
                               WHERE s.deleted = 0 AND m.age_rating IS NOT NULL"
                    .to_string();
                let mut params: Vec<String> = Vec::new();
                if let Some(library_id) = &library_id {
                    sql.push_str(" AND s.library_id = ?");
                    params.push(library_id.clone());
                }
                sql.push_str(" ORDER BY m.age_rating");

                let mut stmt = conn.prepare(&sql)?;
                let ratings = stmt
                    .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
                    .map(|r| r.map(|v| v.to_string()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(ratings)
            })
            .await
    }

    async fn series_metadata_values(&self, column: &'static str, library_id: Option<String>) -> Result<Vec<String>> {
        self.db
            .execute(move |conn| {
                distinct_values(
                    conn,
                    &format!(
                        "SELECT DISTINCT m.{column} FROM series_metadata m \
                         JOIN series s ON s.id = m.series_id \
                         WHERE s.deleted = 0 AND m.{column} <> ''"
                    ),
                    library_id.as_deref(),
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{
        fixtures, BookRepository, LibraryRepository, Repository, SeriesRepository, ServerRepository,
    };

    async fn seeded() -> ReferentialRepository {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        ServerRepository::new(db.clone()).upsert(&fixtures::server()).await.unwrap();
        let libraries = LibraryRepository::new(db.clone());
        libraries.upsert(&fixtures::library("l1")).await.unwrap();
        libraries.upsert(&fixtures::library("l2")).await.unwrap();

        let series = SeriesRepository::new(db.clone());
        let mut other = fixtures::series("s2", "l2");
        other.metadata.genres = vec!["horror".to_string()];
        other.metadata.language = "fr".to_string();
        other.metadata.age_rating = Some(16);
        series.upsert_page(vec![fixtures::series("s1", "l1"), other]).await.unwrap();

        let books = BookRepository::new(db.clone());
        books
            .upsert_page(vec![fixtures::book("b1", "s1", "l1", 1), fixtures::book("b2", "s2", "l2", 2)])
            .await
            .unwrap();
        books.delete("b2").await.unwrap();

        ReferentialRepository::new(db)
    }

    #[tokio::test]
    async fn test_distinct_values_by_library() {
        let repo = seeded().await;

        assert_eq!(repo.genres(None).await.unwrap(), vec!["fantasy", "horror"]);
        assert_eq!(repo.genres(Some("l1".to_string())).await.unwrap(), vec!["fantasy"]);
        assert_eq!(repo.languages(None).await.unwrap(), vec!["en", "fr"]);
        assert_eq!(repo.publishers(Some("l2".to_string())).await.unwrap(), vec!["Dark Horse"]);
        assert_eq!(repo.age_ratings(None).await.unwrap(), vec!["16"]);
        assert_eq!(
            repo.tags(Some("l1".to_string())).await.unwrap(),
            vec!["color", "ongoing", "tag1"]
        );
    }

    #[tokio::test]
    async fn test_authors_skip_deleted_books() {
        let repo = seeded().await;
        let authors = repo.authors(Some("an".to_string()), None).await.unwrap();
        assert_eq!(authors, vec![Author { name: "Ann".to_string(), role: "writer".to_string() }]);
        assert!(repo.authors(None, Some("l2".to_string())).await.unwrap().is_empty());
    }
}
