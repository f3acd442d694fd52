//! Media server identity

use super::{cascade, Repository};
use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::MediaServer;
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use std::sync::Arc;

/// Repository for MediaServer entities
pub struct ServerRepository {
    db: Arc<DatabaseManager>,
}

impl ServerRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Find a server by its base URL
    pub async fn find_by_url(&self, base_url: &str) -> Result<Option<MediaServer>> {
        let base_url = base_url.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, base_url FROM media_server WHERE base_url = ?",
                        [&base_url],
                        |row| {
                            Ok(MediaServer {
                                id: row.get(0)?,
                                base_url: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }

    /// Delete a server and everything scoped to it. Returns the local
    /// download paths of the removed books.
    pub async fn purge(&self, id: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        self.db.transaction(move |tx| cascade::delete_server(tx, &id)).await
    }
}

#[async_trait]
impl Repository<MediaServer> for ServerRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<MediaServer>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, base_url FROM media_server WHERE id = ?",
                        [&id],
                        |row| {
                            Ok(MediaServer {
                                id: row.get(0)?,
                                base_url: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }

    async fn find_all(&self) -> Result<Vec<MediaServer>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT id, base_url FROM media_server ORDER BY base_url")?;
                let servers = stmt
                    .query_map([], |row| {
                        Ok(MediaServer {
                            id: row.get(0)?,
                            base_url: row.get(1)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(servers)
            })
            .await
    }

    async fn upsert(&self, server: &MediaServer) -> Result<()> {
        let server = server.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO media_server (id, base_url) VALUES (?, ?) \
                     ON CONFLICT(id) DO UPDATE SET base_url = excluded.base_url",
                    [&server.id, &server.base_url],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.purge(id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;
    use crate::db::repository::{LibraryRepository, UserRepository};

    #[tokio::test]
    async fn test_upsert_and_lookup_by_url() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = ServerRepository::new(db);

        let mut server = fixtures::server();
        repo.upsert(&server).await.unwrap();
        repo.upsert(&server).await.unwrap();
        assert_eq!(repo.find_all().await.unwrap().len(), 1);

        server.base_url = "https://komga.example.org".to_string();
        repo.upsert(&server).await.unwrap();
        let found = repo.find_by_url("https://komga.example.org").await.unwrap();
        assert_eq!(found, Some(server));
    }

    #[tokio::test]
    async fn test_purge_removes_scoped_entities() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let servers = ServerRepository::new(db.clone());
        let libraries = LibraryRepository::new(db.clone());
        let users = UserRepository::new(db.clone());

        servers.upsert(&fixtures::server()).await.unwrap();
        libraries.upsert(&fixtures::library("l1")).await.unwrap();
        users.upsert(&fixtures::user("u1")).await.unwrap();

        servers.delete("srv").await.unwrap();

        assert!(servers.find_by_id("srv").await.unwrap().is_none());
        assert!(libraries.find_all().await.unwrap().is_empty());
        assert!(users.find_by_id("u1").await.unwrap().is_none());
    }
}
