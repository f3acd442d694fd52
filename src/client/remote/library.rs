use super::RemoteClient;
use crate::client::LibraryClient;
use crate::core::error::Result;
use crate::db::models::{Library, LibraryCreation};
use async_trait::async_trait;
use reqwest::Method;

#[async_trait]
impl LibraryClient for RemoteClient {
    async fn get_libraries(&self) -> Result<Vec<Library>> {
        self.get_json(&["api", "v1", "libraries"], &[]).await
    }

    async fn get_library(&self, library_id: &str) -> Result<Library> {
        self.get_json(&["api", "v1", "libraries", library_id], &[]).await
    }

    async fn add_library(&self, library: LibraryCreation) -> Result<Library> {
        self.send_for(Method::POST, &["api", "v1", "libraries"], &library).await
    }

    async fn update_library(&self, library_id: &str, library: LibraryCreation) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "libraries", library_id], Some(&library))
            .await?;
        Ok(())
    }

    async fn delete_library(&self, library_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v1", "libraries", library_id], &[])
            .await
    }

    async fn scan_library(&self, library_id: &str, deep: bool) -> Result<()> {
        self.send_empty(
            Method::POST,
            &["api", "v1", "libraries", library_id, "scan"],
            &[("deep", deep.to_string())],
        )
        .await
    }

    async fn analyze_library(&self, library_id: &str) -> Result<()> {
        self.send_empty(Method::POST, &["api", "v1", "libraries", library_id, "analyze"], &[])
            .await
    }
}
