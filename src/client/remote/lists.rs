use super::{page_query, RemoteClient};
use crate::client::{CollectionClient, CollectionCreation, ReadListClient, ReadListCreation};
use crate::core::error::Result;
use crate::db::models::{Book, Collection, Page, PageRequest, ReadList, Series};
use async_trait::async_trait;
use reqwest::Method;

fn search_query(search: Option<String>, page: PageRequest) -> Vec<(&'static str, String)> {
    let mut params = page_query(page);
    if let Some(search) = search {
        params.push(("search", search));
    }
    params
}

#[async_trait]
impl CollectionClient for RemoteClient {
    async fn get_collections(&self, search: Option<String>, page: PageRequest) -> Result<Page<Collection>> {
        self.get_json(&["api", "v1", "collections"], &search_query(search, page)).await
    }

    async fn get_collection(&self, collection_id: &str) -> Result<Collection> {
        self.get_json(&["api", "v1", "collections", collection_id], &[]).await
    }

    async fn get_collection_series(&self, collection_id: &str, page: PageRequest) -> Result<Page<Series>> {
        self.get_json(&["api", "v1", "collections", collection_id, "series"], &page_query(page))
            .await
    }

    async fn add_collection(&self, collection: CollectionCreation) -> Result<Collection> {
        self.send_for(Method::POST, &["api", "v1", "collections"], &collection).await
    }

    async fn update_collection(&self, collection_id: &str, collection: CollectionCreation) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "collections", collection_id], Some(&collection))
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v1", "collections", collection_id], &[])
            .await
    }
}

#[async_trait]
impl ReadListClient for RemoteClient {
    async fn get_read_lists(&self, search: Option<String>, page: PageRequest) -> Result<Page<ReadList>> {
        self.get_json(&["api", "v1", "readlists"], &search_query(search, page)).await
    }

    async fn get_read_list(&self, read_list_id: &str) -> Result<ReadList> {
        self.get_json(&["api", "v1", "readlists", read_list_id], &[]).await
    }

    async fn get_read_list_books(&self, read_list_id: &str, page: PageRequest) -> Result<Page<Book>> {
        self.get_json(&["api", "v1", "readlists", read_list_id, "books"], &page_query(page))
            .await
    }

    async fn add_read_list(&self, read_list: ReadListCreation) -> Result<ReadList> {
        self.send_for(Method::POST, &["api", "v1", "readlists"], &read_list).await
    }

    async fn update_read_list(&self, read_list_id: &str, read_list: ReadListCreation) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "readlists", read_list_id], Some(&read_list))
            .await?;
        Ok(())
    }

    async fn delete_read_list(&self, read_list_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v1", "readlists", read_list_id], &[])
            .await
    }
}
