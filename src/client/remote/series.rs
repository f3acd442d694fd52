use super::{page_query, RemoteClient};
use crate::client::SeriesClient;
use crate::core::error::Result;
use crate::db::models::{Book, Page, PageRequest, Series, SeriesMetadata, SeriesQuery, Thumbnail};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;

pub(super) fn series_query(query: &SeriesQuery, page: PageRequest) -> Vec<(&'static str, String)> {
    let mut params = page_query(page);
    for library_id in &query.library_ids {
        params.push(("library_id", library_id.clone()));
    }
    if let Some(search) = &query.search {
        params.push(("search", search.clone()));
    }
    if !query.include_deleted {
        params.push(("deleted", "false".to_string()));
    }
    params
}

#[async_trait]
impl SeriesClient for RemoteClient {
    async fn get_series_page(&self, query: SeriesQuery, page: PageRequest) -> Result<Page<Series>> {
        self.get_json(&["api", "v1", "series"], &series_query(&query, page)).await
    }

    async fn get_series(&self, series_id: &str) -> Result<Series> {
        self.get_json(&["api", "v1", "series", series_id], &[]).await
    }

    async fn get_series_books(&self, series_id: &str, page: PageRequest) -> Result<Page<Book>> {
        let mut query = page_query(page);
        query.push(("sort", "metadata.numberSort,asc".to_string()));
        self.get_json(&["api", "v1", "series", series_id, "books"], &query).await
    }

    async fn mark_read(&self, series_id: &str) -> Result<()> {
        self.send_empty(Method::POST, &["api", "v1", "series", series_id, "read-progress"], &[])
            .await
    }

    async fn mark_unread(&self, series_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v1", "series", series_id, "read-progress"], &[])
            .await
    }

    async fn update_series_metadata(&self, series_id: &str, metadata: SeriesMetadata) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "series", series_id, "metadata"], Some(&metadata))
            .await?;
        Ok(())
    }

    async fn get_series_thumbnails(&self, series_id: &str) -> Result<Vec<Thumbnail>> {
        self.get_json(&["api", "v1", "series", series_id, "thumbnails"], &[]).await
    }

    async fn get_series_thumbnail_data(&self, series_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        self.get_bytes(&["api", "v1", "series", series_id, "thumbnails", thumbnail_id])
            .await
    }

    async fn select_series_thumbnail(&self, series_id: &str, thumbnail_id: &str) -> Result<()> {
        self.send_empty(
            Method::PUT,
            &["api", "v1", "series", series_id, "thumbnails", thumbnail_id, "selected"],
            &[],
        )
        .await
    }

    async fn analyze_series(&self, series_id: &str) -> Result<()> {
        self.send_empty(Method::POST, &["api", "v1", "series", series_id, "analyze"], &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_query_params() {
        let query = SeriesQuery {
            library_ids: vec!["l1".to_string(), "l2".to_string()],
            search: Some("saga".to_string()),
            include_deleted: false,
        };
        let params = series_query(&query, PageRequest::new(2, 50));
        assert_eq!(
            params,
            vec![
                ("page", "2".to_string()),
                ("size", "50".to_string()),
                ("library_id", "l1".to_string()),
                ("library_id", "l2".to_string()),
                ("search", "saga".to_string()),
                ("deleted", "false".to_string()),
            ]
        );
    }
}
