use super::{page_query, RemoteClient};
use crate::client::{BookClient, BookFile, BookFileSource};
use crate::core::error::{ReplicaError, Result};
use crate::db::models::{Book, BookMetadata, BookQuery, MediaPage, Page, PageRequest, ReadProgressUpdate, Thumbnail};
use crate::db::repository::book::Sibling;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Method;

#[async_trait]
impl BookClient for RemoteClient {
    async fn get_books_page(&self, query: BookQuery, page: PageRequest) -> Result<Page<Book>> {
        if let Some(series_id) = &query.series_id {
            return self.get_series_books_filtered(series_id, &query, page).await;
        }

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
        self.get_json(&["api", "v1", "books"], &params).await
    }

    async fn get_book(&self, book_id: &str) -> Result<Book> {
        self.get_json(&["api", "v1", "books", book_id], &[]).await
    }

    async fn get_sibling(&self, book_id: &str, direction: Sibling) -> Result<Option<Book>> {
        let which = match direction {
            Sibling::Previous => "previous",
            Sibling::Next => "next",
        };
        self.get_optional(&["api", "v1", "books", book_id, which]).await
    }

    async fn get_book_pages(&self, book_id: &str) -> Result<Vec<MediaPage>> {
        self.get_json(&["api", "v1", "books", book_id, "pages"], &[]).await
    }

    async fn mark_read_progress(&self, book_id: &str, update: ReadProgressUpdate) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "books", book_id, "read-progress"], Some(&update))
            .await?;
        Ok(())
    }

    async fn delete_read_progress(&self, book_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v1", "books", book_id, "read-progress"], &[])
            .await
    }

    async fn update_book_metadata(&self, book_id: &str, metadata: BookMetadata) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "books", book_id, "metadata"], Some(&metadata))
            .await?;
        Ok(())
    }

    async fn get_book_thumbnails(&self, book_id: &str) -> Result<Vec<Thumbnail>> {
        self.get_json(&["api", "v1", "books", book_id, "thumbnails"], &[]).await
    }

    async fn get_book_thumbnail_data(&self, book_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        self.get_bytes(&["api", "v1", "books", book_id, "thumbnails", thumbnail_id])
            .await
    }

    async fn select_book_thumbnail(&self, book_id: &str, thumbnail_id: &str) -> Result<()> {
        self.send_empty(
            Method::PUT,
            &["api", "v1", "books", book_id, "thumbnails", thumbnail_id, "selected"],
            &[],
        )
        .await
    }

    async fn analyze_book(&self, book_id: &str) -> Result<()> {
        self.send_empty(Method::POST, &["api", "v1", "books", book_id, "analyze"], &[])
            .await
    }
}

impl RemoteClient {
    async fn get_series_books_filtered(&self, series_id: &str, query: &BookQuery, page: PageRequest) -> Result<Page<Book>> {
        let mut params = page_query(page);
        params.push(("sort", "metadata.numberSort,asc".to_string()));
        if !query.include_deleted {
            params.push(("deleted", "false".to_string()));
        }
        self.get_json(&["api", "v1", "series", series_id, "books"], &params).await
    }
}

#[async_trait]
impl BookFileSource for RemoteClient {
    async fn open_book_file(&self, book_id: &str) -> Result<BookFile> {
        let response = self
            .open_stream(&["api", "v1", "books", book_id, "file"], "*/*")
            .await?;
        let content_length = response.content_length();
        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes_stream().map_err(ReplicaError::from).boxed();

        Ok(BookFile { content_length, media_type, body })
    }
}
