use super::{OfflineClient, OFFLINE_DEVICE_NAME};
use crate::client::{unsupported_offline, BookClient, SeriesClient};
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::EventKind;
use crate::core::task_queue::Operation;
use crate::db::models::{
    Book, BookMetadata, BookQuery, MediaPage, Page, PageRequest, ReadProgressUpdate, Series, SeriesMetadata,
    SeriesQuery, Thumbnail, ThumbnailOwner,
};
use crate::db::repository::book::Sibling;
use async_trait::async_trait;
use bytes::Bytes;

impl OfflineClient {
    async fn thumbnail_data(&self, owner: ThumbnailOwner, owner_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        let thumbnail = self
            .thumbnails
            .get(owner, thumbnail_id)
            .await?
            .filter(|t| t.owner_id == owner_id);
        match thumbnail.and_then(|t| t.data) {
            Some(data) => Ok(Bytes::from(data)),
            None => Err(ReplicaError::NotFound(format!("thumbnail {thumbnail_id}"))),
        }
    }

    async fn progress_changed(&self, book_id: &str, series_id: &str) {
        self.notify(EventKind::ReadProgressChanged {
            book_id: book_id.to_string(),
            series_id: Some(series_id.to_string()),
            user_id: self.user_id.clone(),
        })
        .await;
    }
}

#[async_trait]
impl SeriesClient for OfflineClient {
    async fn get_series_page(&self, query: SeriesQuery, page: PageRequest) -> Result<Page<Series>> {
        self.series.list(query, page).await
    }

    async fn get_series(&self, series_id: &str) -> Result<Series> {
        self.load_series(series_id).await
    }

    async fn get_series_books(&self, series_id: &str, page: PageRequest) -> Result<Page<Book>> {
        let query = BookQuery {
            series_id: Some(series_id.to_string()),
            ..BookQuery::default()
        };
        self.books.list(query, page, Some(self.user_id.clone())).await
    }

    async fn mark_read(&self, series_id: &str) -> Result<()> {
        self.load_series(series_id).await?;
        let changed = self
            .progress
            .mark_series(series_id, &self.user_id, true, OFFLINE_DEVICE_NAME)
            .await?;
        for book_id in changed {
            self.queue_write(Operation::PushReadProgress {
                book_id: book_id.clone(),
                user_id: self.user_id.clone(),
            })
            .await?;
            self.progress_changed(&book_id, series_id).await;
        }
        Ok(())
    }

    async fn mark_unread(&self, series_id: &str) -> Result<()> {
        self.load_series(series_id).await?;
        let changed = self
            .progress
            .mark_series(series_id, &self.user_id, false, OFFLINE_DEVICE_NAME)
            .await?;
        for book_id in changed {
            self.queue_write(Operation::DeleteReadProgress {
                book_id: book_id.clone(),
                user_id: self.user_id.clone(),
            })
            .await?;
            self.progress_changed(&book_id, series_id).await;
        }
        Ok(())
    }

    async fn update_series_metadata(&self, _series_id: &str, _metadata: SeriesMetadata) -> Result<()> {
        unsupported_offline("update_series_metadata")
    }

    async fn get_series_thumbnails(&self, series_id: &str) -> Result<Vec<Thumbnail>> {
        self.thumbnails.list(ThumbnailOwner::Series, series_id).await
    }

    async fn get_series_thumbnail_data(&self, series_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        self.thumbnail_data(ThumbnailOwner::Series, series_id, thumbnail_id).await
    }

    async fn select_series_thumbnail(&self, _series_id: &str, _thumbnail_id: &str) -> Result<()> {
        unsupported_offline("select_series_thumbnail")
    }

    async fn analyze_series(&self, _series_id: &str) -> Result<()> {
        unsupported_offline("analyze_series")
    }
}

#[async_trait]
impl BookClient for OfflineClient {
    async fn get_books_page(&self, query: BookQuery, page: PageRequest) -> Result<Page<Book>> {
        self.books.list(query, page, Some(self.user_id.clone())).await
    }

    async fn get_book(&self, book_id: &str) -> Result<Book> {
        self.load_book(book_id).await
    }

    async fn get_sibling(&self, book_id: &str, direction: Sibling) -> Result<Option<Book>> {
        self.load_book(book_id).await?;
        self.books.sibling(book_id, direction, Some(self.user_id.clone())).await
    }

    async fn get_book_pages(&self, book_id: &str) -> Result<Vec<MediaPage>> {
        Ok(self.load_book(book_id).await?.media.pages)
    }

    async fn mark_read_progress(&self, book_id: &str, update: ReadProgressUpdate) -> Result<()> {
        let book = self.load_book(book_id).await?;
        let progress = self
            .progress
            .mark(book_id, &self.user_id, update, OFFLINE_DEVICE_NAME)
            .await?;
        tracing::debug!(book_id = %book_id, page = progress.page, completed = progress.completed, "Progress stored offline");

        self.queue_write(Operation::PushReadProgress {
            book_id: book_id.to_string(),
            user_id: self.user_id.clone(),
        })
        .await?;
        self.progress_changed(book_id, &book.series_id).await;
        Ok(())
    }

    async fn delete_read_progress(&self, book_id: &str) -> Result<()> {
        let book = self.load_book(book_id).await?;
        if !self.progress.delete(book_id, &self.user_id).await? {
            return Ok(());
        }

        self.queue_write(Operation::DeleteReadProgress {
            book_id: book_id.to_string(),
            user_id: self.user_id.clone(),
        })
        .await?;
        self.progress_changed(book_id, &book.series_id).await;
        Ok(())
    }

    async fn update_book_metadata(&self, _book_id: &str, _metadata: BookMetadata) -> Result<()> {
        unsupported_offline("update_book_metadata")
    }

    async fn get_book_thumbnails(&self, book_id: &str) -> Result<Vec<Thumbnail>> {
        self.thumbnails.list(ThumbnailOwner::Book, book_id).await
    }

    async fn get_book_thumbnail_data(&self, book_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        self.thumbnail_data(ThumbnailOwner::Book, book_id, thumbnail_id).await
    }

    async fn select_book_thumbnail(&self, _book_id: &str, _thumbnail_id: &str) -> Result<()> {
        unsupported_offline("select_book_thumbnail")
    }

    async fn analyze_book(&self, _book_id: &str) -> Result<()> {
        unsupported_offline("analyze_book")
    }
}
