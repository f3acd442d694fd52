//! Client facade
//!
//! One async trait per entity family. The network implementation in
//! [`remote`] and the replica implementation in [`offline`] share the exact
//! same signatures; a [`Session`](crate::core::session::Session) picks one
//! of them once and callers never branch on connectivity.

use crate::core::error::{ReplicaError, Result};
use crate::db::models::{
    Author, Book, BookMetadata, BookQuery, Collection, Library, LibraryCreation, MediaPage, Page,
    PageRequest, ReadList, ReadProgressUpdate, Series, SeriesMetadata, SeriesQuery, ServerSettings,
    Thumbnail, User,
};
use crate::db::repository::book::Sibling;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod offline;
pub mod remote;

#[cfg(test)]
pub(crate) mod fake;

pub use offline::OfflineClient;
pub use remote::{Credentials, RemoteClient};

#[async_trait]
pub trait LibraryClient: Send + Sync {
    async fn get_libraries(&self) -> Result<Vec<Library>>;

    async fn get_library(&self, library_id: &str) -> Result<Library>;

    async fn add_library(&self, library: LibraryCreation) -> Result<Library>;

    async fn update_library(&self, library_id: &str, library: LibraryCreation) -> Result<()>;

    async fn delete_library(&self, library_id: &str) -> Result<()>;

    async fn scan_library(&self, library_id: &str, deep: bool) -> Result<()>;

    async fn analyze_library(&self, library_id: &str) -> Result<()>;
}

#[async_trait]
pub trait SeriesClient: Send + Sync {
    async fn get_series_page(&self, query: SeriesQuery, page: PageRequest) -> Result<Page<Series>>;

    async fn get_series(&self, series_id: &str) -> Result<Series>;

    /// Books of one series in reading order
    async fn get_series_books(&self, series_id: &str, page: PageRequest) -> Result<Page<Book>>;

    async fn mark_read(&self, series_id: &str) -> Result<()>;

    async fn mark_unread(&self, series_id: &str) -> Result<()>;

    async fn update_series_metadata(&self, series_id: &str, metadata: SeriesMetadata) -> Result<()>;

    async fn get_series_thumbnails(&self, series_id: &str) -> Result<Vec<Thumbnail>>;

    async fn get_series_thumbnail_data(&self, series_id: &str, thumbnail_id: &str) -> Result<Bytes>;

    async fn select_series_thumbnail(&self, series_id: &str, thumbnail_id: &str) -> Result<()>;

    async fn analyze_series(&self, series_id: &str) -> Result<()>;
}

#[async_trait]
pub trait BookClient: Send + Sync {
    async fn get_books_page(&self, query: BookQuery, page: PageRequest) -> Result<Page<Book>>;

    async fn get_book(&self, book_id: &str) -> Result<Book>;

    /// Previous or next book of the same series, `None` at either end
    async fn get_sibling(&self, book_id: &str, direction: Sibling) -> Result<Option<Book>>;

    async fn get_book_pages(&self, book_id: &str) -> Result<Vec<MediaPage>>;

    async fn mark_read_progress(&self, book_id: &str, update: ReadProgressUpdate) -> Result<()>;

    async fn delete_read_progress(&self, book_id: &str) -> Result<()>;

    async fn update_book_metadata(&self, book_id: &str, metadata: BookMetadata) -> Result<()>;

    async fn get_book_thumbnails(&self, book_id: &str) -> Result<Vec<Thumbnail>>;

    async fn get_book_thumbnail_data(&self, book_id: &str, thumbnail_id: &str) -> Result<Bytes>;

    async fn select_book_thumbnail(&self, book_id: &str, thumbnail_id: &str) -> Result<()>;

    async fn analyze_book(&self, book_id: &str) -> Result<()>;
}

/// Fields accepted when creating or updating a collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCreation {
    pub name: String,
    pub ordered: bool,
    pub series_ids: Vec<String>,
}

#[async_trait]
pub trait CollectionClient: Send + Sync {
    async fn get_collections(&self, search: Option<String>, page: PageRequest) -> Result<Page<Collection>>;

    async fn get_collection(&self, collection_id: &str) -> Result<Collection>;

    async fn get_collection_series(&self, collection_id: &str, page: PageRequest) -> Result<Page<Series>>;

    async fn add_collection(&self, collection: CollectionCreation) -> Result<Collection>;

    async fn update_collection(&self, collection_id: &str, collection: CollectionCreation) -> Result<()>;

    async fn delete_collection(&self, collection_id: &str) -> Result<()>;
}

/// Fields accepted when creating or updating a read list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadListCreation {
    pub name: String,
    pub summary: String,
    pub ordered: bool,
    pub book_ids: Vec<String>,
}

#[async_trait]
pub trait ReadListClient: Send + Sync {
    async fn get_read_lists(&self, search: Option<String>, page: PageRequest) -> Result<Page<ReadList>>;

    async fn get_read_list(&self, read_list_id: &str) -> Result<ReadList>;

    async fn get_read_list_books(&self, read_list_id: &str, page: PageRequest) -> Result<Page<Book>>;

    async fn add_read_list(&self, read_list: ReadListCreation) -> Result<ReadList>;

    async fn update_read_list(&self, read_list_id: &str, read_list: ReadListCreation) -> Result<()>;

    async fn delete_read_list(&self, read_list_id: &str) -> Result<()>;
}

/// Fields accepted when creating a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserCreation {
    pub email: String,
    pub password: String,
    pub roles: Vec<String>,
}

#[async_trait]
pub trait UserClient: Send + Sync {
    /// The authenticated user
    async fn get_me(&self) -> Result<User>;

    async fn get_users(&self) -> Result<Vec<User>>;

    async fn add_user(&self, user: UserCreation) -> Result<User>;

    async fn delete_user(&self, user_id: &str) -> Result<()>;

    async fn update_password(&self, user_id: &str, password: &str) -> Result<()>;
}

#[async_trait]
pub trait SettingsClient: Send + Sync {
    async fn get_server_settings(&self) -> Result<ServerSettings>;

    async fn update_server_settings(&self, settings: ServerSettings) -> Result<()>;
}

/// Distinct metadata values used by filters and editors
#[async_trait]
pub trait ReferentialClient: Send + Sync {
    async fn get_authors(&self, search: Option<String>, library_id: Option<String>) -> Result<Vec<Author>>;

    async fn get_genres(&self, library_id: Option<String>) -> Result<Vec<String>>;

    async fn get_tags(&self, library_id: Option<String>) -> Result<Vec<String>>;

    async fn get_languages(&self, library_id: Option<String>) -> Result<Vec<String>>;

    async fn get_publishers(&self, library_id: Option<String>) -> Result<Vec<String>>;

    async fn get_age_ratings(&self, library_id: Option<String>) -> Result<Vec<String>>;
}

/// A book's backing file as a byte stream
pub struct BookFile {
    pub content_length: Option<u64>,
    pub media_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Streamed book file download, only available over the network
#[async_trait]
pub trait BookFileSource: Send + Sync {
    async fn open_book_file(&self, book_id: &str) -> Result<BookFile>;
}

/// Live push events, only available over the network
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open the event stream. The stream ends when the server closes it.
    async fn connect(&self) -> Result<BoxStream<'static, Result<ServerEvent>>>;
}

/// One event of the server's push stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    LibraryChanged { library_id: String },
    LibraryDeleted { library_id: String },
    SeriesChanged { series_id: String, library_id: String },
    SeriesDeleted { series_id: String, library_id: String },
    BookChanged { book_id: String, series_id: String, library_id: String },
    BookDeleted { book_id: String, series_id: String, library_id: String },
    ReadProgressChanged { book_id: String, user_id: String },
    ReadProgressDeleted { book_id: String, user_id: String },
    ReadProgressSeriesChanged { series_id: String, user_id: String },
    ThumbnailBookChanged { book_id: String, series_id: String },
    ThumbnailSeriesChanged { series_id: String },
    CollectionChanged { collection_id: String, series_ids: Vec<String> },
    CollectionDeleted { collection_id: String, series_ids: Vec<String> },
    ReadListChanged { read_list_id: String, book_ids: Vec<String> },
    ReadListDeleted { read_list_id: String, book_ids: Vec<String> },
    TaskQueueStatus { count: u32 },
    SessionExpired { user_id: String },
    /// An event name this client does not know
    Other { name: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryPayload {
    library_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesPayload {
    series_id: String,
    #[serde(default)]
    library_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookPayload {
    book_id: String,
    #[serde(default)]
    series_id: String,
    #[serde(default)]
    library_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressPayload {
    #[serde(default)]
    book_id: String,
    #[serde(default)]
    series_id: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionPayload {
    collection_id: String,
    #[serde(default)]
    series_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadListPayload {
    read_list_id: String,
    #[serde(default)]
    book_ids: Vec<String>,
}

#[derive(Deserialize)]
struct TaskQueuePayload {
    count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    user_id: String,
}

impl ServerEvent {
    /// Decode one event from its name and JSON data
    pub fn parse(name: &str, data: &str) -> Result<Self> {
        let event = match name {
            "LibraryAdded" | "LibraryChanged" => {
                let p: LibraryPayload = serde_json::from_str(data)?;
                ServerEvent::LibraryChanged { library_id: p.library_id }
            }
            "LibraryDeleted" => {
                let p: LibraryPayload = serde_json::from_str(data)?;
                ServerEvent::LibraryDeleted { library_id: p.library_id }
            }
            "SeriesAdded" | "SeriesChanged" => {
                let p: SeriesPayload = serde_json::from_str(data)?;
                ServerEvent::SeriesChanged { series_id: p.series_id, library_id: p.library_id }
            }
            "SeriesDeleted" => {
                let p: SeriesPayload = serde_json::from_str(data)?;
                ServerEvent::SeriesDeleted { series_id: p.series_id, library_id: p.library_id }
            }
            "BookAdded" | "BookChanged" | "BookImported" => {
                let p: BookPayload = serde_json::from_str(data)?;
                ServerEvent::BookChanged {
                    book_id: p.book_id,
                    series_id: p.series_id,
                    library_id: p.library_id,
                }
            }
            "BookDeleted" => {
                let p: BookPayload = serde_json::from_str(data)?;
                ServerEvent::BookDeleted {
                    book_id: p.book_id,
                    series_id: p.series_id,
                    library_id: p.library_id,
                }
            }
            "ReadProgressChanged" => {
                let p: ProgressPayload = serde_json::from_str(data)?;
                ServerEvent::ReadProgressChanged { book_id: p.book_id, user_id: p.user_id }
            }
            "ReadProgressDeleted" => {
                let p: ProgressPayload = serde_json::from_str(data)?;
                ServerEvent::ReadProgressDeleted { book_id: p.book_id, user_id: p.user_id }
            }
            "ReadProgressSeriesChanged" | "ReadProgressSeriesDeleted" => {
                let p: ProgressPayload = serde_json::from_str(data)?;
                ServerEvent::ReadProgressSeriesChanged { series_id: p.series_id, user_id: p.user_id }
            }
            "ThumbnailBookAdded" | "ThumbnailBookDeleted" => {
                let p: BookPayload = serde_json::from_str(data)?;
                ServerEvent::ThumbnailBookChanged { book_id: p.book_id, series_id: p.series_id }
            }
            "ThumbnailSeriesAdded" | "ThumbnailSeriesDeleted" => {
                let p: SeriesPayload = serde_json::from_str(data)?;
                ServerEvent::ThumbnailSeriesChanged { series_id: p.series_id }
            }
            "CollectionAdded" | "CollectionChanged" => {
                let p: CollectionPayload = serde_json::from_str(data)?;
                ServerEvent::CollectionChanged { collection_id: p.collection_id, series_ids: p.series_ids }
            }
            "CollectionDeleted" => {
                let p: CollectionPayload = serde_json::from_str(data)?;
                ServerEvent::CollectionDeleted { collection_id: p.collection_id, series_ids: p.series_ids }
            }
            "ReadListAdded" | "ReadListChanged" => {
                let p: ReadListPayload = serde_json::from_str(data)?;
                ServerEvent::ReadListChanged { read_list_id: p.read_list_id, book_ids: p.book_ids }
            }
            "ReadListDeleted" => {
                let p: ReadListPayload = serde_json::from_str(data)?;
                ServerEvent::ReadListDeleted { read_list_id: p.read_list_id, book_ids: p.book_ids }
            }
            "TaskQueueStatus" => {
                let p: TaskQueuePayload = serde_json::from_str(data)?;
                ServerEvent::TaskQueueStatus { count: p.count }
            }
            "SessionExpired" => {
                let p: SessionPayload = serde_json::from_str(data)?;
                ServerEvent::SessionExpired { user_id: p.user_id }
            }
            other => ServerEvent::Other { name: other.to_string() },
        };
        Ok(event)
    }
}

/// The facade handed to callers, one trait object per entity family
#[derive(Clone)]
pub struct MediaClients {
    pub libraries: Arc<dyn LibraryClient>,
    pub series: Arc<dyn SeriesClient>,
    pub books: Arc<dyn BookClient>,
    pub collections: Arc<dyn CollectionClient>,
    pub read_lists: Arc<dyn ReadListClient>,
    pub users: Arc<dyn UserClient>,
    pub settings: Arc<dyn SettingsClient>,
    pub referential: Arc<dyn ReferentialClient>,
}

impl MediaClients {
    /// Facade backed by one implementation of every entity trait
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: LibraryClient
            + SeriesClient
            + BookClient
            + CollectionClient
            + ReadListClient
            + UserClient
            + SettingsClient
            + ReferentialClient
            + 'static,
    {
        Self {
            libraries: backend.clone(),
            series: backend.clone(),
            books: backend.clone(),
            collections: backend.clone(),
            read_lists: backend.clone(),
            users: backend.clone(),
            settings: backend.clone(),
            referential: backend,
        }
    }
}

/// Capabilities the sync engine needs from the network: the entity
/// clients plus file download and the push stream
#[derive(Clone)]
pub struct RemoteApi {
    pub clients: MediaClients,
    pub files: Arc<dyn BookFileSource>,
    pub events: Arc<dyn EventSource>,
}

impl RemoteApi {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: LibraryClient
            + SeriesClient
            + BookClient
            + CollectionClient
            + ReadListClient
            + UserClient
            + SettingsClient
            + ReferentialClient
            + BookFileSource
            + EventSource
            + 'static,
    {
        Self {
            clients: MediaClients::from_backend(backend.clone()),
            files: backend.clone(),
            events: backend,
        }
    }
}

/// Error returned by administrative operations while offline
pub(crate) fn unsupported_offline<T>(operation: &'static str) -> Result<T> {
    Err(ReplicaError::UnsupportedOffline(operation))
}
