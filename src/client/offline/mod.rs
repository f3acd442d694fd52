//! Replica implementation of the client facade
//!
//! Reads are served from the replica. Read progress writes are applied
//! locally and queued for the server. Administrative operations fail with
//! `UnsupportedOffline` and leave both the replica and the queue untouched.

use crate::client::{
    unsupported_offline, CollectionClient, CollectionCreation, LibraryClient, ReadListClient,
    ReadListCreation, ReferentialClient, SettingsClient, UserClient, UserCreation,
};
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{EventBus, EventKind, EventSource};
use crate::core::task_queue::{Operation, Priority, TaskQueue};
use crate::db::manager::DatabaseManager;
use crate::db::models::{
    Author, Book, Collection, Library, LibraryCreation, Page, PageRequest, ReadList, Series, ServerSettings,
    User,
};
use crate::db::repository::{
    BookRepository, LibraryRepository, ReadProgressRepository, ReferentialRepository, Repository,
    SeriesRepository, ThumbnailRepository, UserRepository,
};
use async_trait::async_trait;
use std::sync::Arc;

mod catalog;

/// Device name recorded on progress written while offline
pub const OFFLINE_DEVICE_NAME: &str = "shelf-replica";

/// Facade backend reading from and writing to the replica
pub struct OfflineClient {
    user_id: String,
    server_id: String,
    queue: Arc<TaskQueue>,
    event_bus: Option<Arc<EventBus>>,
    libraries: LibraryRepository,
    series: SeriesRepository,
    books: BookRepository,
    progress: ReadProgressRepository,
    thumbnails: ThumbnailRepository,
    users: UserRepository,
    referential: ReferentialRepository,
}

impl OfflineClient {
    pub fn new(
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        server_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            server_id: server_id.into(),
            queue,
            event_bus: None,
            libraries: LibraryRepository::new(db.clone()),
            series: SeriesRepository::new(db.clone()),
            books: BookRepository::new(db.clone()),
            progress: ReadProgressRepository::new(db.clone()),
            thumbnails: ThumbnailRepository::new(db.clone()),
            users: UserRepository::new(db.clone()),
            referential: ReferentialRepository::new(db),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn notify(&self, kind: EventKind) {
        if let Some(bus) = &self.event_bus {
            bus.emit(kind, EventSource::Local).await;
        }
    }

    /// Queue a server write for later, user-initiated so it drains first
    async fn queue_write(&self, operation: Operation) -> Result<()> {
        let outcome = self.queue.enqueue(operation, Priority::UserInitiated).await?;
        tracing::debug!(outcome = ?outcome, "Offline write queued");
        Ok(())
    }

    async fn load_book(&self, book_id: &str) -> Result<Book> {
        self.books
            .find_for_user(book_id, &self.user_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("book {book_id}")))
    }

    async fn load_series(&self, series_id: &str) -> Result<Series> {
        self.series
            .find_by_id(series_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("series {series_id}")))
    }

    async fn current_user(&self) -> Result<User> {
        self.users
            .find_by_id(&self.user_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("user {}", self.user_id)))
    }
}

fn library_visible(user: &User, library: &Library) -> bool {
    !library.unavailable && (user.shared_all_libraries || user.shared_libraries_ids.contains(&library.id))
}

#[async_trait]
impl LibraryClient for OfflineClient {
    /// Available libraries of this server the user may see
    async fn get_libraries(&self) -> Result<Vec<Library>> {
        let user = self.current_user().await?;
        let libraries = self.libraries.find_by_server(&self.server_id).await?;
        Ok(libraries.into_iter().filter(|l| library_visible(&user, l)).collect())
    }

    async fn get_library(&self, library_id: &str) -> Result<Library> {
        let user = self.current_user().await?;
        self.libraries
            .find_by_id(library_id)
            .await?
            .filter(|l| l.media_server_id == self.server_id && library_visible(&user, l))
            .ok_or_else(|| ReplicaError::NotFound(format!("library {library_id}")))
    }

    async fn add_library(&self, _library: LibraryCreation) -> Result<Library> {
        unsupported_offline("add_library")
    }

    async fn update_library(&self, _library_id: &str, _library: LibraryCreation) -> Result<()> {
        unsupported_offline("update_library")
    }

    async fn delete_library(&self, _library_id: &str) -> Result<()> {
        unsupported_offline("delete_library")
    }

    async fn scan_library(&self, _library_id: &str, _deep: bool) -> Result<()> {
        unsupported_offline("scan_library")
    }

    async fn analyze_library(&self, _library_id: &str) -> Result<()> {
        unsupported_offline("analyze_library")
    }
}

#[async_trait]
impl CollectionClient for OfflineClient {
    async fn get_collections(&self, _search: Option<String>, page: PageRequest) -> Result<Page<Collection>> {
        Ok(Page::empty(page.size))
    }

    async fn get_collection(&self, collection_id: &str) -> Result<Collection> {
        Err(ReplicaError::NotFound(format!("collection {collection_id}")))
    }

    async fn get_collection_series(&self, _collection_id: &str, page: PageRequest) -> Result<Page<Series>> {
        Ok(Page::empty(page.size))
    }

    async fn add_collection(&self, _collection: CollectionCreation) -> Result<Collection> {
        unsupported_offline("add_collection")
    }

    async fn update_collection(&self, _collection_id: &str, _collection: CollectionCreation) -> Result<()> {
        unsupported_offline("update_collection")
    }

    async fn delete_collection(&self, _collection_id: &str) -> Result<()> {
        unsupported_offline("delete_collection")
    }
}

#[async_trait]
impl ReadListClient for OfflineClient {
    async fn get_read_lists(&self, _search: Option<String>, page: PageRequest) -> Result<Page<ReadList>> {
        Ok(Page::empty(page.size))
    }

    async fn get_read_list(&self, read_list_id: &str) -> Result<ReadList> {
        Err(ReplicaError::NotFound(format!("read list {read_list_id}")))
    }

    async fn get_read_list_books(&self, _read_list_id: &str, page: PageRequest) -> Result<Page<Book>> {
        Ok(Page::empty(page.size))
    }

    async fn add_read_list(&self, _read_list: ReadListCreation) -> Result<ReadList> {
        unsupported_offline("add_read_list")
    }

    async fn update_read_list(&self, _read_list_id: &str, _read_list: ReadListCreation) -> Result<()> {
        unsupported_offline("update_read_list")
    }

    async fn delete_read_list(&self, _read_list_id: &str) -> Result<()> {
        unsupported_offline("delete_read_list")
    }
}

#[async_trait]
impl UserClient for OfflineClient {
    async fn get_me(&self) -> Result<User> {
        self.current_user().await
    }

    async fn get_users(&self) -> Result<Vec<User>> {
        self.users.find_by_server(&self.server_id).await
    }

    async fn add_user(&self, _user: UserCreation) -> Result<User> {
        unsupported_offline("add_user")
    }

    async fn delete_user(&self, _user_id: &str) -> Result<()> {
        unsupported_offline("delete_user")
    }

    async fn update_password(&self, _user_id: &str, _password: &str) -> Result<()> {
        unsupported_offline("update_password")
    }
}

/// Server settings are not replicated
#[async_trait]
impl SettingsClient for OfflineClient {
    async fn get_server_settings(&self) -> Result<ServerSettings> {
        unsupported_offline("get_server_settings")
    }

    async fn update_server_settings(&self, _settings: ServerSettings) -> Result<()> {
        unsupported_offline("update_server_settings")
    }
}

#[async_trait]
impl ReferentialClient for OfflineClient {
    async fn get_authors(&self, search: Option<String>, library_id: Option<String>) -> Result<Vec<Author>> {
        self.referential.authors(search, library_id).await
    }

    async fn get_genres(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.referential.genres(library_id).await
    }

    async fn get_tags(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.referential.tags(library_id).await
    }

    async fn get_languages(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.referential.languages(library_id).await
    }

    async fn get_publishers(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.referential.publishers(library_id).await
    }

    async fn get_age_ratings(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.referential.age_ratings(library_id).await
    }
}
