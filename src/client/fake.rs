//! In-memory server for sync and reconciler tests

use crate::client::{
    BookClient, BookFile, BookFileSource, CollectionClient, CollectionCreation, EventSource, LibraryClient,
    ReadListClient, ReadListCreation, ReferentialClient, RemoteApi, SeriesClient, ServerEvent,
    SettingsClient, UserClient, UserCreation,
};
use crate::core::error::{ReplicaError, Result};
use crate::db::models::{
    now, Author, Book, BookMetadata, BookQuery, Collection, Library, LibraryCreation, MediaPage, Page,
    PageRequest, ReadList, ReadProgress, ReadProgressUpdate, Series, SeriesMetadata, SeriesQuery,
    ServerSettings, Thumbnail, User,
};
use crate::db::repository::book::Sibling;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Default)]
pub(crate) struct FakeState {
    pub user: Option<User>,
    pub libraries: Vec<Library>,
    pub series: Vec<Series>,
    /// Books as the server lists them, without page lists
    pub books: Vec<Book>,
    pub pages: HashMap<String, Vec<MediaPage>>,
    pub progress: HashMap<(String, String), ReadProgress>,
    pub series_thumbnails: HashMap<String, Vec<(Thumbnail, Vec<u8>)>>,
    pub files: HashMap<String, Vec<u8>>,
    /// Every call fails with a transient error while set
    pub unreachable: bool,
    /// One-shot failures keyed by call name
    pub fail_next: HashMap<&'static str, ReplicaError>,
    /// File bodies never finish after their content
    pub stall_files: bool,
    pub calls: Vec<String>,
    pub connects: u32,
}

pub(crate) struct FakeServer {
    state: Mutex<FakeState>,
    events: Mutex<broadcast::Sender<ServerEvent>>,
}

impl FakeServer {
    pub fn new(user: User) -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(FakeState {
                user: Some(user),
                ..FakeState::default()
            }),
            events: Mutex::new(sender),
        })
    }

    pub fn api(self: &Arc<Self>) -> RemoteApi {
        RemoteApi::from_backend(self.clone())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_library(&self, library: Library) {
        self.state().libraries.push(library);
    }

    pub fn add_series(&self, series: Series) {
        self.state().series.push(series);
    }

    /// Store a book; its page list is served separately like the real server
    pub fn add_book(&self, mut book: Book) {
        let mut state = self.state();
        let pages = std::mem::take(&mut book.media.pages);
        state.pages.insert(book.id.clone(), pages);
        state.files.insert(book.id.clone(), format!("file of {}", book.id).into_bytes());
        book.read_progress = None;
        state.books.retain(|b| b.id != book.id);
        state.books.push(book);
    }

    pub fn remove_book(&self, book_id: &str) {
        self.state().books.retain(|b| b.id != book_id);
    }

    pub fn remove_series(&self, series_id: &str) {
        let mut state = self.state();
        state.series.retain(|s| s.id != series_id);
        state.books.retain(|b| b.series_id != series_id);
    }

    pub fn set_progress(&self, progress: ReadProgress) {
        self.state()
            .progress
            .insert((progress.book_id.clone(), progress.user_id.clone()), progress);
    }

    pub fn progress(&self, book_id: &str, user_id: &str) -> Option<ReadProgress> {
        self.state()
            .progress
            .get(&(book_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn fail_next(&self, call: &'static str, error: ReplicaError) {
        self.state().fail_next.insert(call, error);
    }

    pub fn calls(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn push_event(&self, event: ServerEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }

    /// End every open event stream
    pub fn drop_event_streams(&self) {
        let (sender, _) = broadcast::channel(64);
        *self.events.lock().unwrap() = sender;
    }

    fn check(&self, call: &'static str) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        state.calls.push(call.to_string());
        if state.unreachable {
            return Err(ReplicaError::TransientNetwork(format!("{call}: connection refused")));
        }
        if let Some(error) = state.fail_next.remove(call) {
            return Err(error);
        }
        Ok(state)
    }

    fn user_id(state: &FakeState) -> String {
        state.user.as_ref().map(|u| u.id.clone()).unwrap_or_default()
    }

    fn with_progress(state: &FakeState, mut book: Book) -> Book {
        let key = (book.id.clone(), Self::user_id(state));
        book.read_progress = state.progress.get(&key).cloned().map(|mut p| {
            p.book_id = String::new();
            p.user_id = String::new();
            p
        });
        book
    }
}

fn paginate<T: Clone>(items: &[T], request: PageRequest) -> Page<T> {
    let start = (request.offset() as usize).min(items.len());
    let end = (start + request.size as usize).min(items.len());
    Page::from_parts(items[start..end].to_vec(), request, items.len() as u64)
}

fn not_found<T>(what: &str, id: &str) -> Result<T> {
    Err(ReplicaError::NotFound(format!("{what} {id}")))
}

#[async_trait]
impl LibraryClient for FakeServer {
    async fn get_libraries(&self) -> Result<Vec<Library>> {
        Ok(self.check("get_libraries")?.libraries.clone())
    }

    async fn get_library(&self, library_id: &str) -> Result<Library> {
        let state = self.check("get_library")?;
        match state.libraries.iter().find(|l| l.id == library_id) {
            Some(library) => Ok(library.clone()),
            None => not_found("library", library_id),
        }
    }

    async fn add_library(&self, _library: LibraryCreation) -> Result<Library> {
        self.check("add_library")?;
        Err(ReplicaError::Rejected { status: 403, message: "read-only fake".to_string() })
    }

    async fn update_library(&self, _library_id: &str, _library: LibraryCreation) -> Result<()> {
        self.check("update_library").map(|_| ())
    }

    async fn delete_library(&self, _library_id: &str) -> Result<()> {
        self.check("delete_library").map(|_| ())
    }

    async fn scan_library(&self, _library_id: &str, _deep: bool) -> Result<()> {
        self.check("scan_library").map(|_| ())
    }

    async fn analyze_library(&self, _library_id: &str) -> Result<()> {
        self.check("analyze_library").map(|_| ())
    }
}

#[async_trait]
impl SeriesClient for FakeServer {
    async fn get_series_page(&self, query: SeriesQuery, page: PageRequest) -> Result<Page<Series>> {
        let state = self.check("get_series_page")?;
        let matching: Vec<Series> = state
            .series
            .iter()
            .filter(|s| query.library_ids.is_empty() || query.library_ids.contains(&s.library_id))
            .cloned()
            .collect();
        Ok(paginate(&matching, page))
    }

    async fn get_series(&self, series_id: &str) -> Result<Series> {
        let state = self.check("get_series")?;
        match state.series.iter().find(|s| s.id == series_id) {
            Some(series) => Ok(series.clone()),
            None => not_found("series", series_id),
        }
    }

    async fn get_series_books(&self, series_id: &str, page: PageRequest) -> Result<Page<Book>> {
        let state = self.check("get_series_books")?;
        if !state.series.iter().any(|s| s.id == series_id) {
            return not_found("series", series_id);
        }
        let mut books: Vec<Book> = state
            .books
            .iter()
            .filter(|b| b.series_id == series_id)
            .map(|b| Self::with_progress(&state, b.clone()))
            .collect();
        books.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(paginate(&books, page))
    }

    async fn mark_read(&self, series_id: &str) -> Result<()> {
        let mut state = self.check("mark_read")?;
        let user_id = Self::user_id(&state);
        let books: Vec<(String, i32)> = state
            .books
            .iter()
            .filter(|b| b.series_id == series_id)
            .map(|b| (b.id.clone(), b.media.pages_count))
            .collect();
        let stamp = now();
        for (book_id, pages) in books {
            state.progress.insert(
                (book_id.clone(), user_id.clone()),
                ReadProgress {
                    book_id,
                    user_id: user_id.clone(),
                    page: pages,
                    completed: true,
                    read_date: stamp,
                    device_id: String::new(),
                    device_name: "fake".to_string(),
                    locator: None,
                    created_date: stamp,
                    last_modified_date: stamp,
                },
            );
        }
        Ok(())
    }

    async fn mark_unread(&self, series_id: &str) -> Result<()> {
        let mut state = self.check("mark_unread")?;
        let ids: Vec<String> = state
            .books
            .iter()
            .filter(|b| b.series_id == series_id)
            .map(|b| b.id.clone())
            .collect();
        state.progress.retain(|(book_id, _), _| !ids.contains(book_id));
        Ok(())
    }

    async fn update_series_metadata(&self, _series_id: &str, _metadata: SeriesMetadata) -> Result<()> {
        self.check("update_series_metadata").map(|_| ())
    }

    async fn get_series_thumbnails(&self, series_id: &str) -> Result<Vec<Thumbnail>> {
        let state = self.check("get_series_thumbnails")?;
        Ok(state
            .series_thumbnails
            .get(series_id)
            .map(|thumbs| thumbs.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_series_thumbnail_data(&self, series_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        let state = self.check("get_series_thumbnail_data")?;
        state
            .series_thumbnails
            .get(series_id)
            .and_then(|thumbs| thumbs.iter().find(|(t, _)| t.id == thumbnail_id))
            .map(|(_, data)| Bytes::from(data.clone()))
            .ok_or_else(|| ReplicaError::NotFound(format!("thumbnail {thumbnail_id}")))
    }

    async fn select_series_thumbnail(&self, _series_id: &str, _thumbnail_id: &str) -> Result<()> {
        self.check("select_series_thumbnail").map(|_| ())
    }

    async fn analyze_series(&self, _series_id: &str) -> Result<()> {
        self.check("analyze_series").map(|_| ())
    }
}

#[async_trait]
impl BookClient for FakeServer {
    async fn get_books_page(&self, query: BookQuery, page: PageRequest) -> Result<Page<Book>> {
        let state = self.check("get_books_page")?;
        let books: Vec<Book> = state
            .books
            .iter()
            .filter(|b| query.series_id.as_ref().map_or(true, |s| &b.series_id == s))
            .filter(|b| query.library_ids.is_empty() || query.library_ids.contains(&b.library_id))
            .map(|b| Self::with_progress(&state, b.clone()))
            .collect();
        Ok(paginate(&books, page))
    }

    async fn get_book(&self, book_id: &str) -> Result<Book> {
        let state = self.check("get_book")?;
        match state.books.iter().find(|b| b.id == book_id) {
            Some(book) => Ok(Self::with_progress(&state, book.clone())),
            None => not_found("book", book_id),
        }
    }

    async fn get_sibling(&self, book_id: &str, direction: Sibling) -> Result<Option<Book>> {
        let state = self.check("get_sibling")?;
        let Some(current) = state.books.iter().find(|b| b.id == book_id) else {
            return not_found("book", book_id);
        };
        let siblings = state.books.iter().filter(|b| b.series_id == current.series_id);
        let found = match direction {
            Sibling::Previous => siblings.filter(|b| b.number < current.number).max_by_key(|b| b.number),
            Sibling::Next => siblings.filter(|b| b.number > current.number).min_by_key(|b| b.number),
        };
        Ok(found.cloned())
    }

    async fn get_book_pages(&self, book_id: &str) -> Result<Vec<MediaPage>> {
        let state = self.check("get_book_pages")?;
        match state.pages.get(book_id) {
            Some(pages) => Ok(pages.clone()),
            None => not_found("book", book_id),
        }
    }

    async fn mark_read_progress(&self, book_id: &str, update: ReadProgressUpdate) -> Result<()> {
        let mut state = self.check("mark_read_progress")?;
        let Some(book) = state.books.iter().find(|b| b.id == book_id) else {
            return not_found("book", book_id);
        };
        let pages = book.media.pages_count;
        let completed = update.completed.unwrap_or(false) || update.page == Some(pages);
        let page = if completed { pages } else { update.page.unwrap_or(1) };
        let user_id = Self::user_id(&state);
        let stamp = now();
        let key = (book_id.to_string(), user_id.clone());
        let created = state.progress.get(&key).map(|p| p.created_date).unwrap_or(stamp);
        state.progress.insert(
            key,
            ReadProgress {
                book_id: book_id.to_string(),
                user_id,
                page,
                completed,
                read_date: stamp,
                device_id: String::new(),
                device_name: "fake".to_string(),
                locator: None,
                created_date: created,
                last_modified_date: stamp,
            },
        );
        Ok(())
    }

    async fn delete_read_progress(&self, book_id: &str) -> Result<()> {
        let mut state = self.check("delete_read_progress")?;
        let key = (book_id.to_string(), Self::user_id(&state));
        state.progress.remove(&key);
        Ok(())
    }

    async fn update_book_metadata(&self, _book_id: &str, _metadata: BookMetadata) -> Result<()> {
        self.check("update_book_metadata").map(|_| ())
    }

    async fn get_book_thumbnails(&self, _book_id: &str) -> Result<Vec<Thumbnail>> {
        self.check("get_book_thumbnails")?;
        Ok(Vec::new())
    }

    async fn get_book_thumbnail_data(&self, _book_id: &str, thumbnail_id: &str) -> Result<Bytes> {
        self.check("get_book_thumbnail_data")?;
        not_found("thumbnail", thumbnail_id)
    }

    async fn select_book_thumbnail(&self, _book_id: &str, _thumbnail_id: &str) -> Result<()> {
        self.check("select_book_thumbnail").map(|_| ())
    }

    async fn analyze_book(&self, _book_id: &str) -> Result<()> {
        self.check("analyze_book").map(|_| ())
    }
}

#[async_trait]
impl CollectionClient for FakeServer {
    async fn get_collections(&self, _search: Option<String>, page: PageRequest) -> Result<Page<Collection>> {
        self.check("get_collections")?;
        Ok(Page::empty(page.size))
    }

    async fn get_collection(&self, collection_id: &str) -> Result<Collection> {
        self.check("get_collection")?;
        not_found("collection", collection_id)
    }

    async fn get_collection_series(&self, _collection_id: &str, page: PageRequest) -> Result<Page<Series>> {
        self.check("get_collection_series")?;
        Ok(Page::empty(page.size))
    }

    async fn add_collection(&self, _collection: CollectionCreation) -> Result<Collection> {
        self.check("add_collection")?;
        Err(ReplicaError::Rejected { status: 403, message: "read-only fake".to_string() })
    }

    async fn update_collection(&self, _collection_id: &str, _collection: CollectionCreation) -> Result<()> {
        self.check("update_collection").map(|_| ())
    }

    async fn delete_collection(&self, _collection_id: &str) -> Result<()> {
        self.check("delete_collection").map(|_| ())
    }
}

#[async_trait]
impl ReadListClient for FakeServer {
    async fn get_read_lists(&self, _search: Option<String>, page: PageRequest) -> Result<Page<ReadList>> {
        self.check("get_read_lists")?;
        Ok(Page::empty(page.size))
    }

    async fn get_read_list(&self, read_list_id: &str) -> Result<ReadList> {
        self.check("get_read_list")?;
        not_found("read list", read_list_id)
    }

    async fn get_read_list_books(&self, _read_list_id: &str, page: PageRequest) -> Result<Page<Book>> {
        self.check("get_read_list_books")?;
        Ok(Page::empty(page.size))
    }

    async fn add_read_list(&self, _read_list: ReadListCreation) -> Result<ReadList> {
        self.check("add_read_list")?;
        Err(ReplicaError::Rejected { status: 403, message: "read-only fake".to_string() })
    }

    async fn update_read_list(&self, _read_list_id: &str, _read_list: ReadListCreation) -> Result<()> {
        self.check("update_read_list").map(|_| ())
    }

    async fn delete_read_list(&self, _read_list_id: &str) -> Result<()> {
        self.check("delete_read_list").map(|_| ())
    }
}

#[async_trait]
impl UserClient for FakeServer {
    async fn get_me(&self) -> Result<User> {
        let state = self.check("get_me")?;
        state
            .user
            .clone()
            .ok_or_else(|| ReplicaError::Rejected { status: 401, message: "unauthorized".to_string() })
    }

    async fn get_users(&self) -> Result<Vec<User>> {
        let state = self.check("get_users")?;
        Ok(state.user.clone().into_iter().collect())
    }

    async fn add_user(&self, _user: UserCreation) -> Result<User> {
        self.check("add_user")?;
        Err(ReplicaError::Rejected { status: 403, message: "read-only fake".to_string() })
    }

    async fn delete_user(&self, _user_id: &str) -> Result<()> {
        self.check("delete_user").map(|_| ())
    }

    async fn update_password(&self, _user_id: &str, _password: &str) -> Result<()> {
        self.check("update_password").map(|_| ())
    }
}

#[async_trait]
impl SettingsClient for FakeServer {
    async fn get_server_settings(&self) -> Result<ServerSettings> {
        self.check("get_server_settings")?;
        Ok(ServerSettings {
            delete_empty_collections: false,
            delete_empty_read_lists: false,
            task_pool_size: 1,
            server_port: None,
            server_context_path: None,
        })
    }

    async fn update_server_settings(&self, _settings: ServerSettings) -> Result<()> {
        self.check("update_server_settings").map(|_| ())
    }
}

#[async_trait]
impl ReferentialClient for FakeServer {
    async fn get_authors(&self, _search: Option<String>, _library_id: Option<String>) -> Result<Vec<Author>> {
        self.check("get_authors")?;
        Ok(Vec::new())
    }

    async fn get_genres(&self, _library_id: Option<String>) -> Result<Vec<String>> {
        self.check("get_genres")?;
        Ok(Vec::new())
    }

    async fn get_tags(&self, _library_id: Option<String>) -> Result<Vec<String>> {
        self.check("get_tags")?;
        Ok(Vec::new())
    }

    async fn get_languages(&self, _library_id: Option<String>) -> Result<Vec<String>> {
        self.check("get_languages")?;
        Ok(Vec::new())
    }

    async fn get_publishers(&self, _library_id: Option<String>) -> Result<Vec<String>> {
        self.check("get_publishers")?;
        Ok(Vec::new())
    }

    async fn get_age_ratings(&self, _library_id: Option<String>) -> Result<Vec<String>> {
        self.check("get_age_ratings")?;
        Ok(Vec::new())
    }
}

#[async_trait]
impl BookFileSource for FakeServer {
    async fn open_book_file(&self, book_id: &str) -> Result<BookFile> {
        let state = self.check("open_book_file")?;
        let Some(content) = state.files.get(book_id).cloned() else {
            return not_found("book file", book_id);
        };
        let length = content.len() as u64;
        let chunks: Vec<Result<Bytes>> = content
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = stream::iter(chunks);
        let body = if state.stall_files {
            body.chain(stream::pending()).boxed()
        } else {
            body.boxed()
        };

        Ok(BookFile {
            content_length: Some(length),
            media_type: Some("application/zip".to_string()),
            body,
        })
    }
}

#[async_trait]
impl EventSource for FakeServer {
    async fn connect(&self) -> Result<BoxStream<'static, Result<ServerEvent>>> {
        // subscribed before the connection is counted so no pushed event is lost
        let receiver = self.events.lock().unwrap().subscribe();
        let mut state = self.check("connect")?;
        state.connects += 1;
        drop(state);

        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}
