//! Replica models
//!
//! The same structs describe replica rows and the server's JSON payloads
//! (camelCase on the wire). Fields that only exist locally default when
//! absent from a server payload.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};

/// UTC timestamp used for every `*_date` column
pub type Timestamp = DateTime<Utc>;

/// Format a timestamp the way it is stored (RFC3339, millisecond precision)
pub fn ts_to_sql(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time truncated to the stored precision
pub fn now() -> Timestamp {
    let now = Utc::now();
    parse_ts(&ts_to_sql(&now)).unwrap_or(now)
}

fn parse_ts(s: &str) -> std::result::Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Read a stored timestamp column
pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable stored timestamp column
pub(crate) fn opt_ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_ts(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read a nullable `YYYY-MM-DD` column
pub(crate) fn opt_date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn date_to_sql(date: &Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// One page of a paged listing, local or remote
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub number: u32,
    pub size: u32,
    pub total_elements: u64,
    pub total_pages: u32,
    #[serde(default)]
    pub last: bool,
}

impl<T> Page<T> {
    /// Empty first page
    pub fn empty(size: u32) -> Self {
        Self {
            content: Vec::new(),
            number: 0,
            size,
            total_elements: 0,
            total_pages: 0,
            last: true,
        }
    }

    /// Build a page from a slice of results and the total row count
    pub fn from_parts(content: Vec<T>, request: PageRequest, total_elements: u64) -> Self {
        let size = request.size.max(1);
        let total_pages = ((total_elements + size as u64 - 1) / size as u64) as u32;
        Self {
            content,
            number: request.page,
            size,
            total_elements,
            total_pages,
            last: request.page + 1 >= total_pages,
        }
    }

    /// Whether no further page follows this one
    pub fn is_last(&self) -> bool {
        self.last || self.number + 1 >= self.total_pages
    }
}

/// Zero-based page selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn first(size: u32) -> Self {
        Self { page: 0, size }
    }

    pub fn next(self) -> Self {
        Self { page: self.page + 1, size: self.size }
    }

    pub fn offset(&self) -> i64 {
        self.page as i64 * self.size as i64
    }
}

/// Identity of one remote server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaServer {
    pub id: String,
    pub base_url: String,
}

/// Library record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: String,
    #[serde(default)]
    pub media_server_id: String,
    pub name: String,
    pub root: String,
    #[serde(rename = "importComicInfoBook", default = "default_true")]
    pub import_comicinfo_book: bool,
    #[serde(rename = "importComicInfoSeries", default = "default_true")]
    pub import_comicinfo_series: bool,
    #[serde(rename = "importComicInfoCollection", default = "default_true")]
    pub import_comicinfo_collection: bool,
    #[serde(rename = "importComicInfoReadList", default = "default_true")]
    pub import_comicinfo_readlist: bool,
    #[serde(default = "default_true")]
    pub import_epub_book: bool,
    #[serde(default = "default_true")]
    pub import_epub_series: bool,
    #[serde(default = "default_true")]
    pub import_local_artwork: bool,
    #[serde(default = "default_true")]
    pub import_barcode_isbn: bool,
    #[serde(default)]
    pub scan_force_modified_time: bool,
    #[serde(default)]
    pub scan_on_startup: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: String,
    #[serde(default = "default_true")]
    pub hash_files: bool,
    #[serde(default)]
    pub hash_pages: bool,
    #[serde(default = "default_true")]
    pub analyze_dimensions: bool,
    #[serde(default)]
    pub oneshots_directory: Option<String>,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub scan_directory_exclusions: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> String {
    "EVERY_6H".to_string()
}

/// Fields accepted when creating or updating a library
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryCreation {
    pub name: String,
    pub root: String,
    #[serde(default)]
    pub scan_directory_exclusions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Author {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlternateTitle {
    pub label: String,
    pub title: String,
}

/// Editable series metadata with a lock flag per field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetadata {
    pub status: String,
    #[serde(default)]
    pub status_lock: bool,
    pub title: String,
    #[serde(default)]
    pub title_lock: bool,
    pub title_sort: String,
    #[serde(default)]
    pub title_sort_lock: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_lock: bool,
    #[serde(default)]
    pub reading_direction: Option<String>,
    #[serde(default)]
    pub reading_direction_lock: bool,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub publisher_lock: bool,
    #[serde(default)]
    pub age_rating: Option<i32>,
    #[serde(default)]
    pub age_rating_lock: bool,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub language_lock: bool,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub genres_lock: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_lock: bool,
    #[serde(default)]
    pub total_book_count: Option<i32>,
    #[serde(default)]
    pub total_book_count_lock: bool,
    #[serde(default)]
    pub sharing_labels: Vec<String>,
    #[serde(default)]
    pub sharing_labels_lock: bool,
    #[serde(default)]
    pub links: Vec<WebLink>,
    #[serde(default)]
    pub links_lock: bool,
    #[serde(default)]
    pub alternate_titles: Vec<AlternateTitle>,
    #[serde(default)]
    pub alternate_titles_lock: bool,
}

/// Series-level roll-up of its books' metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataAggregation {
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_number: String,
    #[serde(rename = "lastModified")]
    pub last_modified_date: Timestamp,
}

/// Series aggregate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub id: String,
    pub library_id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "booksCount")]
    pub book_count: i32,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(rename = "created")]
    pub created_date: Timestamp,
    #[serde(rename = "lastModified")]
    pub last_modified_date: Timestamp,
    pub file_last_modified: Timestamp,
    pub metadata: SeriesMetadata,
    #[serde(rename = "booksMetadata")]
    pub aggregation: MetadataAggregation,
}

/// Editable book metadata with a lock flag per field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    pub title: String,
    #[serde(default)]
    pub title_lock: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_lock: bool,
    pub number: String,
    #[serde(default)]
    pub number_lock: bool,
    pub number_sort: f64,
    #[serde(default)]
    pub number_sort_lock: bool,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub release_date_lock: bool,
    #[serde(default)]
    pub isbn: String,
    #[serde(default)]
    pub isbn_lock: bool,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub authors_lock: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_lock: bool,
    #[serde(default)]
    pub links: Vec<WebLink>,
    #[serde(default)]
    pub links_lock: bool,
}

/// One page of a book's backing file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaPage {
    pub number: i32,
    pub file_name: String,
    pub media_type: String,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

/// Analysis result for a book's backing file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub status: String,
    pub media_type: String,
    #[serde(default)]
    pub media_profile: String,
    pub pages_count: i32,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub epub_divina_compatible: bool,
    #[serde(default)]
    pub epub_is_kepub: bool,
    /// Format-specific payload (e.g. EPUB table of contents), kept opaque
    #[serde(default)]
    pub extension: Option<serde_json::Value>,
    #[serde(default)]
    pub pages: Vec<MediaPage>,
}

/// Book aggregate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    pub url: String,
    pub number: i32,
    #[serde(rename = "sizeBytes")]
    pub file_size: i64,
    #[serde(default)]
    pub file_hash: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(rename = "created")]
    pub created_date: Timestamp,
    #[serde(rename = "lastModified")]
    pub last_modified_date: Timestamp,
    #[serde(rename = "fileLastModified")]
    pub remote_file_last_modified: Timestamp,
    #[serde(default)]
    pub local_file_last_modified: Option<Timestamp>,
    #[serde(default)]
    pub remote_unavailable: bool,
    #[serde(default)]
    pub file_download_path: Option<String>,
    pub media: Media,
    pub metadata: BookMetadata,
    /// Progress of the requesting user, embedded by the server
    #[serde(default)]
    pub read_progress: Option<ReadProgress>,
}

impl Book {
    pub fn is_downloaded(&self) -> bool {
        self.file_download_path.is_some()
    }
}

/// Reading position of one user in one book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgress {
    #[serde(default)]
    pub book_id: String,
    #[serde(default)]
    pub user_id: String,
    pub page: i32,
    pub completed: bool,
    pub read_date: Timestamp,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub locator: Option<serde_json::Value>,
    #[serde(rename = "created")]
    pub created_date: Timestamp,
    #[serde(rename = "lastModified")]
    pub last_modified_date: Timestamp,
}

/// Client-side change to a reading position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgressUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

/// Per-series read counts of one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgressSeries {
    pub series_id: String,
    pub user_id: String,
    pub books_read: i32,
    pub books_unread: i32,
    pub books_in_progress: i32,
}

/// Owner kind of a thumbnail
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailOwner {
    Book,
    Series,
    ReadList,
    Collection,
}

impl ThumbnailOwner {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            ThumbnailOwner::Book => "thumbnail_book",
            ThumbnailOwner::Series => "thumbnail_series",
            ThumbnailOwner::ReadList => "thumbnail_readlist",
            ThumbnailOwner::Collection => "thumbnail_collection",
        }
    }

    pub(crate) fn owner_column(&self) -> &'static str {
        match self {
            ThumbnailOwner::Book => "book_id",
            ThumbnailOwner::Series => "series_id",
            ThumbnailOwner::ReadList => "readlist_id",
            ThumbnailOwner::Collection => "collection_id",
        }
    }
}

/// Thumbnail of a book, series, read list or collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub id: String,
    #[serde(alias = "bookId", alias = "seriesId", alias = "readListId", alias = "collectionId")]
    pub owner_id: String,
    #[serde(rename = "type")]
    pub thumbnail_type: String,
    pub selected: bool,
    pub media_type: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgeRestriction {
    pub age: i32,
    /// `ALLOW_ONLY` or `EXCLUDE`
    pub restriction: String,
}

/// User account as seen by this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub server_id: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_true")]
    pub shared_all_libraries: bool,
    #[serde(default)]
    pub shared_libraries_ids: Vec<String>,
    #[serde(default)]
    pub labels_allow: Vec<String>,
    #[serde(default)]
    pub labels_exclude: Vec<String>,
    #[serde(default)]
    pub age_restriction: Option<AgeRestriction>,
}

/// Application settings singleton
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub offline_mode: bool,
    pub user_id: Option<String>,
    pub server_id: Option<String>,
    pub download_directory: Option<String>,
    pub last_read_progress_sync: Option<Timestamp>,
    pub last_full_sync: Option<Timestamp>,
}

/// Server-side settings exposed to administrators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default)]
    pub delete_empty_collections: bool,
    #[serde(default)]
    pub delete_empty_read_lists: bool,
    #[serde(default)]
    pub task_pool_size: i32,
    #[serde(default)]
    pub server_port: Option<i32>,
    #[serde(default)]
    pub server_context_path: Option<String>,
}

/// Kind of a log journal entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalType {
    Info,
    Warn,
    Error,
    /// A local value was discarded in favour of a newer server value
    Conflict,
}

impl JournalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalType::Info => "INFO",
            JournalType::Warn => "WARN",
            JournalType::Error => "ERROR",
            JournalType::Conflict => "CONFLICT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(JournalType::Info),
            "WARN" => Some(JournalType::Warn),
            "ERROR" => Some(JournalType::Error),
            "CONFLICT" => Some(JournalType::Conflict),
            _ => None,
        }
    }
}

/// Log journal record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub entry_type: JournalType,
    pub timestamp: Timestamp,
}

/// Task record in the database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    pub unique_name: String,
    pub task_type: String,
    pub priority: i32,
    pub status: String,
    pub payload: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error: Option<String>,
    pub not_before: Option<Timestamp>,
    pub created_date: Timestamp,
    pub updated_date: Timestamp,
}

/// Collection of series (server-side only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub series_ids: Vec<String>,
    #[serde(rename = "createdDate")]
    pub created_date: Timestamp,
    #[serde(rename = "lastModifiedDate")]
    pub last_modified_date: Timestamp,
}

/// Ordered or unordered list of books (server-side only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub book_ids: Vec<String>,
    #[serde(rename = "createdDate")]
    pub created_date: Timestamp,
    #[serde(rename = "lastModifiedDate")]
    pub last_modified_date: Timestamp,
}

/// Filter for series listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesQuery {
    pub library_ids: Vec<String>,
    pub search: Option<String>,
    pub include_deleted: bool,
}

/// Filter for book listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookQuery {
    pub library_ids: Vec<String>,
    pub series_id: Option<String>,
    pub search: Option<String>,
    pub include_deleted: bool,
}
