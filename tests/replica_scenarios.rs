//! End-to-end scenarios over a file-backed replica

use chrono::{TimeZone, Utc};
use shelf_replica::core::config::TaskQueueConfig;
use shelf_replica::core::task_queue::{EnqueueOutcome, Operation, Priority, TaskStatus};
use shelf_replica::db::models::*;
use shelf_replica::db::repository::{
    BookRepository, LibraryRepository, ReadProgressRepository, Repository, SeriesRepository,
    ServerRepository, SettingsRepository, UserRepository,
};
use shelf_replica::{DatabaseManager, Mode, ReplicaError, Session, TaskQueue};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn ts(day: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, day, 8, 30, 0).unwrap()
}

fn library(id: &str) -> Library {
    Library {
        id: id.to_string(),
        media_server_id: "srv".to_string(),
        name: "Comics".to_string(),
        root: "/comics".to_string(),
        import_comicinfo_book: true,
        import_comicinfo_series: true,
        import_comicinfo_collection: true,
        import_comicinfo_readlist: true,
        import_epub_book: true,
        import_epub_series: true,
        import_local_artwork: true,
        import_barcode_isbn: false,
        scan_force_modified_time: false,
        scan_on_startup: false,
        scan_interval: "DAILY".to_string(),
        hash_files: true,
        hash_pages: false,
        analyze_dimensions: true,
        oneshots_directory: None,
        unavailable: false,
        scan_directory_exclusions: vec![],
    }
}

fn series(id: &str) -> Series {
    Series {
        id: id.to_string(),
        library_id: "l1".to_string(),
        name: "Hellboy".to_string(),
        url: "/comics/Hellboy".to_string(),
        book_count: 2,
        deleted: false,
        oneshot: false,
        created_date: ts(1),
        last_modified_date: ts(1),
        file_last_modified: ts(1),
        metadata: SeriesMetadata {
            status: "ENDED".to_string(),
            status_lock: false,
            title: "Hellboy".to_string(),
            title_lock: false,
            title_sort: "hellboy".to_string(),
            title_sort_lock: false,
            summary: String::new(),
            summary_lock: false,
            reading_direction: None,
            reading_direction_lock: false,
            publisher: String::new(),
            publisher_lock: false,
            age_rating: None,
            age_rating_lock: false,
            language: "en".to_string(),
            language_lock: false,
            genres: vec![],
            genres_lock: false,
            tags: vec![],
            tags_lock: false,
            total_book_count: None,
            total_book_count_lock: false,
            sharing_labels: vec![],
            sharing_labels_lock: false,
            links: vec![],
            links_lock: false,
            alternate_titles: vec![],
            alternate_titles_lock: false,
        },
        aggregation: MetadataAggregation {
            authors: vec![],
            tags: vec![],
            release_date: None,
            summary: String::new(),
            summary_number: String::new(),
            last_modified_date: ts(1),
        },
    }
}

fn book(id: &str, number: i32) -> Book {
    Book {
        id: id.to_string(),
        series_id: "s1".to_string(),
        library_id: "l1".to_string(),
        name: format!("Volume {number}"),
        url: format!("/comics/Hellboy/v{number}.cbz"),
        number,
        file_size: 4096,
        file_hash: format!("h{number}"),
        deleted: false,
        oneshot: false,
        created_date: ts(1),
        last_modified_date: ts(2),
        remote_file_last_modified: ts(1),
        local_file_last_modified: None,
        remote_unavailable: false,
        file_download_path: None,
        media: Media {
            status: "READY".to_string(),
            media_type: "application/zip".to_string(),
            media_profile: "DIVINA".to_string(),
            pages_count: 1,
            comment: String::new(),
            epub_divina_compatible: false,
            epub_is_kepub: false,
            extension: None,
            pages: vec![MediaPage {
                number: 1,
                file_name: "001.jpg".to_string(),
                media_type: "image/jpeg".to_string(),
                width: None,
                height: None,
                size_bytes: None,
            }],
        },
        metadata: BookMetadata {
            title: format!("Volume {number}"),
            title_lock: false,
            summary: String::new(),
            summary_lock: false,
            number: number.to_string(),
            number_lock: false,
            number_sort: number as f64,
            number_sort_lock: false,
            release_date: None,
            release_date_lock: false,
            isbn: String::new(),
            isbn_lock: false,
            authors: vec![],
            authors_lock: false,
            tags: vec![],
            tags_lock: false,
            links: vec![],
            links_lock: false,
        },
        read_progress: None,
    }
}

fn user() -> User {
    User {
        id: "u1".to_string(),
        server_id: "srv".to_string(),
        email: "reader@example.org".to_string(),
        roles: vec!["FILE_DOWNLOAD".to_string()],
        shared_all_libraries: true,
        shared_libraries_ids: vec![],
        labels_allow: vec![],
        labels_exclude: vec![],
        age_restriction: None,
    }
}

fn open(path: &Path) -> Arc<DatabaseManager> {
    Arc::new(DatabaseManager::new(path, 2, Duration::from_secs(5)).unwrap())
}

/// A replica that has been synchronized once for server `srv` and user `u1`
async fn synchronized_replica(path: &Path) -> Arc<DatabaseManager> {
    let db = open(path);
    ServerRepository::new(db.clone())
        .upsert(&MediaServer { id: "srv".to_string(), base_url: "http://komga.lan".to_string() })
        .await
        .unwrap();
    UserRepository::new(db.clone()).upsert(&user()).await.unwrap();
    LibraryRepository::new(db.clone()).upsert(&library("l1")).await.unwrap();
    SeriesRepository::new(db.clone()).upsert_page(vec![series("s1")]).await.unwrap();
    BookRepository::new(db.clone()).upsert_page(vec![book("b1", 1), book("b2", 2)]).await.unwrap();
    SettingsRepository::new(db.clone())
        .save(&Settings {
            server_id: Some("srv".to_string()),
            user_id: Some("u1".to_string()),
            ..Settings::default()
        })
        .await
        .unwrap();
    db
}

#[tokio::test]
async fn test_user_download_claimed_before_background_refresh() {
    let dir = TempDir::new().unwrap();
    let db = synchronized_replica(&dir.path().join("replica.db")).await;
    let queue = TaskQueue::new(&TaskQueueConfig::default(), db);

    let refresh = Operation::RefreshSeries { series_id: "s1".to_string() };
    let download = Operation::DownloadBook { book_id: "b1".to_string() };
    queue.enqueue(refresh.clone(), Priority::Background).await.unwrap();
    queue.enqueue(download.clone(), Priority::UserInitiated).await.unwrap();
    assert_eq!(
        queue.enqueue(download.clone(), Priority::UserInitiated).await.unwrap(),
        EnqueueOutcome::AlreadyQueued
    );

    let first = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(first.operation, download);
    let second = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(second.operation, refresh);
    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_offline_session_rejects_admin_and_queues_progress() {
    let dir = TempDir::new().unwrap();
    let db = synchronized_replica(&dir.path().join("replica.db")).await;
    let queue = Arc::new(TaskQueue::new(&TaskQueueConfig::default(), db.clone()));

    let session = Session::offline(db.clone(), queue.clone(), None).await.unwrap();
    assert_eq!(session.mode(), Mode::Offline);
    assert_eq!(session.user().id, "u1");

    let creation = LibraryCreation {
        name: "Manga".to_string(),
        root: "/manga".to_string(),
        scan_directory_exclusions: vec![],
    };
    let result = session.clients().libraries.add_library(creation).await;
    assert!(matches!(result, Err(ReplicaError::UnsupportedOffline(_))));
    assert!(queue.list(None).await.unwrap().is_empty());

    let update = ReadProgressUpdate { page: Some(1), completed: Some(true) };
    session.clients().books.mark_read_progress("b2", update).await.unwrap();

    let tasks = queue.list(Some(TaskStatus::Pending)).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].unique_name, "push_read_progress:b2:u1");
    assert_eq!(tasks[0].priority, Priority::UserInitiated.as_i32());

    let stored = ReadProgressRepository::new(db).get("b2", "u1").await.unwrap().unwrap();
    assert!(stored.completed);
}

#[tokio::test]
async fn test_offline_session_needs_a_prior_sync() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir.path().join("empty.db"));
    let queue = Arc::new(TaskQueue::new(&TaskQueueConfig::default(), db.clone()));

    let result = Session::offline(db, queue, None).await;
    assert!(matches!(result, Err(ReplicaError::Validation(_))));
}

#[tokio::test]
async fn test_interrupted_task_recovered_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("replica.db");
    let download = Operation::DownloadBook { book_id: "b1".to_string() };

    {
        let db = synchronized_replica(&path).await;
        let queue = TaskQueue::new(&TaskQueueConfig::default(), db);
        queue.enqueue(download.clone(), Priority::UserInitiated).await.unwrap();
        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.operation, download);
        assert_eq!(queue.counts().await.unwrap().active, 1);
    }

    let queue = TaskQueue::new(&TaskQueueConfig::default(), open(&path));
    assert!(queue.dequeue_next().await.unwrap().is_none());
    assert_eq!(queue.recover().await.unwrap(), 1);

    let record = queue.get(&download).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Pending.as_str());
    let reclaimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.operation, download);
}

#[tokio::test]
async fn test_repeated_page_upsert_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = synchronized_replica(&dir.path().join("replica.db")).await;
    let books = BookRepository::new(db.clone());

    let mut renamed = book("b1", 1);
    renamed.metadata.title = "Seed of Destruction".to_string();
    books.upsert_page(vec![renamed.clone()]).await.unwrap();
    books.upsert_page(vec![renamed.clone()]).await.unwrap();

    let stored = books.find_by_id("b1").await.unwrap().unwrap();
    assert_eq!(stored.metadata.title, "Seed of Destruction");
    assert_eq!(stored.media.pages.len(), 1);
    assert_eq!(books.find_all().await.unwrap().len(), 2);
}
