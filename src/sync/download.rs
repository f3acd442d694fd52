//! Book file downloads
//!
//! Download tasks are claimed by the drain loop and handed here. Each runs
//! in its own tokio task; a semaphore bounds how many transfer at once.
//! Cancelling a download releases its task row back to `pending` and
//! discards the partial file.

use super::SyncContext;
use crate::client::BookFileSource;
use crate::core::config::DownloadConfig;
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{EntityRef, EventBus, EventKind, EventSource};
use crate::core::storage::{DownloadStore, WriteOutcome};
use crate::core::task_queue::{EnqueueOutcome, Operation, Priority, QueuedTask, TaskQueue};
use crate::db::models::Book;
use crate::db::repository::{BookRepository, LibraryRepository, Repository, ServerRepository};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ActiveDownload {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    files: Arc<dyn BookFileSource>,
    books: BookRepository,
    libraries: LibraryRepository,
    servers: ServerRepository,
    queue: Arc<TaskQueue>,
    event_bus: Arc<EventBus>,
    store: DownloadStore,
    progress_interval: u64,
    open_timeout: Duration,
    permits: Semaphore,
    active: Mutex<HashMap<String, ActiveDownload>>,
    shutdown: CancellationToken,
}

/// Runs book downloads claimed from the task queue
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub(crate) fn new(ctx: &Arc<SyncContext>, config: &DownloadConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                files: ctx.remote.files.clone(),
                books: BookRepository::new(ctx.db.clone()),
                libraries: LibraryRepository::new(ctx.db.clone()),
                servers: ServerRepository::new(ctx.db.clone()),
                queue: ctx.queue.clone(),
                event_bus: ctx.event_bus.clone(),
                store: DownloadStore::new(config.directory.clone()),
                progress_interval: config.progress_interval,
                open_timeout: ctx.config.step_timeout(),
                permits: Semaphore::new(config.concurrency.max(1)),
                active: Mutex::new(HashMap::new()),
                shutdown: ctx.shutdown.child_token(),
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        self.inner.store.root()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveDownload>> {
        self.inner.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Books currently transferring or waiting for a permit
    pub fn active_downloads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Queue a download of a replicated book
    pub async fn request(&self, book_id: &str, priority: Priority) -> Result<EnqueueOutcome> {
        let book = self
            .inner
            .books
            .find_by_id(book_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("book {book_id}")))?;
        if book.deleted {
            return Err(ReplicaError::Validation(format!("book {book_id} was removed from the server")));
        }
        self.inner
            .queue
            .enqueue(Operation::DownloadBook { book_id: book_id.to_string() }, priority)
            .await
    }

    /// Start a claimed download task
    pub(crate) fn spawn(&self, task: QueuedTask) {
        let Operation::DownloadBook { book_id } = &task.operation else {
            warn!(task = %task.unique_name, "Not a download task");
            return;
        };
        let book_id = book_id.clone();
        let cancel = self.inner.shutdown.child_token();

        // held across the spawn so the worker cannot deregister first
        let mut active = self.active();
        let handle = tokio::spawn(run_download(self.inner.clone(), task, cancel.clone()));
        active.insert(book_id, ActiveDownload { cancel, handle: Some(handle) });
    }

    /// Stop a running download. Its task goes back to `pending` without
    /// counting an attempt, so the next drain starts it again.
    pub async fn cancel(&self, book_id: &str) -> Result<()> {
        let handle = match self.active().get_mut(book_id) {
            Some(download) => {
                download.cancel.cancel();
                download.handle.take()
            }
            None => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(book_id = %book_id, error = %e, "Download worker ended abnormally");
            }
            info!(book_id = %book_id, "Download cancelled");
        }
        Ok(())
    }

    /// Stop any transfer and drop the queued download task
    pub async fn discard(&self, book_id: &str) -> Result<bool> {
        self.cancel(book_id).await?;
        let removed = self
            .inner
            .queue
            .remove(&Operation::DownloadBook { book_id: book_id.to_string() })
            .await?;
        if removed {
            info!(book_id = %book_id, "Queued download dropped");
        }
        Ok(removed)
    }

    /// Cancel any transfer and delete the local file
    pub async fn remove(&self, book_id: &str) -> Result<()> {
        self.discard(book_id).await?;
        if let Some(path) = self.inner.books.clear_download(book_id).await? {
            self.inner.store.remove(Path::new(&path)).await?;
            info!(book_id = %book_id, path = %path, "Downloaded file removed");
        }
        self.inner
            .event_bus
            .emit(EventKind::EntityChanged { entity: EntityRef::book(book_id) }, EventSource::Local)
            .await;
        Ok(())
    }

    /// Delete a library from the replica together with its downloaded files.
    /// Returns how many files were removed.
    pub async fn purge_library(&self, library_id: &str) -> Result<usize> {
        self.release_books(|book| book.library_id == library_id).await?;
        let files = self.inner.libraries.purge(library_id).await?;
        let removed = self.remove_files(files).await;
        info!(library_id = %library_id, removed_files = removed, "Library purged");
        self.inner
            .event_bus
            .emit(EventKind::EntityDeleted { entity: EntityRef::library(library_id) }, EventSource::Local)
            .await;
        Ok(removed)
    }

    /// Delete a server identity, everything replicated from it and its
    /// downloaded files
    pub async fn purge_server(&self, server_id: &str) -> Result<usize> {
        let libraries: HashSet<String> = self
            .inner
            .libraries
            .find_by_server(server_id)
            .await?
            .into_iter()
            .map(|library| library.id)
            .collect();
        self.release_books(|book| libraries.contains(&book.library_id)).await?;
        let files = self.inner.servers.purge(server_id).await?;
        let removed = self.remove_files(files).await;
        info!(server_id = %server_id, removed_files = removed, "Server purged");
        for library_id in libraries {
            self.inner
                .event_bus
                .emit(EventKind::EntityDeleted { entity: EntityRef::library(library_id) }, EventSource::Local)
                .await;
        }
        Ok(removed)
    }

    /// Drop books the server no longer has, files included
    pub async fn purge_removed_books(&self) -> Result<usize> {
        self.release_books(|book| book.deleted).await?;
        let files = self.inner.books.purge_deleted().await?;
        let removed = self.remove_files(files).await;
        if removed > 0 {
            info!(removed_files = removed, "Removed books purged");
        }
        Ok(removed)
    }

    /// Discard running and queued downloads of the books matching `in_scope`
    async fn release_books(&self, in_scope: impl Fn(&Book) -> bool) -> Result<()> {
        let mut candidates: BTreeSet<String> = self.active_downloads().into_iter().collect();
        for record in self.inner.queue.list(None).await? {
            if let Operation::DownloadBook { book_id } = Operation::decode(&record.payload) {
                candidates.insert(book_id);
            }
        }
        for book_id in candidates {
            if let Some(book) = self.inner.books.find_by_id(&book_id).await? {
                if in_scope(&book) {
                    self.discard(&book_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove_files(&self, paths: Vec<String>) -> usize {
        let mut removed = 0;
        for path in paths {
            match self.inner.store.remove(Path::new(&path)).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path, error = %e, "Failed to remove downloaded file"),
            }
        }
        removed
    }

    /// Wait for every running download to finish
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self
                .active()
                .values_mut()
                .filter_map(|download| download.handle.take())
                .collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Download worker ended abnormally");
                }
            }
        }
    }

    /// Cancel all downloads; their tasks go back to `pending`
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.wait_idle().await;
    }
}

async fn run_download(inner: Arc<Inner>, task: QueuedTask, cancel: CancellationToken) {
    let Operation::DownloadBook { book_id } = task.operation.clone() else {
        return;
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReplicaError::Cancelled),
        permit = inner.permits.acquire() => match permit {
            Ok(_permit) => inner.transfer(&book_id, &cancel).await,
            Err(_) => Err(ReplicaError::Cancelled),
        },
    };

    inner
        .active
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&book_id);

    let settled = match result {
        Ok(path) => {
            info!(book_id = %book_id, path = %path.display(), "Download completed");
            inner
                .event_bus
                .emit(
                    EventKind::DownloadCompleted {
                        book_id: book_id.clone(),
                        path: path.to_string_lossy().into_owned(),
                    },
                    EventSource::Queue,
                )
                .await;
            inner
                .event_bus
                .emit(EventKind::EntityChanged { entity: EntityRef::book(book_id.clone()) }, EventSource::Queue)
                .await;
            inner.queue.complete(&task).await
        }
        Err(ReplicaError::Cancelled) => {
            debug!(book_id = %book_id, "Download interrupted");
            inner.queue.release(&task).await
        }
        Err(e) => {
            error!(book_id = %book_id, error = %e, "Download failed");
            inner
                .event_bus
                .emit(
                    EventKind::DownloadFailed { book_id: book_id.clone(), error: e.to_string() },
                    EventSource::Queue,
                )
                .await;
            inner.queue.fail_with(&task, &e).await.map(|_| ())
        }
    };
    if let Err(e) = settled {
        warn!(book_id = %book_id, error = %e, "Failed to settle download task");
    }
}

impl Inner {
    async fn transfer(&self, book_id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        let book = self
            .books
            .find_by_id(book_id)
            .await?
            .ok_or_else(|| ReplicaError::TaskPermanentFailure(format!("book {book_id} is not in the replica")))?;
        if book.deleted {
            return Err(ReplicaError::TaskPermanentFailure(format!(
                "book {book_id} was removed from the server"
            )));
        }

        let file = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReplicaError::Cancelled),
            opened = tokio::time::timeout(self.open_timeout, self.files.open_book_file(book_id)) => match opened {
                Ok(file) => file?,
                Err(_) => {
                    return Err(ReplicaError::TransientNetwork(format!(
                        "opening book file {book_id} timed out"
                    )))
                }
            },
        };

        let target = self.store.target_path(&book);
        let total = file.content_length;
        debug!(book_id = %book_id, target = %target.display(), total = ?total, "Download started");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
        let write = self.store.write_stream(&target, file.body, self.progress_interval, cancel, move |written| {
            let _ = progress_tx.send(written);
        });
        let forward = async {
            while let Some(completed) = progress_rx.recv().await {
                self.event_bus
                    .emit(
                        EventKind::DownloadProgress { book_id: book_id.to_string(), completed, total },
                        EventSource::Queue,
                    )
                    .await;
            }
        };
        let (outcome, ()) = tokio::join!(write, forward);

        let (path, bytes) = match outcome? {
            WriteOutcome::Completed { path, bytes } => (path, bytes),
            WriteOutcome::Cancelled => return Err(ReplicaError::Cancelled),
        };
        if let Some(expected) = total {
            if bytes != expected {
                self.store.remove(&path).await?;
                return Err(ReplicaError::TransientNetwork(format!(
                    "book file {book_id} ended after {bytes} of {expected} bytes"
                )));
            }
        }

        self.books
            .set_downloaded(book_id, &path.to_string_lossy(), book.remote_file_last_modified)
            .await?;
        Ok(path)
    }
}
