//! Paged pulls from the server into the replica
//!
//! Every listing is fetched page by page and each page is written in one
//! transaction. Once the last page of a scope is written, rows of that
//! scope the server no longer reported are soft-deleted.

use super::reconcile::{resolve, Resolution};
use super::SyncContext;
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{EntityKind, EntityRef, EventKind};
use crate::core::task_queue::{Operation, Priority};
use crate::db::models::{
    now, Book, JournalType, Library, PageRequest, ReadProgress, SeriesQuery, Thumbnail, ThumbnailOwner, Timestamp,
};
use crate::db::repository::{book, journal, library, read_progress, Repository};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Server-side progress of one book as embedded in a book listing
#[derive(Debug, Clone)]
pub(crate) struct RemoteProgress {
    pub book_id: String,
    pub series_id: String,
    pub progress: Option<ReadProgress>,
}

/// Outcome of one read progress reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressReport {
    pub taken: usize,
    pub pushed: usize,
    pub deleted: usize,
    pub conflicts: usize,
}

impl ProgressReport {
    fn merge(&mut self, other: ProgressReport) {
        self.taken += other.taken;
        self.pushed += other.pushed;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
    }
}

impl SyncContext {
    /// Refresh the authenticated user (roles, library sharing)
    pub(crate) async fn pull_user(&self) -> Result<()> {
        let mut user = self.step("current user", self.remote.clients.users.get_me()).await?;
        if user.id != self.scope.user_id {
            return Err(ReplicaError::Validation(format!(
                "server authenticated user {} but the session belongs to {}",
                user.id, self.scope.user_id
            )));
        }
        user.server_id = self.scope.server_id.clone();
        self.users.upsert(&user).await?;
        self.emit(EventKind::EntityChanged {
            entity: EntityRef::new(EntityKind::User, user.id),
        })
        .await;
        Ok(())
    }

    /// Store every library the server reports and flag the ones it no
    /// longer does. Returns the available libraries.
    pub(crate) async fn pull_libraries(&self) -> Result<Vec<Library>> {
        let mut libraries = self.step("libraries", self.remote.clients.libraries.get_libraries()).await?;
        for library in &mut libraries {
            library.media_server_id = self.scope.server_id.clone();
        }

        let page = libraries.clone();
        self.db
            .transaction(move |tx| {
                for entry in &page {
                    library::write_library(tx, entry)?;
                }
                Ok(())
            })
            .await?;

        let seen: Vec<String> = libraries.iter().map(|l| l.id.clone()).collect();
        let gone = self.libraries.mark_unavailable_except(&self.scope.server_id, seen).await?;
        for id in &gone {
            info!(library_id = %id, "Library no longer reported by the server");
            self.emit(EventKind::EntityDeleted { entity: EntityRef::library(id.clone()) }).await;
        }
        for library in &libraries {
            self.emit(EventKind::EntityChanged { entity: EntityRef::library(library.id.clone()) }).await;
        }

        libraries.retain(|l| !l.unavailable);
        Ok(libraries)
    }

    /// Pull the series of one library. Returns the ids of the live series.
    pub(crate) async fn pull_series(&self, library_id: &str) -> Result<Vec<String>> {
        let query = SeriesQuery {
            library_ids: vec![library_id.to_string()],
            ..SeriesQuery::default()
        };
        let mut request = PageRequest::first(self.config.page_size);
        let mut seen: Vec<String> = Vec::new();

        loop {
            self.checkpoint()?;
            let page = self
                .step(
                    "series page",
                    self.remote.clients.series.get_series_page(query.clone(), request),
                )
                .await?;
            let ids: Vec<String> = page.content.iter().map(|s| s.id.clone()).collect();
            let last = page.is_last() || page.content.is_empty();
            debug!(library_id = %library_id, page = request.page, count = ids.len(), "Series page");

            self.series.upsert_page(page.content).await?;
            for id in &ids {
                self.emit(EventKind::EntityChanged { entity: EntityRef::series(id.clone()) }).await;
            }
            seen.extend(ids);

            if last {
                break;
            }
            request = request.next();
        }

        let gone = self.series.soft_delete_unseen(library_id, seen.clone()).await?;
        for id in gone {
            info!(series_id = %id, "Series removed on the server");
            self.emit(EventKind::EntityDeleted { entity: EntityRef::series(id) }).await;
        }
        Ok(seen)
    }

    /// Pull the books of one series with their page lists. Returns the
    /// server-side progress embedded in the listing.
    pub(crate) async fn pull_books(&self, series_id: &str) -> Result<Vec<RemoteProgress>> {
        let mut request = PageRequest::first(self.config.page_size);
        let mut seen: Vec<String> = Vec::new();
        let mut remote_progress = Vec::new();
        let downloaded: HashSet<String> = self.books.downloaded_ids().await?.into_iter().collect();

        loop {
            self.checkpoint()?;
            let page = self
                .step(
                    "books page",
                    self.remote.clients.series.get_series_books(series_id, request),
                )
                .await?;
            let last = page.is_last() || page.content.is_empty();
            let mut books = page.content;

            let ids: Vec<String> = books.iter().map(|b| b.id.clone()).collect();
            let stored = self.books.stored_page_state(ids.clone()).await?;
            let mut stale_files = Vec::new();
            for book in &mut books {
                let (page_count, file_modified) = match stored.get(&book.id) {
                    Some((count, modified)) => (*count, Some(*modified)),
                    None => (0, None),
                };
                let file_changed = file_modified.map_or(false, |m| m != book.remote_file_last_modified);
                if file_changed && downloaded.contains(&book.id) {
                    stale_files.push(book.id.clone());
                }
                if book.media.pages_count > 0 && (page_count == 0 || file_changed) {
                    book.media.pages = self
                        .step("book pages", self.remote.clients.books.get_book_pages(&book.id))
                        .await?;
                }
            }

            for book in &books {
                remote_progress.push(RemoteProgress {
                    book_id: book.id.clone(),
                    series_id: book.series_id.clone(),
                    progress: book.read_progress.clone(),
                });
            }

            self.write_books(series_id, books).await?;
            for id in &ids {
                self.emit(EventKind::EntityChanged { entity: EntityRef::book(id.clone()) }).await;
            }
            for id in stale_files {
                info!(book_id = %id, "Downloaded file changed on the server, queueing a new download");
                self.queue
                    .enqueue(Operation::DownloadBook { book_id: id }, Priority::Background)
                    .await?;
            }
            seen.extend(ids);

            if last {
                break;
            }
            request = request.next();
        }

        let _group = self.db.lock_group(&format!("series:{series_id}")).await;
        let gone = self.books.soft_delete_unseen(series_id, seen).await?;
        for id in gone {
            info!(book_id = %id, "Book removed on the server");
            self.emit(EventKind::EntityDeleted { entity: EntityRef::book(id) }).await;
        }
        Ok(remote_progress)
    }

    /// Write one page of books and refresh the roll-ups of their series
    async fn write_books(&self, series_id: &str, books: Vec<Book>) -> Result<()> {
        let _group = self.db.lock_group(&format!("series:{series_id}")).await;
        self.db
            .transaction(move |tx| {
                let mut touched = BTreeSet::new();
                for b in &books {
                    book::write_book(tx, b)?;
                    touched.insert(b.series_id.clone());
                }
                for id in touched {
                    book::refresh_series_rollups(tx, &id)?;
                }
                Ok(())
            })
            .await
    }

    /// Apply the server's progress to the replica where it wins and queue
    /// pushes where the replica wins
    pub(crate) async fn reconcile_progress(
        &self,
        entries: Vec<RemoteProgress>,
        last_sync: Option<Timestamp>,
    ) -> Result<ProgressReport> {
        let pending_deletes: HashSet<String> = self
            .queue
            .list(None)
            .await?
            .into_iter()
            .filter(|t| t.status != "failed")
            .map(|t| t.unique_name)
            .collect();

        let mut report = ProgressReport::default();
        let chunk_size = self.config.page_size.max(1) as usize;
        for chunk in entries.chunks(chunk_size) {
            self.checkpoint()?;
            let chunk: Vec<RemoteProgress> = chunk
                .iter()
                .filter(|entry| {
                    let delete = Operation::DeleteReadProgress {
                        book_id: entry.book_id.clone(),
                        user_id: self.scope.user_id.clone(),
                    };
                    !pending_deletes.contains(&delete.unique_name())
                })
                .cloned()
                .collect();
            report.merge(self.reconcile_chunk(chunk, last_sync).await?);
        }
        Ok(report)
    }

    async fn reconcile_chunk(&self, chunk: Vec<RemoteProgress>, last_sync: Option<Timestamp>) -> Result<ProgressReport> {
        let user_id = self.scope.user_id.clone();
        let outcomes = self
            .db
            .transaction(move |tx| {
                let mut outcomes = Vec::with_capacity(chunk.len());
                for entry in chunk {
                    let remote = entry.progress.map(|mut p| {
                        p.book_id = entry.book_id.clone();
                        p.user_id = user_id.clone();
                        p
                    });
                    let local = read_progress::read(tx, &entry.book_id, &user_id)?;
                    let resolution = resolve(local.as_ref(), remote.as_ref(), last_sync);

                    match resolution {
                        Resolution::TakeRemote { conflict } => {
                            if let Some(remote) = &remote {
                                read_progress::write(tx, remote)?;
                            }
                            if conflict {
                                if let (Some(local), Some(remote)) = (&local, &remote) {
                                    journal::append(
                                        tx,
                                        JournalType::Conflict,
                                        &format!(
                                            "Read progress of book {} replaced by a newer server value \
                                             (local page {} at {}, server page {} at {})",
                                            entry.book_id,
                                            local.page,
                                            local.last_modified_date,
                                            remote.page,
                                            remote.last_modified_date
                                        ),
                                    )?;
                                }
                            }
                        }
                        Resolution::DeleteLocal => {
                            read_progress::remove(tx, &entry.book_id, &user_id)?;
                        }
                        Resolution::PushLocal | Resolution::Unchanged => {}
                    }
                    outcomes.push((entry.book_id, entry.series_id, resolution));
                }
                Ok(outcomes)
            })
            .await?;

        let mut report = ProgressReport::default();
        for (book_id, series_id, resolution) in outcomes {
            match resolution {
                Resolution::Unchanged => continue,
                Resolution::PushLocal => {
                    report.pushed += 1;
                    self.queue
                        .enqueue(
                            Operation::PushReadProgress {
                                book_id: book_id.clone(),
                                user_id: self.scope.user_id.clone(),
                            },
                            Priority::Background,
                        )
                        .await?;
                    continue;
                }
                Resolution::TakeRemote { conflict } => {
                    report.taken += 1;
                    if conflict {
                        report.conflicts += 1;
                        warn!(book_id = %book_id, "Local read progress discarded for a newer server value");
                    }
                }
                Resolution::DeleteLocal => report.deleted += 1,
            }
            self.emit(EventKind::ReadProgressChanged {
                book_id,
                series_id: Some(series_id),
                user_id: self.scope.user_id.clone(),
            })
            .await;
        }
        Ok(report)
    }

    /// Re-pull one series, its books, progress and thumbnails
    pub(crate) async fn refresh_series(&self, series_id: &str) -> Result<ProgressReport> {
        let series = match self.step("series", self.remote.clients.series.get_series(series_id)).await {
            Ok(series) => series,
            Err(ReplicaError::NotFound(_)) => {
                if self.series.mark_deleted(series_id).await? {
                    info!(series_id = %series_id, "Series gone from the server");
                    self.emit(EventKind::EntityDeleted { entity: EntityRef::series(series_id) }).await;
                }
                return Ok(ProgressReport::default());
            }
            Err(e) => return Err(e),
        };

        {
            let _group = self.db.lock_group(&format!("series:{series_id}")).await;
            self.series.upsert_page(vec![series]).await?;
        }
        self.emit(EventKind::EntityChanged { entity: EntityRef::series(series_id) }).await;

        let entries = self.pull_books(series_id).await?;
        let last_sync = self.settings.get().await?.last_read_progress_sync;
        let report = self.reconcile_progress(entries, last_sync).await?;

        self.pull_series_thumbnails(series_id).await?;
        Ok(report)
    }

    /// Store the thumbnail list of a series with the selected image's bytes
    async fn pull_series_thumbnails(&self, series_id: &str) -> Result<()> {
        let mut thumbnails: Vec<Thumbnail> = self
            .step(
                "series thumbnails",
                self.remote.clients.series.get_series_thumbnails(series_id),
            )
            .await?;
        for thumbnail in thumbnails.iter_mut().filter(|t| t.selected) {
            let data = self
                .step(
                    "thumbnail data",
                    self.remote
                        .clients
                        .series
                        .get_series_thumbnail_data(series_id, &thumbnail.id),
                )
                .await?;
            thumbnail.data = Some(data.to_vec());
        }
        for thumbnail in &mut thumbnails {
            thumbnail.owner_id = series_id.to_string();
        }

        self.thumbnails
            .replace(ThumbnailOwner::Series, series_id, thumbnails)
            .await?;
        self.emit(EventKind::ThumbnailChanged {
            owner: ThumbnailOwner::Series,
            owner_id: series_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Re-pull one library's series and books
    pub(crate) async fn sync_library(&self, library_id: &str) -> Result<ProgressReport> {
        let libraries = self.pull_libraries().await?;
        if !libraries.iter().any(|l| l.id == library_id) {
            debug!(library_id = %library_id, "Library not available, nothing to sync");
            return Ok(ProgressReport::default());
        }

        let last_sync = self.settings.get().await?.last_read_progress_sync;
        let mut entries = Vec::new();
        for series_id in self.pull_series(library_id).await? {
            entries.extend(self.pull_books(&series_id).await?);
        }
        self.reconcile_progress(entries, last_sync).await
    }

    /// Stamp the end of a progress reconciliation that started at `started`
    pub(crate) async fn stamp_progress_sync(&self, started: Timestamp) -> Result<()> {
        self.settings.stamp_read_progress_sync(started).await
    }

    pub(crate) async fn stamp_full_sync(&self) -> Result<()> {
        self.settings.stamp_full_sync(now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, seed_remote};
    use super::*;
    use crate::db::repository::fixtures::{self, ts};
    use crate::db::repository::{JournalRepository, ReadProgressRepository, ThumbnailRepository};

    #[tokio::test]
    async fn test_pull_writes_pages_and_fetches_page_lists() {
        let (fake, ctx) = context(1).await;
        seed_remote(&fake);

        let libraries = ctx.pull_libraries().await.unwrap();
        assert_eq!(libraries.len(), 1);
        let series = ctx.pull_series("l1").await.unwrap();
        assert_eq!(series, vec!["s1".to_string(), "s2".to_string()]);

        let entries = ctx.pull_books("s1").await.unwrap();
        assert_eq!(entries.len(), 2);
        let stored = ctx.books.find_by_id("b1").await.unwrap().unwrap();
        assert_eq!(stored.media.pages.len(), 3);
        assert_eq!(fake.calls("get_books_page"), 0);
        assert_eq!(fake.calls("get_book_pages"), 2);

        ctx.pull_books("s1").await.unwrap();
        assert_eq!(fake.calls("get_book_pages"), 2);
    }

    #[tokio::test]
    async fn test_unseen_rows_are_soft_deleted() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();
        ctx.pull_series("l1").await.unwrap();
        ctx.pull_books("s1").await.unwrap();

        fake.remove_book("b2");
        fake.remove_series("s2");
        ctx.pull_series("l1").await.unwrap();
        ctx.pull_books("s1").await.unwrap();

        assert!(ctx.books.find_by_id("b2").await.unwrap().unwrap().deleted);
        assert!(!ctx.books.find_by_id("b1").await.unwrap().unwrap().deleted);
        let s2 = ctx.series.find_by_id("s2").await.unwrap().unwrap();
        assert!(s2.deleted);
    }

    #[tokio::test]
    async fn test_newer_server_progress_replaces_local_and_is_journaled() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();
        ctx.pull_series("l1").await.unwrap();
        ctx.pull_books("s1").await.unwrap();

        let progress = ReadProgressRepository::new(ctx.db.clone());
        progress.upsert(&fixtures::progress("b1", "u1", 1, ts(5))).await.unwrap();
        fake.set_progress(fixtures::progress("b1", "u1", 3, ts(6)));

        let entries = ctx.pull_books("s1").await.unwrap();
        let report = ctx.reconcile_progress(entries, Some(ts(4))).await.unwrap();
        assert_eq!(report.taken, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(progress.get("b1", "u1").await.unwrap().unwrap().page, 3);

        let conflicts = JournalRepository::new(ctx.db.clone())
            .list(Some(JournalType::Conflict), 10)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].message.contains("b1"));
    }

    #[tokio::test]
    async fn test_newer_local_progress_is_queued_for_push() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();
        ctx.pull_series("l1").await.unwrap();
        ctx.pull_books("s1").await.unwrap();

        let progress = ReadProgressRepository::new(ctx.db.clone());
        progress.upsert(&fixtures::progress("b2", "u1", 2, ts(9))).await.unwrap();
        fake.set_progress(fixtures::progress("b2", "u1", 1, ts(3)));

        let entries = ctx.pull_books("s1").await.unwrap();
        let report = ctx.reconcile_progress(entries, Some(ts(4))).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(progress.get("b2", "u1").await.unwrap().unwrap().page, 2);

        let push = Operation::PushReadProgress { book_id: "b2".to_string(), user_id: "u1".to_string() };
        let task = ctx.queue.get(&push).await.unwrap().unwrap();
        assert_eq!(task.priority, Priority::Background.as_i32());
    }

    #[tokio::test]
    async fn test_pending_local_delete_is_not_undone() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();
        ctx.pull_series("l1").await.unwrap();
        ctx.pull_books("s1").await.unwrap();

        fake.set_progress(fixtures::progress("b1", "u1", 2, ts(9)));
        let delete = Operation::DeleteReadProgress { book_id: "b1".to_string(), user_id: "u1".to_string() };
        ctx.queue.enqueue(delete, Priority::UserInitiated).await.unwrap();

        let entries = ctx.pull_books("s1").await.unwrap();
        let report = ctx.reconcile_progress(entries, None).await.unwrap();
        assert_eq!(report, ProgressReport::default());
        let progress = ReadProgressRepository::new(ctx.db.clone());
        assert!(progress.get("b1", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_series_stores_selected_thumbnail() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();

        let mut thumbnail = Thumbnail {
            id: "t1".to_string(),
            owner_id: "s1".to_string(),
            thumbnail_type: "GENERATED".to_string(),
            selected: true,
            media_type: "image/jpeg".to_string(),
            file_size: 3,
            width: 10,
            height: 10,
            url: None,
            data: None,
        };
        fake.state()
            .series_thumbnails
            .insert("s1".to_string(), vec![(thumbnail.clone(), vec![1, 2, 3])]);

        ctx.refresh_series("s1").await.unwrap();
        let stored = ThumbnailRepository::new(ctx.db.clone())
            .selected(ThumbnailOwner::Series, "s1")
            .await
            .unwrap()
            .unwrap();
        thumbnail.data = Some(vec![1, 2, 3]);
        assert_eq!(stored, thumbnail);
        assert!(ctx.books.find_by_id("b1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_of_missing_series_soft_deletes() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        ctx.pull_libraries().await.unwrap();
        ctx.pull_series("l1").await.unwrap();

        fake.remove_series("s2");
        ctx.refresh_series("s2").await.unwrap();
        assert!(ctx.series.find_by_id("s2").await.unwrap().unwrap().deleted);
    }
}
