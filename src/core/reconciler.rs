//! Event reconciler
//!
//! Listens to the server's push stream while online. Deletions are applied
//! to the replica at once; changes are turned into background refresh
//! tasks, deduplicated by the queue, so bursts of events for one series
//! cost one reload. A second loop follows the local event bus and drops
//! the view cache entries of every entity an event touches.
//!
//! Events missed while disconnected are not replayed. Every reconnection
//! queues a full sync instead.

use crate::cache::CacheRegistry;
use crate::client::{self, RemoteApi, ServerEvent};
use crate::core::config::SyncConfig;
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{EntityKind, EntityRef, EventBus, EventKind, EventSource};
use crate::core::task_queue::{BackoffStrategy, Operation, Priority, TaskQueue};
use crate::db::manager::DatabaseManager;
use crate::db::models::JournalType;
use crate::db::repository::{BookRepository, LibraryRepository, Repository, SeriesRepository};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct EventReconciler {
    events: Arc<dyn client::EventSource>,
    queue: Arc<TaskQueue>,
    event_bus: Arc<EventBus>,
    caches: Arc<CacheRegistry>,
    user_id: String,
    backoff: BackoffStrategy,
    shutdown: CancellationToken,
    libraries: LibraryRepository,
    series: SeriesRepository,
    books: BookRepository,
}

impl EventReconciler {
    pub fn new(
        remote: &RemoteApi,
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        event_bus: Arc<EventBus>,
        caches: Arc<CacheRegistry>,
        user_id: impl Into<String>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            events: remote.events.clone(),
            queue,
            event_bus,
            caches,
            user_id: user_id.into(),
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(config.suspend_backoff_base),
                max: Duration::from_secs(config.suspend_backoff_max),
            },
            shutdown: CancellationToken::new(),
            libraries: LibraryRepository::new(db.clone()),
            series: SeriesRepository::new(db.clone()),
            books: BookRepository::new(db),
        }
    }

    /// Reconnection delays
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn emit(&self, kind: EventKind) {
        self.event_bus.emit(kind, EventSource::Server).await;
    }

    async fn refresh_series(&self, series_id: &str) -> Result<()> {
        self.queue
            .enqueue(Operation::RefreshSeries { series_id: series_id.to_string() }, Priority::Background)
            .await
            .map(|_| ())
    }

    /// Series of a book: from the event when it says, else from the replica
    async fn series_of(&self, book_id: &str, series_id: &str) -> Result<Option<String>> {
        if !series_id.is_empty() {
            return Ok(Some(series_id.to_string()));
        }
        Ok(self.books.find_by_id(book_id).await?.map(|b| b.series_id))
    }

    fn is_own(&self, user_id: &str) -> bool {
        user_id == self.user_id
    }

    /// Apply one push event to the replica
    pub async fn apply(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::LibraryChanged { library_id } => {
                self.queue
                    .enqueue(Operation::SyncLibrary { library_id }, Priority::Background)
                    .await?;
            }
            ServerEvent::LibraryDeleted { library_id } => {
                if self.libraries.mark_unavailable(&library_id).await? {
                    info!(library_id = %library_id, "Library deleted on the server");
                    self.emit(EventKind::EntityDeleted { entity: EntityRef::library(library_id) })
                        .await;
                }
            }
            ServerEvent::SeriesChanged { series_id, .. } | ServerEvent::ThumbnailSeriesChanged { series_id } => {
                self.refresh_series(&series_id).await?;
            }
            ServerEvent::SeriesDeleted { series_id, .. } => {
                if self.series.mark_deleted(&series_id).await? {
                    info!(series_id = %series_id, "Series deleted on the server");
                    self.emit(EventKind::EntityDeleted { entity: EntityRef::series(series_id) })
                        .await;
                }
            }
            ServerEvent::BookChanged { book_id, series_id, library_id } => {
                match self.series_of(&book_id, &series_id).await? {
                    Some(series_id) => self.refresh_series(&series_id).await?,
                    None if !library_id.is_empty() => {
                        self.queue
                            .enqueue(Operation::SyncLibrary { library_id }, Priority::Background)
                            .await?;
                    }
                    None => debug!(book_id = %book_id, "Change of an unknown book"),
                }
            }
            ServerEvent::BookDeleted { book_id, .. } => {
                if self.books.mark_deleted(&book_id).await? {
                    info!(book_id = %book_id, "Book deleted on the server");
                    self.emit(EventKind::EntityDeleted { entity: EntityRef::book(book_id) })
                        .await;
                }
            }
            ServerEvent::ReadProgressChanged { book_id, user_id }
            | ServerEvent::ReadProgressDeleted { book_id, user_id } => {
                if !self.is_own(&user_id) {
                    return Ok(());
                }
                match self.series_of(&book_id, "").await? {
                    Some(series_id) => self.refresh_series(&series_id).await?,
                    None => debug!(book_id = %book_id, "Progress of a book not in the replica"),
                }
            }
            ServerEvent::ReadProgressSeriesChanged { series_id, user_id } => {
                if self.is_own(&user_id) {
                    self.refresh_series(&series_id).await?;
                }
            }
            ServerEvent::ThumbnailBookChanged { book_id, series_id } => {
                if let Some(series_id) = self.series_of(&book_id, &series_id).await? {
                    self.refresh_series(&series_id).await?;
                }
            }
            ServerEvent::CollectionChanged { collection_id, series_ids } => {
                self.emit(EventKind::EntityChanged {
                    entity: EntityRef::new(EntityKind::Collection, collection_id),
                })
                .await;
                for id in series_ids {
                    self.emit(EventKind::EntityChanged { entity: EntityRef::series(id) }).await;
                }
            }
            ServerEvent::CollectionDeleted { collection_id, series_ids } => {
                self.emit(EventKind::EntityDeleted {
                    entity: EntityRef::new(EntityKind::Collection, collection_id),
                })
                .await;
                for id in series_ids {
                    self.emit(EventKind::EntityChanged { entity: EntityRef::series(id) }).await;
                }
            }
            ServerEvent::ReadListChanged { read_list_id, book_ids } => {
                self.emit(EventKind::EntityChanged {
                    entity: EntityRef::new(EntityKind::ReadList, read_list_id),
                })
                .await;
                for id in book_ids {
                    self.emit(EventKind::EntityChanged { entity: EntityRef::book(id) }).await;
                }
            }
            ServerEvent::ReadListDeleted { read_list_id, book_ids } => {
                self.emit(EventKind::EntityDeleted {
                    entity: EntityRef::new(EntityKind::ReadList, read_list_id),
                })
                .await;
                for id in book_ids {
                    self.emit(EventKind::EntityChanged { entity: EntityRef::book(id) }).await;
                }
            }
            ServerEvent::SessionExpired { user_id } => {
                if self.is_own(&user_id) {
                    warn!(user_id = %user_id, "Server session expired");
                    self.emit(EventKind::Notification {
                        level: JournalType::Warn,
                        message: "The server session expired, sign in again to keep syncing".to_string(),
                    })
                    .await;
                }
            }
            ServerEvent::TaskQueueStatus { count } => {
                debug!(count = count, "Server task queue");
            }
            ServerEvent::Other { name } => {
                debug!(event = %name, "Ignoring unknown server event");
            }
        }
        Ok(())
    }

    /// Drop cached views of every entity a bus event touches. A lagging
    /// receiver has missed events and clears everything.
    pub async fn invalidate_caches(self: Arc<Self>) {
        let mut events = self.event_bus.subscribe();
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => {
                    let affected = event.kind.affected();
                    if !affected.is_empty() {
                        self.caches.invalidate_all(&affected).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Cache listener lagged, clearing caches");
                    self.caches.clear().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Follow the push stream until shutdown, reconnecting with backoff
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = tokio::spawn(self.clone().invalidate_caches());
        let mut failures: u32 = 0;
        let mut connected_before = false;

        'connect: loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break 'connect,
                connected = self.events.connect() => connected,
            };

            match connected {
                Ok(mut stream) => {
                    failures = 0;
                    if connected_before {
                        info!("Event stream reconnected, queueing a full sync");
                        self.queue.enqueue(Operation::FullSync, Priority::Background).await?;
                    } else {
                        info!("Event stream connected");
                    }
                    connected_before = true;

                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = self.shutdown.cancelled() => break 'connect,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                if let Err(e) = self.apply(event).await {
                                    warn!(error = %e, "Failed to apply server event");
                                }
                            }
                            Some(Err(ReplicaError::Serialization(e))) => {
                                warn!(error = %e, "Skipping malformed server event");
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Event stream failed");
                                break;
                            }
                            None => {
                                info!("Event stream closed by the server");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures = failures, "Cannot open the event stream");
                }
            }

            let delay = self.backoff.calculate_delay(failures.max(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => break 'connect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown.cancel();
        if let Err(e) = listener.await {
            warn!(error = %e, "Cache listener ended abnormally");
        }
        info!("Event reconciler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::client::fake::FakeServer;
    use crate::core::config::TaskQueueConfig;
    use crate::db::repository::{fixtures, ServerRepository};

    struct Harness {
        fake: Arc<FakeServer>,
        reconciler: Arc<EventReconciler>,
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        caches: Arc<CacheRegistry>,
    }

    async fn harness() -> Harness {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        ServerRepository::new(db.clone()).upsert(&fixtures::server()).await.unwrap();
        LibraryRepository::new(db.clone()).upsert(&fixtures::library("l1")).await.unwrap();
        SeriesRepository::new(db.clone())
            .upsert_page(vec![fixtures::series("s1", "l1")])
            .await
            .unwrap();
        BookRepository::new(db.clone())
            .upsert_page(vec![fixtures::book("b1", "s1", "l1", 1)])
            .await
            .unwrap();

        let fake = FakeServer::new(fixtures::user("u1"));
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(&TaskQueueConfig::default(), db.clone()));
        let caches = Arc::new(CacheRegistry::new());
        let reconciler = EventReconciler::new(
            &fake.api(),
            db.clone(),
            queue.clone(),
            bus.clone(),
            caches.clone(),
            "u1",
            &SyncConfig::default(),
        )
        .with_backoff(BackoffStrategy::Fixed(Duration::from_millis(10)));

        Harness { fake, reconciler: Arc::new(reconciler), db, queue, bus, caches }
    }

    async fn queued(queue: &TaskQueue) -> Vec<String> {
        let mut names: Vec<String> = queue.list(None).await.unwrap().into_iter().map(|t| t.unique_name).collect();
        names.sort();
        names
    }

    macro_rules! eventually {
        ($condition:expr) => {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !$condition {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap()
        };
    }

    #[tokio::test]
    async fn test_changes_become_deduplicated_refreshes() {
        let h = harness().await;
        for _ in 0..3 {
            h.reconciler
                .apply(ServerEvent::BookChanged {
                    book_id: "b1".to_string(),
                    series_id: "s1".to_string(),
                    library_id: "l1".to_string(),
                })
                .await
                .unwrap();
        }
        h.reconciler
            .apply(ServerEvent::ThumbnailSeriesChanged { series_id: "s1".to_string() })
            .await
            .unwrap();
        h.reconciler
            .apply(ServerEvent::LibraryChanged { library_id: "l1".to_string() })
            .await
            .unwrap();

        assert_eq!(
            queued(&h.queue).await,
            vec!["refresh_series:s1".to_string(), "sync_library:l1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_progress_events_resolve_series_locally() {
        let h = harness().await;
        h.reconciler
            .apply(ServerEvent::ReadProgressChanged { book_id: "b1".to_string(), user_id: "u2".to_string() })
            .await
            .unwrap();
        assert!(queued(&h.queue).await.is_empty());

        h.reconciler
            .apply(ServerEvent::ReadProgressDeleted { book_id: "b1".to_string(), user_id: "u1".to_string() })
            .await
            .unwrap();
        assert_eq!(queued(&h.queue).await, vec!["refresh_series:s1".to_string()]);
    }

    #[tokio::test]
    async fn test_deletions_apply_immediately() {
        let h = harness().await;
        let mut events = h.bus.subscribe();

        h.reconciler
            .apply(ServerEvent::BookDeleted {
                book_id: "b1".to_string(),
                series_id: "s1".to_string(),
                library_id: "l1".to_string(),
            })
            .await
            .unwrap();
        assert!(BookRepository::new(h.db.clone()).find_by_id("b1").await.unwrap().unwrap().deleted);

        h.reconciler
            .apply(ServerEvent::LibraryDeleted { library_id: "l1".to_string() })
            .await
            .unwrap();
        let library = LibraryRepository::new(h.db.clone()).find_by_id("l1").await.unwrap().unwrap();
        assert!(library.unavailable);
        assert!(SeriesRepository::new(h.db.clone()).find_by_id("s1").await.unwrap().unwrap().deleted);
        assert!(queued(&h.queue).await.is_empty());

        let deleted: Vec<EntityRef> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event.kind {
                EventKind::EntityDeleted { entity } => Some(entity),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec![EntityRef::book("b1"), EntityRef::library("l1")]);
    }

    #[tokio::test]
    async fn test_cache_invalidation_touches_only_affected_entities() {
        let h = harness().await;
        let thumbnails: Arc<EntityCache<Vec<u8>>> = EntityCache::new("thumbnails", h.caches.clone()).await;
        thumbnails.insert(EntityRef::book("b1"), vec![1]).await;
        thumbnails.insert(EntityRef::book("b2"), vec![2]).await;

        let listener = tokio::spawn(h.reconciler.clone().invalidate_caches());
        // let the listener subscribe before publishing
        tokio::task::yield_now().await;
        h.bus
            .emit(EventKind::EntityChanged { entity: EntityRef::book("b1") }, EventSource::Local)
            .await;
        eventually!(thumbnails.get(&EntityRef::book("b1")).await.is_none());
        assert_eq!(thumbnails.get(&EntityRef::book("b2")).await, Some(vec![2]));

        h.reconciler.shutdown();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_applies_stream_and_resyncs_after_reconnect() {
        let h = harness().await;
        let running = tokio::spawn(h.reconciler.clone().run());

        eventually!(h.fake.state().connects == 1);
        h.fake.push_event(ServerEvent::SeriesChanged { series_id: "s1".to_string(), library_id: "l1".to_string() });
        eventually!(queued(&h.queue).await == vec!["refresh_series:s1".to_string()]);

        h.fake.drop_event_streams();
        eventually!(h.fake.state().connects == 2);
        eventually!(queued(&h.queue).await.contains(&"full_sync".to_string()));

        h.reconciler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_stream_retries() {
        let h = harness().await;
        h.fake.set_unreachable(true);
        let running = tokio::spawn(h.reconciler.clone().run());

        eventually!(h.fake.calls("connect") >= 3);
        assert_eq!(h.fake.state().connects, 0);
        h.fake.set_unreachable(false);
        eventually!(h.fake.state().connects == 1);
        // the first successful connection is not a reconnection
        assert!(queued(&h.queue).await.is_empty());

        h.reconciler.shutdown();
        running.await.unwrap().unwrap();
    }
}
