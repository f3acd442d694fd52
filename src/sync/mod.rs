//! Sync orchestrator
//!
//! A pass walks the server top-down and mirrors it into the replica:
//!
//! ```text
//! Idle -> PullingLibraries -> PullingSeries -> PullingBooks
//!      -> PullingReadProgress -> DrainingQueue -> Idle
//! ```
//!
//! Any state may move to `Suspended` when the server cannot be reached.
//! Passes never overlap. The queue is also drained by a background worker
//! whenever work is enqueued, so user-initiated tasks do not wait for the
//! next scheduled pass.

use crate::client::RemoteApi;
use crate::core::config::{Config, DownloadConfig, SyncConfig};
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{EventBus, EventKind, EventSource};
use crate::core::session::Session;
use crate::core::task_queue::{BackoffStrategy, EnqueueOutcome, Priority, TaskQueue};
use crate::db::manager::DatabaseManager;
use crate::db::models::{now, JournalType};
use crate::db::repository::{
    BookRepository, JournalRepository, LibraryRepository, ReadProgressRepository, SeriesRepository,
    SettingsRepository, ThumbnailRepository, UserRepository,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod download;
mod drain;
mod pull;
pub mod reconcile;

pub use download::DownloadManager;
pub use drain::DrainReport;
pub use pull::ProgressReport;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    PullingLibraries,
    PullingSeries,
    PullingBooks,
    PullingReadProgress,
    DrainingQueue,
    /// The server is unreachable; the next attempt waits for the backoff
    Suspended,
}

/// The server and user a sync engine works for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScope {
    pub server_id: String,
    pub user_id: String,
}

/// Counters of one completed pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub libraries: usize,
    pub series: usize,
    pub books: usize,
    pub progress: ProgressReport,
    pub drain: DrainReport,
}

/// Everything one pull or task execution needs
pub(crate) struct SyncContext {
    pub db: Arc<DatabaseManager>,
    pub queue: Arc<TaskQueue>,
    pub remote: RemoteApi,
    pub event_bus: Arc<EventBus>,
    pub scope: SyncScope,
    pub config: SyncConfig,
    pub shutdown: CancellationToken,
    pub state: watch::Sender<SyncState>,
    pub users: UserRepository,
    pub libraries: LibraryRepository,
    pub series: SeriesRepository,
    pub books: BookRepository,
    pub progress: ReadProgressRepository,
    pub settings: SettingsRepository,
    pub thumbnails: ThumbnailRepository,
    pub journal: JournalRepository,
}

impl SyncContext {
    pub(crate) fn new(
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        remote: RemoteApi,
        event_bus: Arc<EventBus>,
        scope: SyncScope,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            users: UserRepository::new(db.clone()),
            libraries: LibraryRepository::new(db.clone()),
            series: SeriesRepository::new(db.clone()),
            books: BookRepository::new(db.clone()),
            progress: ReadProgressRepository::new(db.clone()),
            settings: SettingsRepository::new(db.clone()),
            thumbnails: ThumbnailRepository::new(db.clone()),
            journal: JournalRepository::new(db.clone()),
            db,
            queue,
            remote,
            event_bus,
            scope,
            config,
            shutdown: CancellationToken::new(),
            state,
        }
    }

    /// Run one network call under the step timeout. A timeout counts as a
    /// transient failure; shutdown abandons the call.
    pub(crate) async fn step<T, F>(&self, what: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.step_timeout();
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ReplicaError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(ReplicaError::TransientNetwork(format!(
                    "{what} timed out after {}s",
                    timeout.as_secs()
                ))),
            },
        }
    }

    /// Page boundary: stop here if shutdown was requested
    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ReplicaError::Cancelled);
        }
        Ok(())
    }

    pub(crate) async fn emit(&self, kind: EventKind) {
        self.event_bus.emit(kind, EventSource::Sync).await;
    }

    pub(crate) fn current_state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub(crate) async fn enter(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Sync state");
            self.emit(EventKind::SyncStateChanged { state }).await;
        }
    }

    /// Pull everything the user can see. With `track` set, the orchestrator
    /// state follows the steps.
    pub(crate) async fn pull_all(&self, track: bool) -> Result<PassReport> {
        let started = now();
        let mut report = PassReport::default();

        if track {
            self.enter(SyncState::PullingLibraries).await;
        }
        self.pull_user().await?;
        let libraries = self.pull_libraries().await?;
        report.libraries = libraries.len();

        if track {
            self.enter(SyncState::PullingSeries).await;
        }
        let mut series_ids = Vec::new();
        for library in &libraries {
            series_ids.extend(self.pull_series(&library.id).await?);
        }
        report.series = series_ids.len();

        if track {
            self.enter(SyncState::PullingBooks).await;
        }
        let mut entries = Vec::new();
        for series_id in &series_ids {
            entries.extend(self.pull_books(series_id).await?);
        }
        report.books = entries.len();

        if track {
            self.enter(SyncState::PullingReadProgress).await;
        }
        let last_sync = self.settings.get().await?.last_read_progress_sync;
        report.progress = self.reconcile_progress(entries, last_sync).await?;
        self.stamp_progress_sync(started).await?;
        self.stamp_full_sync().await?;

        Ok(report)
    }

    /// Full pull run as a queued task
    pub(crate) async fn pull_everything(&self) -> Result<PassReport> {
        self.pull_all(false).await
    }
}

/// Drives sync passes, the queue drain worker and downloads
pub struct SyncOrchestrator {
    ctx: Arc<SyncContext>,
    downloads: DownloadManager,
    pass_lock: Mutex<()>,
    drain_lock: Mutex<()>,
    trigger: Notify,
    connectivity: watch::Sender<bool>,
    suspend_backoff: BackoffStrategy,
    failures: AtomicU32,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        remote: RemoteApi,
        event_bus: Arc<EventBus>,
        scope: SyncScope,
        sync: &SyncConfig,
        downloads: &DownloadConfig,
    ) -> Self {
        let ctx = Arc::new(SyncContext::new(
            db,
            queue,
            remote,
            event_bus,
            scope,
            sync.clone(),
        ));
        let downloads = DownloadManager::new(&ctx, downloads);
        let (connectivity, _) = watch::channel(true);

        Self {
            suspend_backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(sync.suspend_backoff_base),
                max: Duration::from_secs(sync.suspend_backoff_max),
            },
            ctx,
            downloads,
            pass_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            trigger: Notify::new(),
            connectivity,
            failures: AtomicU32::new(0),
        }
    }

    /// Build the orchestrator for a session's server and user. The session
    /// must carry network access.
    pub fn from_session(
        session: &Session,
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        event_bus: Arc<EventBus>,
        config: &Config,
    ) -> Result<Self> {
        let remote = session.remote().cloned().ok_or_else(|| {
            ReplicaError::Validation("session has no network access to sync with".to_string())
        })?;
        let scope = SyncScope {
            server_id: session.server().id.clone(),
            user_id: session.user().id.clone(),
        };
        Ok(Self::new(
            db,
            queue,
            remote,
            event_bus,
            scope,
            &config.sync,
            &config.downloads,
        ))
    }

    pub fn state(&self) -> SyncState {
        self.ctx.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.ctx.state.subscribe()
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Run one pass and drain the queue afterwards
    pub async fn full_pass(&self) -> Result<PassReport> {
        let mut report = {
            let _pass = self.pass_lock.lock().await;
            info!(server_id = %self.ctx.scope.server_id, "Sync pass started");
            match self.ctx.pull_all(true).await {
                Ok(report) => report,
                Err(e) => return Err(self.settle(e).await),
            }
        };

        self.ctx.enter(SyncState::DrainingQueue).await;
        match self.drain_queue().await {
            Ok(drain) => report.drain = drain,
            Err(e) => return Err(self.settle(e).await),
        }

        self.failures.store(0, Ordering::Relaxed);
        self.ctx.enter(SyncState::Idle).await;
        info!(
            libraries = report.libraries,
            series = report.series,
            books = report.books,
            progress_taken = report.progress.taken,
            progress_pushed = report.progress.pushed,
            conflicts = report.progress.conflicts,
            "Sync pass finished"
        );
        Ok(report)
    }

    /// Execute every eligible queued task
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let _drain = self.drain_lock.lock().await;
        drain::drain(&self.ctx, &self.downloads).await
    }

    /// Move to the state a failed pass leaves behind and hand the error back
    async fn settle(&self, e: ReplicaError) -> ReplicaError {
        if matches!(e, ReplicaError::Cancelled) {
            info!("Sync pass cancelled");
            self.ctx.enter(SyncState::Idle).await;
        } else if e.is_retryable() {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(error = %e, failures = failures, "Server unreachable, sync suspended");
            self.ctx.enter(SyncState::Suspended).await;
        } else {
            error!(error = %e, error_type = e.error_type(), "Sync pass aborted");
            let message = format!("Sync pass aborted: {e}");
            if let Err(journal_error) = self.ctx.journal.append(JournalType::Error, message.clone()).await {
                warn!(error = %journal_error, "Failed to journal sync error");
            }
            self.ctx
                .emit(EventKind::Notification { level: JournalType::Error, message })
                .await;
            self.ctx.enter(SyncState::Idle).await;
        }
        e
    }

    fn suspend_delay(&self) -> Duration {
        let failures = self.failures.load(Ordering::Relaxed).max(1);
        self.suspend_backoff.calculate_delay(failures)
    }

    /// Ask for a pass as soon as the current one, if any, is done
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Report connectivity. Regaining it starts a pass, which also drains
    /// the queue.
    pub fn set_connected(&self, connected: bool) {
        self.connectivity.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Stop the run loop, in-flight steps and downloads
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }

    /// Download a book at user-initiated priority
    pub async fn request_download(&self, book_id: &str) -> Result<EnqueueOutcome> {
        self.downloads.request(book_id, Priority::UserInitiated).await
    }

    pub async fn cancel_download(&self, book_id: &str) -> Result<()> {
        self.downloads.cancel(book_id).await
    }

    /// Cancel and forget a download request
    pub async fn discard_download(&self, book_id: &str) -> Result<bool> {
        self.downloads.discard(book_id).await
    }

    pub async fn remove_download(&self, book_id: &str) -> Result<()> {
        self.downloads.remove(book_id).await
    }

    /// Forget a library locally, downloaded files included
    pub async fn purge_library(&self, library_id: &str) -> Result<usize> {
        let _pass = self.pass_lock.lock().await;
        self.downloads.purge_library(library_id).await
    }

    pub async fn purge_server(&self, server_id: &str) -> Result<usize> {
        let _pass = self.pass_lock.lock().await;
        self.downloads.purge_server(server_id).await
    }

    /// Scheduled passes until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.ctx.queue.recover().await?;
        let worker = tokio::spawn(self.clone().drain_worker());

        let mut ticker = tokio::time::interval(Duration::from_secs(self.ctx.config.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut connectivity = self.connectivity.subscribe();

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*connectivity.borrow_and_update() {
                        info!("Connectivity lost");
                        continue;
                    }
                    info!("Connectivity regained");
                }
            }

            if !self.is_connected() {
                debug!("Offline, skipping sync pass");
                continue;
            }

            match self.full_pass().await {
                Ok(_) => {}
                Err(ReplicaError::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    let delay = self.suspend_delay();
                    info!(delay_secs = delay.as_secs(), "Retrying sync after backoff");
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = connectivity.changed() => {}
                    }
                    self.trigger.notify_one();
                }
                // journaled and notified by settle
                Err(_) => {}
            }
        }

        self.downloads.shutdown().await;
        if let Err(e) = worker.await {
            warn!(error = %e, "Drain worker ended abnormally");
        }
        info!("Sync orchestrator stopped");
        Ok(())
    }

    /// Drains the queue whenever work may be available
    async fn drain_worker(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                waited = self.ctx.queue.wait_for_work() => {
                    if let Err(e) = waited {
                        warn!(error = %e, "Failed to poll the task queue");
                        continue;
                    }
                }
            }

            if !self.is_connected() || self.state() == SyncState::Suspended {
                continue;
            }

            match self.drain_queue().await {
                Ok(_) => {}
                Err(ReplicaError::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.ctx.enter(SyncState::Suspended).await;
                    let delay = self.suspend_delay();
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.trigger.notify_one();
                }
                Err(e) => warn!(error = %e, "Queue drain failed"),
            }
        }
        debug!("Drain worker stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{download_config, seed_remote};
    use super::*;
    use crate::client::fake::FakeServer;
    use crate::core::config::TaskQueueConfig;
    use crate::core::task_queue::Operation;
    use crate::db::repository::{fixtures, Repository, ServerRepository};
    use tempfile::TempDir;

    struct Harness {
        fake: Arc<FakeServer>,
        orchestrator: Arc<SyncOrchestrator>,
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        ServerRepository::new(db.clone()).upsert(&fixtures::server()).await.unwrap();
        UserRepository::new(db.clone()).upsert(&fixtures::user("u1")).await.unwrap();

        let fake = FakeServer::new(fixtures::user("u1"));
        seed_remote(&fake);
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(&TaskQueueConfig::default(), db.clone()).with_event_bus(bus.clone()));
        let sync = SyncConfig { page_size: 1, ..SyncConfig::default() };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            queue.clone(),
            fake.api(),
            bus.clone(),
            SyncScope { server_id: "srv".to_string(), user_id: "u1".to_string() },
            &sync,
            &download_config(dir.path().to_path_buf()),
        ));
        Harness { fake, orchestrator, db, queue, bus, _dir: dir }
    }

    #[tokio::test]
    async fn test_full_pass_walks_states_in_order() {
        let h = harness().await;
        let mut events = h.bus.subscribe();

        let report = h.orchestrator.full_pass().await.unwrap();
        assert_eq!(report.libraries, 1);
        assert_eq!(report.series, 2);
        assert_eq!(report.books, 2);
        assert_eq!(h.orchestrator.state(), SyncState::Idle);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventKind::SyncStateChanged { state } = event.kind {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                SyncState::PullingLibraries,
                SyncState::PullingSeries,
                SyncState::PullingBooks,
                SyncState::PullingReadProgress,
                SyncState::DrainingQueue,
                SyncState::Idle,
            ]
        );

        let settings = SettingsRepository::new(h.db.clone()).get().await.unwrap();
        assert!(settings.last_full_sync.is_some());
        assert!(settings.last_read_progress_sync.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_server_suspends_and_keeps_queue() {
        let h = harness().await;
        let push = Operation::PushReadProgress { book_id: "b1".to_string(), user_id: "u1".to_string() };
        h.queue.enqueue(push.clone(), Priority::UserInitiated).await.unwrap();

        h.fake.set_unreachable(true);
        let result = h.orchestrator.full_pass().await;
        assert!(matches!(result, Err(ReplicaError::TransientNetwork(_))));
        assert_eq!(h.orchestrator.state(), SyncState::Suspended);
        assert!(h.queue.get(&push).await.unwrap().is_some());

        h.fake.set_unreachable(false);
        h.orchestrator.full_pass().await.unwrap();
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_data_error_is_journaled_and_notified() {
        let h = harness().await;
        let mut events = h.bus.subscribe();
        // the server authenticates someone else than the session's user
        h.fake.state().user = Some(fixtures::user("intruder"));

        let result = h.orchestrator.full_pass().await;
        assert!(matches!(result, Err(ReplicaError::Validation(_))));
        assert_eq!(h.orchestrator.state(), SyncState::Idle);

        let errors = JournalRepository::new(h.db.clone())
            .list(Some(JournalType::Error), 10)
            .await
            .unwrap();
        assert!(errors.iter().any(|e| e.message.starts_with("Sync pass aborted")));

        let mut notified = false;
        while let Ok(event) = events.try_recv() {
            if let EventKind::Notification { level: JournalType::Error, .. } = event.kind {
                notified = true;
            }
        }
        assert!(notified);
    }

    #[tokio::test]
    async fn test_cancelled_pass_returns_to_idle() {
        let h = harness().await;
        h.orchestrator.shutdown();
        let result = h.orchestrator.full_pass().await;
        assert!(matches!(result, Err(ReplicaError::Cancelled)));
        assert_eq!(h.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_run_loop_passes_then_stops_on_shutdown() {
        let h = harness().await;
        let mut state = h.orchestrator.watch_state();
        let running = tokio::spawn(h.orchestrator.clone().run());

        // the first tick fires at once
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                state.changed().await.unwrap();
                if *state.borrow() == SyncState::Idle {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(BookRepository::new(h.db.clone()).find_by_id("b2").await.unwrap().is_some());

        h.orchestrator.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_from_session_requires_network() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let fake = FakeServer::new(fixtures::user("u1"));
        let queue = Arc::new(TaskQueue::new(&TaskQueueConfig::default(), db.clone()));
        Session::online(db.clone(), fake.api(), "http://komga.test").await.unwrap();

        let offline = Session::offline(db.clone(), queue.clone(), None).await.unwrap();
        let config = Config::default_config().unwrap();
        let result = SyncOrchestrator::from_session(&offline, db.clone(), queue.clone(), Arc::new(EventBus::new()), &config);
        assert!(matches!(result, Err(ReplicaError::Validation(_))));

        let online = offline.with_remote(fake.api());
        let orchestrator =
            SyncOrchestrator::from_session(&online, db, queue, Arc::new(EventBus::new()), &config).unwrap();
        assert_eq!(orchestrator.ctx.scope.user_id, "u1");
    }
}
