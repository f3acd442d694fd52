//! Queue draining
//!
//! Claims tasks in priority order and executes them against the server.
//! Downloads are handed to the download workers; everything else runs
//! inline. A transient failure stops the drain so the orchestrator can
//! suspend instead of burning through every task's attempts.

use super::download::DownloadManager;
use super::SyncContext;
use crate::core::error::{ReplicaError, Result};
use crate::core::task_queue::{FailOutcome, Operation};
use crate::db::models::{JournalType, ReadProgressUpdate};
use tracing::{debug, info, warn};

/// Outcome of one drain run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Downloads handed to the download workers
    pub dispatched: usize,
}

impl SyncContext {
    /// Execute one non-download operation
    pub(crate) async fn execute(&self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::PushReadProgress { book_id, user_id } => self.push_progress(book_id, user_id).await,
            Operation::DeleteReadProgress { book_id, user_id } => self.push_delete(book_id, user_id).await,
            Operation::RefreshSeries { series_id } => self.refresh_series(series_id).await.map(|_| ()),
            Operation::SyncLibrary { library_id } => self.sync_library(library_id).await.map(|_| ()),
            Operation::FullSync => self.pull_everything().await.map(|_| ()),
            Operation::DownloadBook { book_id } => Err(ReplicaError::Validation(format!(
                "download of {book_id} must go through the download workers"
            ))),
            Operation::Unsupported => Err(ReplicaError::TaskPermanentFailure(
                "operation type is not supported by this build".to_string(),
            )),
        }
    }

    fn check_user(&self, user_id: &str) -> Result<()> {
        if user_id != self.scope.user_id {
            return Err(ReplicaError::TaskPermanentFailure(format!(
                "progress belongs to user {user_id}, session user is {}",
                self.scope.user_id
            )));
        }
        Ok(())
    }

    /// Send the replica's current position. Nothing to send if the row has
    /// since been deleted; the matching delete task covers it.
    async fn push_progress(&self, book_id: &str, user_id: &str) -> Result<()> {
        self.check_user(user_id)?;
        let Some(progress) = self.progress.get(book_id, user_id).await? else {
            debug!(book_id = %book_id, "No local progress left to push");
            return Ok(());
        };

        let update = ReadProgressUpdate {
            page: Some(progress.page),
            completed: Some(progress.completed),
        };
        self.step(
            "push read progress",
            self.remote.clients.books.mark_read_progress(book_id, update),
        )
        .await?;
        info!(book_id = %book_id, page = progress.page, completed = progress.completed, "Read progress pushed");
        Ok(())
    }

    /// Delete the server's progress unless the replica wrote a new one since
    async fn push_delete(&self, book_id: &str, user_id: &str) -> Result<()> {
        self.check_user(user_id)?;
        if self.progress.get(book_id, user_id).await?.is_some() {
            debug!(book_id = %book_id, "Progress written again since the delete, skipping");
            return Ok(());
        }

        match self
            .step(
                "delete read progress",
                self.remote.clients.books.delete_read_progress(book_id),
            )
            .await
        {
            Ok(()) | Err(ReplicaError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Drain eligible tasks until the queue has nothing to hand out
pub(crate) async fn drain(ctx: &SyncContext, downloads: &DownloadManager) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    while !ctx.shutdown.is_cancelled() {
        let Some(task) = ctx.queue.dequeue_next().await? else {
            break;
        };

        if let Operation::DownloadBook { .. } = task.operation {
            downloads.spawn(task);
            report.dispatched += 1;
            continue;
        }

        match ctx.execute(&task.operation).await {
            Ok(()) => {
                ctx.queue.complete(&task).await?;
                report.completed += 1;
            }
            Err(ReplicaError::Cancelled) => {
                ctx.queue.release(&task).await?;
                break;
            }
            Err(e) => {
                match ctx.queue.fail_with(&task, &e).await? {
                    FailOutcome::Retrying { .. } => report.retrying += 1,
                    FailOutcome::Failed | FailOutcome::Abandoned => {
                        report.failed += 1;
                        ctx.journal
                            .append(
                                JournalType::Error,
                                format!("Task {} gave up: {e}", task.unique_name),
                            )
                            .await?;
                    }
                }
                if e.is_retryable() {
                    warn!(task = %task.unique_name, error = %e, "Server unreachable, stopping drain");
                    return Err(e);
                }
            }
        }
    }

    if report != DrainReport::default() {
        info!(
            completed = report.completed,
            retrying = report.retrying,
            failed = report.failed,
            dispatched = report.dispatched,
            "Queue drained"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, downloads, pulled_context, seed_remote};
    use super::*;
    use crate::core::task_queue::{Priority, TaskStatus};
    use crate::db::repository::fixtures::{self, ts};
    use crate::db::repository::JournalRepository;

    fn push(book_id: &str) -> Operation {
        Operation::PushReadProgress { book_id: book_id.to_string(), user_id: "u1".to_string() }
    }

    #[tokio::test]
    async fn test_push_sends_local_position() {
        let (fake, ctx, downloads) = pulled_context().await;
        ctx.progress.upsert(&fixtures::progress("b1", "u1", 2, ts(9))).await.unwrap();
        ctx.queue.enqueue(push("b1"), Priority::UserInitiated).await.unwrap();

        let report = drain(&ctx, &downloads).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(fake.progress("b1", "u1").unwrap().page, 2);
        assert_eq!(ctx.queue.counts().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_push_without_local_row_is_a_no_op() {
        let (fake, ctx, downloads) = pulled_context().await;
        ctx.queue.enqueue(push("b1"), Priority::UserInitiated).await.unwrap();

        drain(&ctx, &downloads).await.unwrap();
        assert_eq!(fake.calls("mark_read_progress"), 0);
    }

    #[tokio::test]
    async fn test_delete_skipped_when_progress_rewritten() {
        let (fake, ctx, downloads) = pulled_context().await;
        fake.set_progress(fixtures::progress("b1", "u1", 3, ts(2)));
        ctx.progress.upsert(&fixtures::progress("b1", "u1", 1, ts(9))).await.unwrap();
        let delete = Operation::DeleteReadProgress { book_id: "b1".to_string(), user_id: "u1".to_string() };
        ctx.queue.enqueue(delete, Priority::UserInitiated).await.unwrap();

        drain(&ctx, &downloads).await.unwrap();
        assert_eq!(fake.calls("delete_read_progress"), 0);
        assert!(fake.progress("b1", "u1").is_some());

        ctx.progress.delete("b1", "u1").await.unwrap();
        let delete = Operation::DeleteReadProgress { book_id: "b1".to_string(), user_id: "u1".to_string() };
        ctx.queue.enqueue(delete, Priority::UserInitiated).await.unwrap();
        drain(&ctx, &downloads).await.unwrap();
        assert!(fake.progress("b1", "u1").is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_drain_and_keeps_tasks() {
        let (fake, ctx, downloads) = pulled_context().await;
        ctx.progress.upsert(&fixtures::progress("b1", "u1", 2, ts(9))).await.unwrap();
        ctx.progress.upsert(&fixtures::progress("b2", "u1", 2, ts(9))).await.unwrap();
        ctx.queue.enqueue(push("b1"), Priority::UserInitiated).await.unwrap();
        ctx.queue.enqueue(push("b2"), Priority::UserInitiated).await.unwrap();

        fake.set_unreachable(true);
        let result = drain(&ctx, &downloads).await;
        assert!(matches!(result, Err(ReplicaError::TransientNetwork(_))));

        let counts = ctx.queue.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_rejected_push_marked_failed_and_journaled() {
        let (fake, ctx, downloads) = pulled_context().await;
        ctx.progress.upsert(&fixtures::progress("b1", "u1", 2, ts(9))).await.unwrap();
        ctx.queue.enqueue(push("b1"), Priority::UserInitiated).await.unwrap();
        fake.fail_next(
            "mark_read_progress",
            ReplicaError::Rejected { status: 400, message: "page out of range".to_string() },
        );

        let report = drain(&ctx, &downloads).await.unwrap();
        assert_eq!(report.failed, 1);
        let record = ctx.queue.get(&push("b1")).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed.as_str());

        let errors = JournalRepository::new(ctx.db.clone())
            .list(Some(JournalType::Error), 10)
            .await
            .unwrap();
        assert!(errors[0].message.contains("push_read_progress:b1:u1"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_abandoned() {
        let (fake, ctx) = context(10).await;
        seed_remote(&fake);
        let ctx = std::sync::Arc::new(ctx);
        let downloads = downloads(&ctx);
        ctx.queue
            .enqueue(Operation::RefreshSeries { series_id: "s1".to_string() }, Priority::Background)
            .await
            .unwrap();
        fake.fail_next("get_series", ReplicaError::Rejected { status: 403, message: "forbidden".to_string() });

        let report = drain(&ctx, &downloads).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(ctx.queue.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_user_progress_fails_permanently() {
        let (_fake, ctx, downloads) = pulled_context().await;
        let foreign = Operation::PushReadProgress { book_id: "b1".to_string(), user_id: "u2".to_string() };
        ctx.queue.enqueue(foreign.clone(), Priority::Background).await.unwrap();

        drain(&ctx, &downloads).await.unwrap();
        let record = ctx.queue.get(&foreign).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed.as_str());
    }
}
