//! Durable task queue
//!
//! Mutating operations that cannot complete synchronously are persisted as
//! task rows keyed by a unique name. The queue deduplicates on that name,
//! hands out work by priority, and retries failures with exponential backoff
//! until the operation's terminal policy applies.

use crate::core::config::TaskQueueConfig;
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::{Event, EventBus, EventKind};
use crate::db::manager::DatabaseManager;
use crate::db::models::{now, TaskRecord, Timestamp};
use crate::db::repository::{TaskCounts, TaskRepository};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Task priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Opportunistic work such as prefetching
    Prefetch = 1,
    /// Sync-driven work
    Background = 2,
    /// Work a user is waiting for
    UserInitiated = 3,
}

impl Priority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            i32::MIN..=1 => Priority::Prefetch,
            2 => Priority::Background,
            _ => Priority::UserInitiated,
        }
    }
}

/// Task status as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Active,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "active" => Some(TaskStatus::Active),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Retry policy for tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(5),
                max: Duration::from_secs(600),
            },
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TaskQueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(config.backoff_base),
                max: Duration::from_secs(config.backoff_max),
            },
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay before attempt `attempt + 1`, where `attempt` counts failures so far
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,
            BackoffStrategy::Exponential { base, max } => {
                // attempt 1 waits base, attempt 2 waits 2 * base, ...
                let exponent = attempt.saturating_sub(1).min(32);
                let base_ms = base.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let delay_ms = base_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(delay_ms.min(max_ms))
            }
        }
    }
}

/// What happens to a task once it can no longer be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalPolicy {
    /// Keep the row as `failed` so it stays visible and can be re-enqueued
    MarkFailed,
    /// Delete the row; the next sync pass repeats the work anyway
    Abandon,
}

/// A queued mutating operation. Stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    DownloadBook { book_id: String },
    PushReadProgress { book_id: String, user_id: String },
    DeleteReadProgress { book_id: String, user_id: String },
    RefreshSeries { series_id: String },
    SyncLibrary { library_id: String },
    FullSync,
    /// Any payload whose tag this build does not know
    #[serde(other)]
    Unsupported,
}

impl Operation {
    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::DownloadBook { .. } => "download_book",
            Operation::PushReadProgress { .. } => "push_read_progress",
            Operation::DeleteReadProgress { .. } => "delete_read_progress",
            Operation::RefreshSeries { .. } => "refresh_series",
            Operation::SyncLibrary { .. } => "sync_library",
            Operation::FullSync => "full_sync",
            Operation::Unsupported => "unsupported",
        }
    }

    /// `<type>:<target>`; the queue's deduplication key
    pub fn unique_name(&self) -> String {
        match self {
            Operation::DownloadBook { book_id } => format!("download_book:{book_id}"),
            Operation::PushReadProgress { book_id, user_id } => {
                format!("push_read_progress:{book_id}:{user_id}")
            }
            Operation::DeleteReadProgress { book_id, user_id } => {
                format!("delete_read_progress:{book_id}:{user_id}")
            }
            Operation::RefreshSeries { series_id } => format!("refresh_series:{series_id}"),
            Operation::SyncLibrary { library_id } => format!("sync_library:{library_id}"),
            Operation::FullSync => "full_sync".to_string(),
            Operation::Unsupported => "unsupported".to_string(),
        }
    }

    pub fn terminal_policy(&self) -> TerminalPolicy {
        match self {
            Operation::DownloadBook { .. }
            | Operation::PushReadProgress { .. }
            | Operation::DeleteReadProgress { .. }
            | Operation::Unsupported => TerminalPolicy::MarkFailed,
            Operation::RefreshSeries { .. } | Operation::SyncLibrary { .. } | Operation::FullSync => {
                TerminalPolicy::Abandon
            }
        }
    }

    /// Decode a stored payload. Malformed JSON maps to `Unsupported`.
    pub fn decode(payload: &str) -> Self {
        serde_json::from_str(payload).unwrap_or_else(|e| {
            warn!(error = %e, "Undecodable task payload");
            Operation::Unsupported
        })
    }
}

/// A claimed task
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub unique_name: String,
    pub operation: Operation,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_date: Timestamp,
}

impl QueuedTask {
    fn from_record(record: TaskRecord) -> Self {
        Self {
            operation: Operation::decode(&record.payload),
            priority: Priority::from_i32(record.priority),
            attempts: record.attempts.max(0) as u32,
            max_attempts: record.max_attempts.max(1) as u32,
            created_date: record.created_date,
            unique_name: record.unique_name,
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// A pending or active row with the same unique name already exists
    AlreadyQueued,
}

/// Result of a failure report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { not_before: Timestamp },
    Failed,
    Abandoned,
}

/// Task queue over the replica's task table
pub struct TaskQueue {
    repo: TaskRepository,
    policy: RetryPolicy,
    poll_interval: Duration,
    event_bus: Option<Arc<EventBus>>,
    work_available: Notify,
}

impl TaskQueue {
    pub fn new(config: &TaskQueueConfig, db: Arc<DatabaseManager>) -> Self {
        Self {
            repo: TaskRepository::new(db),
            policy: RetryPolicy::from_config(config),
            poll_interval: Duration::from_millis(config.poll_interval),
            event_bus: None,
            work_available: Notify::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn publish(&self, unique_name: &str, transition: &str) {
        if let Some(bus) = &self.event_bus {
            bus.publish(Event::queue(EventKind::TaskQueueStatus {
                unique_name: unique_name.to_string(),
                transition: transition.to_string(),
            }))
            .await;
        }
    }

    /// Append an operation unless an identical one is pending or active
    pub async fn enqueue(&self, operation: Operation, priority: Priority) -> Result<EnqueueOutcome> {
        if operation == Operation::Unsupported {
            return Err(ReplicaError::Validation("cannot enqueue an unsupported operation".to_string()));
        }

        let unique_name = operation.unique_name();
        let at = now();
        let record = TaskRecord {
            unique_name: unique_name.clone(),
            task_type: operation.type_name().to_string(),
            priority: priority.as_i32(),
            status: TaskStatus::Pending.as_str().to_string(),
            payload: serde_json::to_string(&operation)?,
            attempts: 0,
            max_attempts: self.policy.max_attempts as i32,
            error: None,
            not_before: None,
            created_date: at,
            updated_date: at,
        };

        if self.repo.insert_pending(&record).await? {
            debug!(task = %unique_name, priority = ?priority, "Task enqueued");
            self.work_available.notify_one();
            self.publish(&unique_name, "enqueued").await;
            Ok(EnqueueOutcome::Inserted)
        } else {
            debug!(task = %unique_name, "Task already queued");
            Ok(EnqueueOutcome::AlreadyQueued)
        }
    }

    /// Claim the next eligible task
    pub async fn dequeue_next(&self) -> Result<Option<QueuedTask>> {
        let Some(record) = self.repo.claim_next(now()).await? else {
            return Ok(None);
        };
        let task = QueuedTask::from_record(record);
        debug!(task = %task.unique_name, attempts = task.attempts, "Task claimed");
        self.publish(&task.unique_name, "active").await;
        Ok(Some(task))
    }

    /// The task succeeded; its row is removed
    pub async fn complete(&self, task: &QueuedTask) -> Result<()> {
        self.repo.delete(&task.unique_name).await?;
        debug!(task = %task.unique_name, "Task completed");
        self.publish(&task.unique_name, "completed").await;
        Ok(())
    }

    /// Report a failed attempt
    pub async fn fail(&self, task: &QueuedTask, error: &str, retryable: bool) -> Result<FailOutcome> {
        let attempts = task.attempts + 1;
        let max_attempts = task.max_attempts.min(self.policy.max_attempts.max(1));

        if retryable && attempts < max_attempts {
            let delay = self.policy.backoff.calculate_delay(attempts);
            let not_before = now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(600));
            self.repo
                .reschedule(&task.unique_name, attempts as i32, not_before, error)
                .await?;
            warn!(
                task = %task.unique_name,
                attempt = attempts,
                max_attempts = max_attempts,
                delay_secs = delay.as_secs(),
                error = %error,
                "Retrying task"
            );
            self.publish(&task.unique_name, "retrying").await;
            return Ok(FailOutcome::Retrying { not_before });
        }

        match task.operation.terminal_policy() {
            TerminalPolicy::MarkFailed => {
                self.repo
                    .mark_failed(&task.unique_name, attempts as i32, error)
                    .await?;
                warn!(task = %task.unique_name, attempts = attempts, error = %error, "Task failed");
                self.publish(&task.unique_name, "failed").await;
                Ok(FailOutcome::Failed)
            }
            TerminalPolicy::Abandon => {
                self.repo.delete(&task.unique_name).await?;
                info!(task = %task.unique_name, attempts = attempts, error = %error, "Task abandoned");
                self.publish(&task.unique_name, "abandoned").await;
                Ok(FailOutcome::Abandoned)
            }
        }
    }

    /// Report a failure using the error's own retry classification
    pub async fn fail_with(&self, task: &QueuedTask, error: &ReplicaError) -> Result<FailOutcome> {
        self.fail(task, &error.to_string(), error.is_retryable()).await
    }

    /// Hand an active task back without counting an attempt
    pub async fn release(&self, task: &QueuedTask) -> Result<()> {
        if self.repo.release(&task.unique_name).await? {
            debug!(task = %task.unique_name, "Task released");
            self.work_available.notify_one();
            self.publish(&task.unique_name, "released").await;
        }
        Ok(())
    }

    /// Drop a queued operation that no worker has claimed
    pub async fn remove(&self, operation: &Operation) -> Result<bool> {
        let unique_name = operation.unique_name();
        let removed = self.repo.delete_inactive(&unique_name).await?;
        if removed {
            debug!(task = %unique_name, "Task removed");
            self.publish(&unique_name, "removed").await;
        }
        Ok(removed)
    }

    /// Reset tasks left active by a previous process
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.repo.reset_active().await?;
        if recovered > 0 {
            info!(recovered_count = recovered, "Recovered interrupted tasks");
            self.work_available.notify_one();
            self.publish("*", "recovered").await;
        }
        Ok(recovered)
    }

    /// Wait until work may be available: an enqueue, the earliest backoff
    /// deadline, or the poll interval, whichever comes first
    pub async fn wait_for_work(&self) -> Result<()> {
        let at = now();
        let mut wait = self.poll_interval;
        if let Some(next) = self.repo.next_eligible_at(at).await? {
            if let Ok(until) = (next - at).to_std() {
                wait = wait.max(until.min(Duration::from_secs(60)));
            }
        }
        let _ = tokio::time::timeout(wait, self.work_available.notified()).await;
        Ok(())
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.repo.list(status.map(|s| s.as_str())).await
    }

    pub async fn get(&self, operation: &Operation) -> Result<Option<TaskRecord>> {
        self.repo.get(&operation.unique_name()).await
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        self.repo.counts().await
    }

    /// Re-queue every failed task with a fresh attempt budget
    pub async fn retry_failed(&self) -> Result<usize> {
        let count = self.repo.retry_failed().await?;
        if count > 0 {
            self.work_available.notify_one();
            self.publish("*", "retry_failed").await;
        }
        Ok(count)
    }

    pub async fn purge_failed(&self) -> Result<usize> {
        let count = self.repo.purge_failed().await?;
        if count > 0 {
            self.publish("*", "purge_failed").await;
        }
        Ok(count)
    }
}
