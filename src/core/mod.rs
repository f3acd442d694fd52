//! Core application layer
//!
//! This module provides:
//! - Configuration management
//! - Error handling and type system
//! - Structured logging system
//! - Event bus for pub/sub messaging
//! - The durable task queue
//! - Sessions choosing between the online and offline facade
//! - Reconciliation of the server's push events
//! - Storage of downloaded book files

pub mod config;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod reconciler;
pub mod session;
pub mod storage;
pub mod task_queue;

pub use config::Config;
pub use error::{ErrorContext, ReplicaError, Result, StorageError};
pub use event_bus::{EntityKind, EntityRef, Event, EventBus, EventKind, EventSource};
pub use logging::Logger;
pub use reconciler::EventReconciler;
pub use session::{Mode, Session};
pub use storage::DownloadStore;
pub use task_queue::{Operation, Priority, TaskQueue, TaskStatus};
