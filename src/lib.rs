//! Shelf Replica Library
//!
//! This library provides an offline replica of a comics/manga media server,
//! including the replica store, a durable task queue, a client facade that
//! serves callers online or offline, and the engine that keeps the replica
//! in sync with the server.

pub mod cache;
pub mod client;
pub mod core;
pub mod db;
pub mod sync;

// Re-export commonly used types
pub use crate::core::{Config, EventBus, EventReconciler, Mode, ReplicaError, Result, Session, TaskQueue};
pub use cache::CacheRegistry;
pub use client::{MediaClients, OfflineClient, RemoteApi, RemoteClient};
pub use db::DatabaseManager;
pub use sync::{DownloadManager, SyncOrchestrator, SyncState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
