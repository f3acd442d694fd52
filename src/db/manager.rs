//! Database manager implementation
//!
//! This module provides replica connection management with:
//! - SQLite connection pool using r2d2
//! - Async wrapper for database operations
//! - Immediate-mode transactions for writers
//! - Per entity-group write serialization
//! - Database backup functionality

use crate::core::error::{Result, StorageError};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task;

/// Database manager with connection pool
pub struct DatabaseManager {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
    groups: GroupLocks,
}

impl DatabaseManager {
    /// Create a new DatabaseManager with the specified database path and pool size
    pub fn new(db_path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(move |conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(StorageError::Pool)?;

        let manager = Self {
            pool,
            db_path: db_path.to_path_buf(),
            groups: GroupLocks::default(),
        };

        manager.migrate()?;

        Ok(manager)
    }

    /// Create a new DatabaseManager with an in-memory database for testing
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(1) // In-memory databases should use a single connection
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(StorageError::Pool)?;

        let manager = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
            groups: GroupLocks::default(),
        };

        manager.migrate()?;

        Ok(manager)
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get().map_err(StorageError::Pool)?)
    }

    /// Execute a database operation asynchronously
    ///
    /// This wraps synchronous database operations in tokio::task::spawn_blocking
    /// to avoid blocking the async runtime.
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().map_err(StorageError::Pool)?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))?
    }

    /// Execute a database operation within a transaction
    ///
    /// The transaction takes the write lock up front (`BEGIN IMMEDIATE`), is
    /// committed if the closure returns Ok and rolled back if it returns Err.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(StorageError::Pool)?;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::Sqlite)?;
            let result = f(&tx)?;
            tx.commit().map_err(StorageError::Sqlite)?;

            Ok(result)
        })
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))?
    }

    /// Serialize writers of one logical entity group (e.g. a series with its
    /// books, media and aggregation). Readers never take this lock.
    pub async fn lock_group(&self, group: &str) -> OwnedMutexGuard<()> {
        self.groups.lock(group).await
    }

    /// Execute database migrations
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.get_connection()?;
        crate::db::migrations::run_migrations(&mut conn)
    }

    /// Backup the database to the specified path using SQLite's backup API
    pub async fn backup(&self, backup_path: PathBuf) -> Result<()> {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = backup_path.parent() {
                std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
            }

            let src_conn = pool.get().map_err(StorageError::Pool)?;
            let mut dst_conn = Connection::open(&backup_path).map_err(StorageError::Sqlite)?;

            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)
                .map_err(StorageError::Sqlite)?;
            backup
                .run_to_completion(5, Duration::from_millis(250), None)
                .map_err(StorageError::Sqlite)?;

            Ok(())
        })
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))?
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Get the current pool size
    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }
}

impl Clone for DatabaseManager {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            db_path: self.db_path.clone(),
            groups: self.groups.clone(),
        }
    }
}

/// Keyed async mutexes, one per entity group
#[derive(Clone, Default)]
struct GroupLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl GroupLocks {
    async fn lock(&self, group: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds so the map stays bounded
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(group.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
