//! Replica store
//!
//! This module provides the persisted mirror of server state:
//! - Connection pool management and async execution
//! - Schema migrations
//! - Replica models shared with the wire format
//! - Per-aggregate repositories

pub mod manager;
pub mod migrations;
pub mod models;
pub mod repository;

pub use manager::DatabaseManager;
pub use models::{
    Book, JournalEntry, JournalType, Library, MediaServer, Page, PageRequest, ReadProgress, Series,
    Settings, TaskRecord, Thumbnail, ThumbnailOwner, User,
};
pub use repository::{
    BookRepository, JournalRepository, LibraryRepository, ReadProgressRepository,
    ReferentialRepository, Repository, SeriesRepository, ServerRepository, SettingsRepository,
    TaskCounts, TaskRepository, ThumbnailRepository, UserRepository,
};
