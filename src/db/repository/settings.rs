//! Application settings singleton

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{opt_ts_column, ts_to_sql, Settings, Timestamp};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// Key of the single settings row
const SETTINGS_VERSION: i64 = 1;

/// Repository for the Settings singleton
pub struct SettingsRepository {
    db: Arc<DatabaseManager>,
}

impl SettingsRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Current settings, defaults when never saved
    pub async fn get(&self) -> Result<Settings> {
        self.db
            .execute(|conn| {
                let settings = conn
                    .query_row(
                        "SELECT offline_mode, user_id, server_id, download_directory, \
                         last_read_progress_sync, last_full_sync FROM settings WHERE version = ?",
                        [SETTINGS_VERSION],
                        |row| {
                            Ok(Settings {
                                offline_mode: row.get(0)?,
                                user_id: row.get(1)?,
                                server_id: row.get(2)?,
                                download_directory: row.get(3)?,
                                last_read_progress_sync: opt_ts_column(row, 4)?,
                                last_full_sync: opt_ts_column(row, 5)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(settings.unwrap_or_default())
            })
            .await
    }

    pub async fn save(&self, settings: &Settings) -> Result<()> {
        let settings = settings.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO settings (version, offline_mode, user_id, server_id, \
                     download_directory, last_read_progress_sync, last_full_sync) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        SETTINGS_VERSION,
                        settings.offline_mode,
                        settings.user_id,
                        settings.server_id,
                        settings.download_directory,
                        settings.last_read_progress_sync.as_ref().map(ts_to_sql),
                        settings.last_full_sync.as_ref().map(ts_to_sql),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Record the end of a read-progress reconciliation
    pub async fn stamp_read_progress_sync(&self, at: Timestamp) -> Result<()> {
        self.stamp("last_read_progress_sync", at).await
    }

    /// Record the end of a full pull
    pub async fn stamp_full_sync(&self, at: Timestamp) -> Result<()> {
        self.stamp("last_full_sync", at).await
    }

    async fn stamp(&self, column: &'static str, at: Timestamp) -> Result<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO settings (version) VALUES (?)",
                    [SETTINGS_VERSION],
                )?;
                conn.execute(
                    &format!("UPDATE settings SET {column} = ? WHERE version = ?"),
                    params![ts_to_sql(&at), SETTINGS_VERSION],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;

    #[tokio::test]
    async fn test_defaults_then_save() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = SettingsRepository::new(db);
        assert_eq!(repo.get().await.unwrap(), Settings::default());

        repo.stamp_full_sync(fixtures::ts(4)).await.unwrap();
        let mut settings = repo.get().await.unwrap();
        assert_eq!(settings.last_full_sync, Some(fixtures::ts(4)));
        assert!(settings.last_read_progress_sync.is_none());

        settings.offline_mode = true;
        settings.download_directory = Some("/books".to_string());
        repo.save(&settings).await.unwrap();
        assert_eq!(repo.get().await.unwrap(), settings);
    }
}
