//! Configuration management

use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix, e.g. `REPLICA_SYNC__INTERVAL=600`
pub const ENV_PREFIX: &str = "REPLICA";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server configuration: {0}")]
    InvalidServer(String),

    #[error("Invalid database configuration: {0}")]
    InvalidDatabase(String),

    #[error("Invalid sync configuration: {0}")]
    InvalidSync(String),

    #[error("Invalid task queue configuration: {0}")]
    InvalidTaskQueue(String),

    #[error("Invalid download configuration: {0}")]
    InvalidDownloads(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub task_queue: TaskQueueConfig,
    pub downloads: DownloadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: Environment variables > Config file > Defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults(ConfigBuilder::builder())?;

        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            builder = builder.add_source(File::from(path));
        }

        // REPLICA_ prefix, __ for nesting: REPLICA_DATABASE__PATH=/tmp/replica.db
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path layered over defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults only
    pub fn default_config() -> Result<Self, ConfigError> {
        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as TOML, e.g. to seed a first-run config file
    pub fn write_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        }
        std::fs::write(path, text).map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let download_dir = dirs::download_dir()
            .unwrap_or_else(|| PathBuf::from("./downloads"))
            .join("shelf-replica");

        Ok(builder
            .set_default("server.base_url", "http://localhost:25600")?
            .set_default("server.request_timeout", 30)?
            .set_default("server.connect_timeout", 10)?
            .set_default("database.path", "./data/replica.db")?
            .set_default("database.connection_pool_size", 4)?
            .set_default("database.busy_timeout", 5000)?
            .set_default("sync.interval", 900)?
            .set_default("sync.page_size", 100)?
            .set_default("sync.request_timeout", 60)?
            .set_default("sync.suspend_backoff_base", 5)?
            .set_default("sync.suspend_backoff_max", 600)?
            .set_default("task_queue.max_attempts", 5)?
            .set_default("task_queue.backoff_base", 5)?
            .set_default("task_queue.backoff_max", 600)?
            .set_default("task_queue.poll_interval", 500)?
            .set_default("downloads.directory", download_dir.display().to_string())?
            .set_default("downloads.concurrency", 2)?
            .set_default("downloads.progress_interval", 256 * 1024)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?
            .set_default("logging.journal", true)?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.sync.validate()?;
        self.task_queue.validate()?;
        self.downloads.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub request_timeout: u64, // seconds
    pub connect_timeout: u64, // seconds
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::InvalidServer(format!("base_url: {}", e)))?;

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidServer("request_timeout must be greater than 0".to_string()));
        }

        if self.connect_timeout == 0 {
            return Err(ConfigError::InvalidServer("connect_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub connection_pool_size: usize,
    pub busy_timeout: u64, // milliseconds
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDatabase("path cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidDatabase("connection_pool_size must be greater than 0".to_string()));
        }

        if self.busy_timeout == 0 {
            return Err(ConfigError::InvalidDatabase("busy_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval: u64, // seconds between scheduled passes
    pub page_size: u32,
    pub request_timeout: u64, // seconds per network step
    pub suspend_backoff_base: u64, // seconds
    pub suspend_backoff_max: u64,  // seconds
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: 900,
            page_size: 100,
            request_timeout: 60,
            suspend_backoff_base: 5,
            suspend_backoff_max: 600,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::InvalidSync("interval must be greater than 0".to_string()));
        }

        if self.page_size == 0 || self.page_size > 1000 {
            return Err(ConfigError::InvalidSync("page_size must be within 1..=1000".to_string()));
        }

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidSync("request_timeout must be greater than 0".to_string()));
        }

        if self.suspend_backoff_base == 0 || self.suspend_backoff_max < self.suspend_backoff_base {
            return Err(ConfigError::InvalidSync(
                "suspend backoff requires 0 < base <= max".to_string(),
            ));
        }

        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    pub max_attempts: u32,
    pub backoff_base: u64, // seconds
    pub backoff_max: u64,  // seconds
    pub poll_interval: u64, // milliseconds
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 5,
            backoff_max: 600,
            poll_interval: 500,
        }
    }
}

impl TaskQueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidTaskQueue("max_attempts must be greater than 0".to_string()));
        }

        if self.backoff_base == 0 || self.backoff_max < self.backoff_base {
            return Err(ConfigError::InvalidTaskQueue(
                "backoff requires 0 < backoff_base <= backoff_max".to_string(),
            ));
        }

        if self.poll_interval == 0 {
            return Err(ConfigError::InvalidTaskQueue("poll_interval must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub directory: PathBuf,
    pub concurrency: usize,
    pub progress_interval: u64, // bytes between progress events
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDownloads("directory cannot be empty".to_string()));
        }

        if self.concurrency == 0 {
            return Err(ConfigError::InvalidDownloads("concurrency must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_dir: Option<PathBuf>,
    /// Mirror warnings and errors into the replica's log journal
    pub journal: bool,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_dir.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_dir must be specified when output is 'file'".to_string()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default_config().unwrap();
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.task_queue.max_attempts, 5);
        assert_eq!(config.downloads.concurrency, 2);
        assert!(config.logging.journal);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.toml");
        std::fs::write(
            &path,
            "[sync]\npage_size = 20\n\n[downloads]\nconcurrency = 4\ndirectory = \"/tmp/books\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.downloads.concurrency, 4);
        assert_eq!(config.downloads.directory, PathBuf::from("/tmp/books"));
        // untouched sections keep their defaults
        assert_eq!(config.task_queue.backoff_base, 5);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_write_toml_round_trips_through_loader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("replica.toml");

        let mut config = Config::default_config().unwrap();
        config.sync.interval = 42;
        config.write_toml(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.sync.interval, 42);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default_config().unwrap();
        config.sync.page_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSync(_))));

        let mut config = Config::default_config().unwrap();
        config.task_queue.backoff_max = 1;
        config.task_queue.backoff_base = 10;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTaskQueue(_))));

        let mut config = Config::default_config().unwrap();
        config.server.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidServer(_))));

        let mut config = Config::default_config().unwrap();
        config.logging.output = "file".to_string();
        config.logging.log_dir = None;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLogging(_))));
    }
}
