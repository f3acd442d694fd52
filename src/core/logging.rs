//! Structured logging system
//!
//! This module provides structured logging with:
//! - JSON and text format support
//! - Configurable log levels through `EnvFilter`
//! - Daily-rolling log files
//! - A journal layer that mirrors warnings and errors into the replica

use crate::core::config::LoggingConfig;
use crate::db::manager::DatabaseManager;
use crate::db::models::JournalType;
use crate::db::repository::journal;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Context as LayerContext, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_FILE_PREFIX: &str = "shelf-replica.log";

/// A warning or error captured for the log journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub entry_type: JournalType,
    pub message: String,
}

/// Layer forwarding WARN and ERROR events to the journal writer
pub struct JournalLayer {
    sender: mpsc::UnboundedSender<JournalRecord>,
}

impl JournalLayer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JournalRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for JournalLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let entry_type = match *event.metadata().level() {
            Level::ERROR => JournalType::Error,
            Level::WARN => JournalType::Warn,
            _ => return,
        };
        // The writer's own diagnostics must not feed back into the journal
        if event.metadata().target() == module_path!() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let _ = self.sender.send(JournalRecord {
            entry_type,
            message: format!("{}{}", visitor.message, visitor.fields),
        });
    }
}

/// Logger instance that manages the logging system
pub struct Logger {
    _guard: Option<WorkerGuard>,
    journal: Option<mpsc::UnboundedReceiver<JournalRecord>>,
}

impl Logger {
    /// Initialize the global tracing subscriber from configuration
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&config.level)?;
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        let (writer, guard) = match config.output.as_str() {
            "stdout" => tracing_appender::non_blocking(std::io::stdout()),
            "file" => {
                let log_dir = config
                    .log_dir
                    .as_ref()
                    .context("log_dir must be specified when output is 'file'")?;
                std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;
                let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
                tracing_appender::non_blocking(appender)
            }
            other => anyhow::bail!("Invalid output configuration: {}", other),
        };

        let fmt_layer = match config.format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .boxed(),
            "text" => fmt::layer()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .boxed(),
            other => anyhow::bail!("Invalid format configuration: {}", other),
        };

        let (journal_layer, journal) = if config.journal {
            let (layer, receiver) = JournalLayer::new();
            (Some(layer), Some(receiver))
        } else {
            (None, None)
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(journal_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::info!(
            level = %config.level,
            format = %config.format,
            output = %config.output,
            journal = config.journal,
            "Logging system initialized"
        );

        Ok(Logger {
            _guard: Some(guard),
            journal,
        })
    }

    /// Start persisting journal records into the replica.
    /// Returns `None` when the journal is disabled or already running.
    pub fn spawn_journal_writer(&mut self, db: Arc<DatabaseManager>) -> Option<JoinHandle<()>> {
        self.journal.take().map(|receiver| spawn_journal_writer(receiver, db))
    }
}

/// Drain journal records into the `log_journal` table until every sender is gone
pub fn spawn_journal_writer(
    mut receiver: mpsc::UnboundedReceiver<JournalRecord>,
    db: Arc<DatabaseManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = receiver.recv().await {
            let result = db
                .execute(move |conn| journal::append(conn, record.entry_type, &record.message))
                .await;
            if let Err(e) = result {
                tracing::debug!(error = %e, "Failed to write journal entry");
            }
        }
    })
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {}", level),
    }
}
