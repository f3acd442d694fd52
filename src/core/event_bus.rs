//! Event bus for replica notifications
//!
//! The bus carries everything a UI or cache layer needs to react to:
//! - entity changes and deletions keyed by entity id
//! - task queue transitions
//! - download progress keyed by book id
//! - sync state changes and user-facing notifications
//!
//! Consumers either take a broadcast receiver (`subscribe`) or register an
//! async handler for one topic (`subscribe_handler`). Handler failures are
//! isolated: one failing handler never affects the others.

use crate::core::error::{ReplicaError, Result};
use crate::db::models::{JournalType, ThumbnailOwner};
use crate::sync::SyncState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Unique identifier for an event
pub type EventId = String;

/// Unique identifier for a handler subscription
pub type SubscriptionId = String;

const BROADCAST_CAPACITY: usize = 256;

/// Kind of replicated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Library,
    Series,
    Book,
    Collection,
    ReadList,
    User,
}

/// One entity by kind and id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn book(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Book, id)
    }

    pub fn series(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Series, id)
    }

    pub fn library(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Library, id)
    }
}

/// Payload of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    EntityChanged {
        entity: EntityRef,
    },
    EntityDeleted {
        entity: EntityRef,
    },
    ReadProgressChanged {
        book_id: String,
        series_id: Option<String>,
        user_id: String,
    },
    ThumbnailChanged {
        owner: ThumbnailOwner,
        owner_id: String,
    },
    TaskQueueStatus {
        unique_name: String,
        transition: String,
    },
    DownloadProgress {
        book_id: String,
        completed: u64,
        total: Option<u64>,
    },
    DownloadCompleted {
        book_id: String,
        path: String,
    },
    DownloadFailed {
        book_id: String,
        error: String,
    },
    SyncStateChanged {
        state: SyncState,
    },
    Notification {
        level: JournalType,
        message: String,
    },
}

/// Coarse event topic used to key handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    Entity,
    ReadProgress,
    Thumbnail,
    TaskQueue,
    Download,
    Sync,
    Notification,
}

impl EventKind {
    pub fn topic(&self) -> EventTopic {
        match self {
            EventKind::EntityChanged { .. } | EventKind::EntityDeleted { .. } => EventTopic::Entity,
            EventKind::ReadProgressChanged { .. } => EventTopic::ReadProgress,
            EventKind::ThumbnailChanged { .. } => EventTopic::Thumbnail,
            EventKind::TaskQueueStatus { .. } => EventTopic::TaskQueue,
            EventKind::DownloadProgress { .. }
            | EventKind::DownloadCompleted { .. }
            | EventKind::DownloadFailed { .. } => EventTopic::Download,
            EventKind::SyncStateChanged { .. } => EventTopic::Sync,
            EventKind::Notification { .. } => EventTopic::Notification,
        }
    }

    /// Entities whose cached views this event makes stale
    pub fn affected(&self) -> Vec<EntityRef> {
        match self {
            EventKind::EntityChanged { entity } | EventKind::EntityDeleted { entity } => vec![entity.clone()],
            EventKind::ReadProgressChanged { book_id, series_id, .. } => {
                let mut refs = vec![EntityRef::book(book_id.clone())];
                refs.extend(series_id.iter().map(|id| EntityRef::series(id.clone())));
                refs
            }
            EventKind::ThumbnailChanged { owner, owner_id } => {
                let kind = match owner {
                    ThumbnailOwner::Book => EntityKind::Book,
                    ThumbnailOwner::Series => EntityKind::Series,
                    ThumbnailOwner::ReadList => EntityKind::ReadList,
                    ThumbnailOwner::Collection => EntityKind::Collection,
                };
                vec![EntityRef::new(kind, owner_id.clone())]
            }
            EventKind::DownloadCompleted { book_id, .. } => vec![EntityRef::book(book_id.clone())],
            _ => Vec::new(),
        }
    }
}

/// Origin of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Server push stream
    Server,
    /// Sync orchestrator
    Sync,
    /// Task queue
    Queue,
    /// A local facade call
    Local,
}

/// Event published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
}

impl Event {
    pub fn new(kind: EventKind, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn server(kind: EventKind) -> Self {
        Self::new(kind, EventSource::Server)
    }

    pub fn sync(kind: EventKind) -> Self {
        Self::new(kind, EventSource::Sync)
    }

    pub fn queue(kind: EventKind) -> Self {
        Self::new(kind, EventSource::Queue)
    }

    pub fn local(kind: EventKind) -> Self {
        Self::new(kind, EventSource::Local)
    }
}

/// Async event handler
pub type EventHandler = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

/// Filter for querying event history
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub topics: Option<Vec<EventTopic>>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics(mut self, topics: Vec<EventTopic>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Event bus for publish-subscribe
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    subscribers: Arc<RwLock<HashMap<EventTopic, Vec<Subscriber>>>>,
    event_log: Arc<RwLock<Vec<Event>>>,
    max_history: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_size(1000)
    }

    pub fn with_history_size(max_history: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            event_log: Arc::new(RwLock::new(Vec::new())),
            max_history,
        }
    }

    /// Receiver for every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Register a handler for one topic
    pub async fn subscribe_handler(&self, topic: EventTopic, handler: EventHandler) -> SubscriptionId {
        let id = Uuid::new_v4().to_string();
        self.subscribers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(Subscriber { id: id.clone(), handler });
        id
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;
        for subs in subscribers.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == subscription_id) {
                subs.remove(pos);
                return Ok(());
            }
        }
        Err(ReplicaError::NotFound(format!("subscription {subscription_id}")))
    }

    /// Publish an event to the broadcast channel and the topic handlers
    pub async fn publish(&self, event: Event) {
        {
            let mut log = self.event_log.write().await;
            log.push(event.clone());
            if log.len() > self.max_history {
                let excess = log.len() - self.max_history;
                log.drain(0..excess);
            }
        }

        // No receivers is not an error
        let _ = self.sender.send(event.clone());

        let subscribers = {
            let subs = self.subscribers.read().await;
            subs.get(&event.kind.topic()).cloned()
        };
        let Some(subscribers) = subscribers else {
            return;
        };

        let mut handles = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = (subscriber.handler)(event).await {
                    tracing::error!(subscription = %subscriber.id, error = %e, "Event handler failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn emit(&self, kind: EventKind, source: EventSource) {
        self.publish(Event::new(kind, source)).await;
    }

    /// Recent events, oldest first
    pub async fn get_history(&self, filter: EventFilter) -> Vec<Event> {
        let log = self.event_log.read().await;
        let mut events: Vec<Event> = log
            .iter()
            .filter(|e| filter.topics.as_ref().map_or(true, |t| t.contains(&e.kind.topic())))
            .filter(|e| filter.since.map_or(true, |since| e.timestamp >= since))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(0..skip);
        }
        events
    }

    pub async fn clear_history(&self) {
        self.event_log.write().await.clear();
    }

    pub async fn subscriber_count(&self, topic: EventTopic) -> usize {
        self.subscribers.read().await.get(&topic).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
