//! Session: which facade implementation serves the caller
//!
//! A session is opened once against one server and one user. Online
//! sessions talk to the server directly; offline sessions serve reads from
//! the replica and queue progress writes. The mode is fixed for the
//! lifetime of the session; switching means opening a new one.

use crate::client::{MediaClients, OfflineClient, RemoteApi};
use crate::core::error::{ReplicaError, Result};
use crate::core::event_bus::EventBus;
use crate::core::task_queue::TaskQueue;
use crate::db::manager::DatabaseManager;
use crate::db::models::{MediaServer, User};
use crate::db::repository::{Repository, ServerRepository, SettingsRepository, UserRepository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Execution mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Online,
    Offline,
}

pub struct Session {
    id: Uuid,
    mode: Mode,
    server: MediaServer,
    user: User,
    clients: MediaClients,
    remote: Option<RemoteApi>,
}

impl Session {
    /// Authenticate against the server and record it as the current
    /// server and user
    pub async fn online(db: Arc<DatabaseManager>, remote: RemoteApi, base_url: &str) -> Result<Self> {
        let mut user = remote.clients.users.get_me().await?;

        let servers = ServerRepository::new(db.clone());
        let server = match servers.find_by_url(base_url).await? {
            Some(server) => server,
            None => MediaServer {
                id: Uuid::new_v4().to_string(),
                base_url: base_url.to_string(),
            },
        };
        servers.upsert(&server).await?;

        user.server_id = server.id.clone();
        UserRepository::new(db.clone()).upsert(&user).await?;

        let settings_repo = SettingsRepository::new(db);
        let mut settings = settings_repo.get().await?;
        settings.server_id = Some(server.id.clone());
        settings.user_id = Some(user.id.clone());
        settings.offline_mode = false;
        settings_repo.save(&settings).await?;

        let session = Self {
            id: Uuid::new_v4(),
            mode: Mode::Online,
            server,
            user,
            clients: remote.clients.clone(),
            remote: Some(remote),
        };
        info!(session = %session.id, server = %session.server.base_url, user = %session.user.email, "Online session opened");
        Ok(session)
    }

    /// Serve the last recorded server and user from the replica
    pub async fn offline(
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        event_bus: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        let settings_repo = SettingsRepository::new(db.clone());
        let mut settings = settings_repo.get().await?;
        let (Some(server_id), Some(user_id)) = (settings.server_id.clone(), settings.user_id.clone()) else {
            return Err(ReplicaError::Validation(
                "no server has been synchronized yet; an online session is required first".to_string(),
            ));
        };

        let server = ServerRepository::new(db.clone())
            .find_by_id(&server_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("server {server_id}")))?;
        let user = UserRepository::new(db.clone())
            .find_by_id(&user_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(format!("user {user_id}")))?;

        if !settings.offline_mode {
            settings.offline_mode = true;
            settings_repo.save(&settings).await?;
        }

        let mut client = OfflineClient::new(db, queue, server_id, user_id);
        if let Some(bus) = event_bus {
            client = client.with_event_bus(bus);
        }

        let session = Self {
            id: Uuid::new_v4(),
            mode: Mode::Offline,
            server,
            user,
            clients: MediaClients::from_backend(Arc::new(client)),
            remote: None,
        };
        info!(session = %session.id, server = %session.server.base_url, "Offline session opened");
        Ok(session)
    }

    /// Try the server first and fall back to the replica when it cannot be
    /// reached. The fallback keeps `remote` so queued writes can still be
    /// drained once connectivity returns.
    pub async fn open(
        db: Arc<DatabaseManager>,
        queue: Arc<TaskQueue>,
        event_bus: Option<Arc<EventBus>>,
        remote: RemoteApi,
        base_url: &str,
    ) -> Result<Self> {
        match Self::online(db.clone(), remote.clone(), base_url).await {
            Ok(session) => Ok(session),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Server unreachable, opening offline session");
                Ok(Self::offline(db, queue, event_bus).await?.with_remote(remote))
            }
            Err(e) => Err(e),
        }
    }

    /// Attach network capabilities without changing the facade
    pub fn with_remote(mut self, remote: RemoteApi) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn server(&self) -> &MediaServer {
        &self.server
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// The facade every caller goes through
    pub fn clients(&self) -> &MediaClients {
        &self.clients
    }

    pub fn remote(&self) -> Option<&RemoteApi> {
        self.remote.as_ref()
    }
}
