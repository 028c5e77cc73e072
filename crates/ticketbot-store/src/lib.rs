//! Team registry and response ledger abstractions with in-memory and SQLite backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::{SqliteLinkStore, DEFAULT_SQLITE_BUSY_TIMEOUT};
pub use ticketbot_core::TicketSet;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("team '{0}' not found")]
    TeamNotFound(String),
    #[error("bot response for {0} already exists")]
    ResponseAlreadyExists(ResponseKey),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("store worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// True for failures that may succeed when the same call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(error, _)) => matches!(
                error.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Workspace installation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub tracker_url: Option<String>,
    #[serde(default)]
    pub no_url_error_sent: bool,
    pub access_token: String,
}

impl Team {
    pub fn new(team_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            tracker_url: None,
            no_url_error_sent: false,
            access_token: access_token.into(),
        }
    }

    pub fn with_tracker_url(mut self, url: impl Into<String>) -> Self {
        self.tracker_url = Some(url.into());
        self
    }
}

/// Composite identity of a source message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseKey {
    pub team_id: String,
    pub channel_id: String,
    pub message_id: String,
}

impl ResponseKey {
    pub fn new(
        team_id: impl Into<String>,
        channel_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.team_id, self.channel_id, self.message_id)
    }
}

/// Platform-assigned location of a posted bot message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    pub channel_id: String,
    pub ts: String,
}

/// Ledger entry mapping a source message to the bot response mirroring it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotResponse {
    pub key: ResponseKey,
    pub handle: MessageHandle,
    pub tickets: TicketSet,
}

/// Team configuration contract consumed by the reconciliation engine.
#[async_trait]
pub trait TeamRegistry: Send + Sync {
    async fn get_team(&self, team_id: &str) -> StoreResult<Option<Team>>;
    /// Creates the team or refreshes its access token, keeping URL and advisory state.
    async fn upsert_team(&self, team_id: &str, access_token: &str) -> StoreResult<Team>;
    async fn set_tracker_url(&self, team_id: &str, url: &str) -> StoreResult<()>;
    async fn set_no_url_error_sent(&self, team_id: &str, sent: bool) -> StoreResult<()>;
}

/// Persisted mapping from source messages to bot responses.
#[async_trait]
pub trait ResponseLedger: Send + Sync {
    async fn get_response(&self, key: &ResponseKey) -> StoreResult<Option<BotResponse>>;
    /// Inserts a new record, failing with `ResponseAlreadyExists` when the key is taken.
    async fn insert_response(&self, response: BotResponse) -> StoreResult<()>;
    /// Inserts or overwrites the record for `response.key`.
    async fn put_response(&self, response: BotResponse) -> StoreResult<()>;
    /// Removes the record. Returns false when nothing was stored under `key`.
    async fn delete_response(&self, key: &ResponseKey) -> StoreResult<bool>;
}

/// Combined store handed to the engine and gateway.
pub trait LinkStore: TeamRegistry + ResponseLedger {}

impl<T: TeamRegistry + ResponseLedger> LinkStore for T {}

/// In-memory implementation for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryLinkStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    teams: HashMap<String, Team>,
    responses: HashMap<ResponseKey, BotResponse>,
}

impl InMemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces or adds a fully specified team.
    pub async fn seed_team(&self, team: Team) {
        let mut inner = self.inner.write().await;
        inner.teams.insert(team.team_id.clone(), team);
    }

    pub async fn response_count(&self) -> usize {
        self.inner.read().await.responses.len()
    }
}

#[async_trait]
impl TeamRegistry for InMemoryLinkStore {
    async fn get_team(&self, team_id: &str) -> StoreResult<Option<Team>> {
        Ok(self.inner.read().await.teams.get(team_id).cloned())
    }

    async fn upsert_team(&self, team_id: &str, access_token: &str) -> StoreResult<Team> {
        let mut inner = self.inner.write().await;
        let team = inner
            .teams
            .entry(team_id.to_string())
            .and_modify(|team| team.access_token = access_token.to_string())
            .or_insert_with(|| Team::new(team_id, access_token));
        Ok(team.clone())
    }

    async fn set_tracker_url(&self, team_id: &str, url: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let team = inner
            .teams
            .get_mut(team_id)
            .ok_or_else(|| StoreError::TeamNotFound(team_id.to_string()))?;
        team.tracker_url = Some(url.to_string());
        Ok(())
    }

    async fn set_no_url_error_sent(&self, team_id: &str, sent: bool) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let team = inner
            .teams
            .get_mut(team_id)
            .ok_or_else(|| StoreError::TeamNotFound(team_id.to_string()))?;
        team.no_url_error_sent = sent;
        Ok(())
    }
}

#[async_trait]
impl ResponseLedger for InMemoryLinkStore {
    async fn get_response(&self, key: &ResponseKey) -> StoreResult<Option<BotResponse>> {
        Ok(self.inner.read().await.responses.get(key).cloned())
    }

    async fn insert_response(&self, response: BotResponse) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.responses.contains_key(&response.key) {
            return Err(StoreError::ResponseAlreadyExists(response.key));
        }
        inner.responses.insert(response.key.clone(), response);
        Ok(())
    }

    async fn put_response(&self, response: BotResponse) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.responses.insert(response.key.clone(), response);
        Ok(())
    }

    async fn delete_response(&self, key: &ResponseKey) -> StoreResult<bool> {
        Ok(self.inner.write().await.responses.remove(key).is_some())
    }
}
