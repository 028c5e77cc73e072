//! Chat platform contract and its Slack implementation backed by per-team clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use ticketbot_core::ResponsePayload;
use ticketbot_store::{MessageHandle, Team};
use tokio::sync::OnceCell;

use crate::slack_api_client::{SlackApiClient, SlackClientSettings};

/// Operations the reconciliation engine issues against the chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn post(
        &self,
        team: &Team,
        channel_id: &str,
        payload: &ResponsePayload,
    ) -> Result<MessageHandle>;
    async fn update(
        &self,
        team: &Team,
        handle: &MessageHandle,
        payload: &ResponsePayload,
    ) -> Result<MessageHandle>;
    async fn delete(&self, team: &Team, handle: &MessageHandle) -> Result<()>;
}

/// Lazily built Slack clients keyed by team id.
///
/// Each team gets one client, created on first use from the team's access
/// token. A cached client whose token no longer matches the team record is
/// rebuilt, and `evict` drops a team's client explicitly.
pub struct SlackClientRegistry {
    settings: SlackClientSettings,
    clients: Mutex<HashMap<String, Arc<OnceCell<SlackApiClient>>>>,
}

impl SlackClientRegistry {
    pub fn new(settings: SlackClientSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SlackClientSettings {
        &self.settings
    }

    pub async fn client_for(&self, team: &Team) -> Result<SlackApiClient> {
        let cell = self.cell_for(&team.team_id);
        if let Some(existing) = cell.get() {
            if existing.bot_token() == team.access_token.trim() {
                return Ok(existing.clone());
            }
            tracing::info!(team_id = %team.team_id, "slack access token changed, rebuilding client");
            self.evict(&team.team_id);
            return Box::pin(self.client_for(team)).await;
        }

        let client = cell
            .get_or_try_init(|| async { SlackApiClient::new(&self.settings, &team.access_token) })
            .await?;
        Ok(client.clone())
    }

    /// Drops the cached client for `team_id`. Returns true when one existed.
    pub fn evict(&self, team_id: &str) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(team_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_for(&self, team_id: &str) -> Arc<OnceCell<SlackApiClient>> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(clients.entry(team_id.to_string()).or_default())
    }
}

/// `ChatPlatform` that talks to the Slack Web API.
pub struct SlackChatPlatform {
    registry: Arc<SlackClientRegistry>,
}

impl SlackChatPlatform {
    pub fn new(registry: Arc<SlackClientRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChatPlatform for SlackChatPlatform {
    async fn post(
        &self,
        team: &Team,
        channel_id: &str,
        payload: &ResponsePayload,
    ) -> Result<MessageHandle> {
        let client = self.registry.client_for(team).await?;
        let posted = client.post_message(channel_id, payload).await?;
        Ok(MessageHandle {
            channel_id: posted.channel,
            ts: posted.ts,
        })
    }

    async fn update(
        &self,
        team: &Team,
        handle: &MessageHandle,
        payload: &ResponsePayload,
    ) -> Result<MessageHandle> {
        let client = self.registry.client_for(team).await?;
        let updated = client
            .update_message(&handle.channel_id, &handle.ts, payload)
            .await?;
        Ok(MessageHandle {
            channel_id: updated.channel,
            ts: updated.ts,
        })
    }

    async fn delete(&self, team: &Team, handle: &MessageHandle) -> Result<()> {
        let client = self.registry.client_for(team).await?;
        client.delete_message(&handle.channel_id, &handle.ts).await
    }
}
