//! Message-link reconciliation: keeps one bot "links" response per source message in step with
//! the tickets that message mentions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use ticketbot_core::{extract_tickets, render_response, TicketSet};
use ticketbot_store::{
    BotResponse, LinkStore, MessageHandle, ResponseKey, ResponseLedger, StoreError, StoreResult,
    Team, TeamRegistry,
};

use crate::chat_platform::ChatPlatform;
use crate::keyed_locks::KeyedLocks;
use crate::slack_helpers::retry_delay;

/// Lifecycle notification for a source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEventKind {
    Created,
    Edited,
    Deleted,
}

impl MessageEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
            Self::Deleted => "deleted",
        }
    }
}

/// Normalized inbound message event consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub event_id: Option<String>,
    pub key: ResponseKey,
    pub author_is_bot: bool,
    pub kind: MessageEventKind,
    pub current_text: Option<String>,
    pub previous_text: Option<String>,
}

/// Outcome of reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Ignored,
    NoChange,
    Created,
    AdvisoryPosted,
    AdvisorySuppressed,
    Updated,
    Deleted,
}

impl ReconcileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::NoChange => "no_change",
            Self::Created => "created",
            Self::AdvisoryPosted => "advisory_posted",
            Self::AdvisorySuppressed => "advisory_suppressed",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Consistency,
    Transport,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Consistency => "consistency",
            Self::Transport => "transport",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("team '{0}' is not installed")]
    UnknownTeam(String),
    #[error("no bot response recorded for {0}")]
    MissingResponse(ResponseKey),
    #[error("bot response for {0} was recorded by a concurrent delivery")]
    ResponseConflict(ResponseKey),
    #[error("chat platform call failed: {0:#}")]
    Platform(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store call '{operation}' timed out after {timeout_ms}ms")]
    StoreTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownTeam(_) | Self::Store(StoreError::TeamNotFound(_)) => {
                ErrorClass::Configuration
            }
            Self::MissingResponse(_)
            | Self::ResponseConflict(_)
            | Self::Store(StoreError::ResponseAlreadyExists(_)) => ErrorClass::Consistency,
            Self::Platform(_) | Self::Store(_) | Self::StoreTimeout { .. } => ErrorClass::Transport,
        }
    }
}

/// Timeout and retry bounds for store calls issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub store_timeout_ms: u64,
    pub store_retry_max_attempts: usize,
    pub store_retry_base_delay_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            store_retry_max_attempts: 3,
            store_retry_base_delay_ms: 50,
        }
    }
}

/// Applies message events to the response ledger and the chat platform.
///
/// Events for the same `(team, channel, message)` key are serialized; other
/// keys proceed in parallel. Each event issues at most one platform mutation
/// plus the matching ledger write, except when a conflicting insert forces
/// the freshly posted message to be withdrawn.
pub struct ReconciliationEngine {
    store: Arc<dyn LinkStore>,
    platform: Arc<dyn ChatPlatform>,
    settings: ReconcileSettings,
    key_locks: KeyedLocks<ResponseKey>,
    advisory_locks: KeyedLocks<String>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LinkStore>,
        platform: Arc<dyn ChatPlatform>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            platform,
            settings,
            key_locks: KeyedLocks::new(),
            advisory_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LinkStore> {
        &self.store
    }

    /// Number of message keys with an in-flight reconciliation.
    pub fn active_keys(&self) -> usize {
        self.key_locks.len()
    }

    pub async fn reconcile(&self, event: &MessageEvent) -> Result<ReconcileAction, ReconcileError> {
        let key = &event.key;
        if event.author_is_bot {
            tracing::debug!(
                team_id = %key.team_id,
                channel_id = %key.channel_id,
                message_id = %key.message_id,
                "ignoring bot-authored message event"
            );
            return Ok(ReconcileAction::Ignored);
        }

        let _key_guard = self.key_locks.lock(key).await;
        let outcome = match event.kind {
            MessageEventKind::Created => self.on_created(event).await,
            MessageEventKind::Edited => self.on_edited(event).await,
            MessageEventKind::Deleted => self.on_deleted(key).await,
        };

        match &outcome {
            Ok(action) => tracing::info!(
                team_id = %key.team_id,
                channel_id = %key.channel_id,
                message_id = %key.message_id,
                event_kind = event.kind.as_str(),
                action = action.as_str(),
                "message event reconciled"
            ),
            Err(error) if error.class() == ErrorClass::Consistency => tracing::error!(
                team_id = %key.team_id,
                channel_id = %key.channel_id,
                message_id = %key.message_id,
                event_kind = event.kind.as_str(),
                error_class = error.class().as_str(),
                error = %error,
                "message event abandoned"
            ),
            Err(error) => tracing::warn!(
                team_id = %key.team_id,
                channel_id = %key.channel_id,
                message_id = %key.message_id,
                event_kind = event.kind.as_str(),
                error_class = error.class().as_str(),
                error = %error,
                "message event dropped"
            ),
        }
        outcome
    }

    async fn on_created(&self, event: &MessageEvent) -> Result<ReconcileAction, ReconcileError> {
        let tickets = extract_tickets(event.current_text.as_deref());
        if tickets.is_empty() {
            return Ok(ReconcileAction::NoChange);
        }
        if self.load_response(&event.key).await?.is_some() {
            return Ok(ReconcileAction::NoChange);
        }
        self.create_response(&event.key, tickets).await
    }

    async fn on_edited(&self, event: &MessageEvent) -> Result<ReconcileAction, ReconcileError> {
        let previous = extract_tickets(event.previous_text.as_deref());
        let current = extract_tickets(event.current_text.as_deref());
        if previous == current {
            return Ok(ReconcileAction::NoChange);
        }

        match self.load_response(&event.key).await? {
            None if current.is_empty() => Ok(ReconcileAction::NoChange),
            None => self.create_response(&event.key, current).await,
            Some(existing) if existing.tickets == current => Ok(ReconcileAction::NoChange),
            Some(existing) if current.is_empty() => self.delete_response(existing).await,
            Some(existing) => self.update_response(existing, current).await,
        }
    }

    async fn on_deleted(&self, key: &ResponseKey) -> Result<ReconcileAction, ReconcileError> {
        match self.load_response(key).await? {
            Some(existing) => self.delete_response(existing).await,
            None => Ok(ReconcileAction::NoChange),
        }
    }

    async fn create_response(
        &self,
        key: &ResponseKey,
        tickets: TicketSet,
    ) -> Result<ReconcileAction, ReconcileError> {
        let team = self.require_team(&key.team_id).await?;
        if !has_tracker_url(&team) {
            if team.no_url_error_sent {
                return Ok(ReconcileAction::AdvisorySuppressed);
            }
            return self.post_advisory(key, &tickets).await;
        }

        let payload = render_response(team.tracker_url.as_deref(), &tickets);
        let handle = self
            .platform
            .post(&team, &key.channel_id, &payload)
            .await
            .map_err(ReconcileError::Platform)?;

        let record = BotResponse {
            key: key.clone(),
            handle: handle.clone(),
            tickets,
        };
        match self
            .store_call("insert_response", || {
                self.store.insert_response(record.clone())
            })
            .await
        {
            Ok(()) => Ok(ReconcileAction::Created),
            Err(error) => {
                self.withdraw_post(&team, key, &handle).await;
                match error {
                    ReconcileError::Store(StoreError::ResponseAlreadyExists(existing)) => {
                        Err(ReconcileError::ResponseConflict(existing))
                    }
                    other => Err(other),
                }
            }
        }
    }

    async fn post_advisory(
        &self,
        key: &ResponseKey,
        tickets: &TicketSet,
    ) -> Result<ReconcileAction, ReconcileError> {
        let _team_guard = self.advisory_locks.lock(&key.team_id).await;
        // Another message of the same team may have surfaced the advisory meanwhile.
        let team = self.require_team(&key.team_id).await?;
        if team.no_url_error_sent {
            return Ok(ReconcileAction::AdvisorySuppressed);
        }

        let payload = render_response(None, tickets);
        self.platform
            .post(&team, &key.channel_id, &payload)
            .await
            .map_err(ReconcileError::Platform)?;
        self.store_call("set_no_url_error_sent", || {
            self.store.set_no_url_error_sent(&team.team_id, true)
        })
        .await?;
        tracing::info!(
            team_id = %team.team_id,
            channel_id = %key.channel_id,
            "tracker url advisory surfaced"
        );
        Ok(ReconcileAction::AdvisoryPosted)
    }

    async fn update_response(
        &self,
        existing: BotResponse,
        tickets: TicketSet,
    ) -> Result<ReconcileAction, ReconcileError> {
        let team = self.require_team(&existing.key.team_id).await?;
        let payload = render_response(team.tracker_url.as_deref(), &tickets);
        let handle = self
            .platform
            .update(&team, &existing.handle, &payload)
            .await
            .map_err(ReconcileError::Platform)?;

        let record = BotResponse {
            key: existing.key,
            handle,
            tickets,
        };
        self.store_call("put_response", || self.store.put_response(record.clone()))
            .await?;
        Ok(ReconcileAction::Updated)
    }

    async fn delete_response(
        &self,
        existing: BotResponse,
    ) -> Result<ReconcileAction, ReconcileError> {
        let team = self.require_team(&existing.key.team_id).await?;
        self.platform
            .delete(&team, &existing.handle)
            .await
            .map_err(ReconcileError::Platform)?;

        let removed = self
            .store_call("delete_response", || {
                self.store.delete_response(&existing.key)
            })
            .await?;
        if !removed {
            return Err(ReconcileError::MissingResponse(existing.key));
        }
        Ok(ReconcileAction::Deleted)
    }

    async fn withdraw_post(&self, team: &Team, key: &ResponseKey, handle: &MessageHandle) {
        if let Err(error) = self.platform.delete(team, handle).await {
            tracing::error!(
                team_id = %key.team_id,
                channel_id = %key.channel_id,
                message_id = %key.message_id,
                response_ts = %handle.ts,
                error = %format!("{error:#}"),
                "failed to withdraw unrecorded bot response"
            );
        }
    }

    async fn require_team(&self, team_id: &str) -> Result<Team, ReconcileError> {
        self.store_call("get_team", || self.store.get_team(team_id))
            .await?
            .ok_or_else(|| ReconcileError::UnknownTeam(team_id.to_string()))
    }

    async fn load_response(
        &self,
        key: &ResponseKey,
    ) -> Result<Option<BotResponse>, ReconcileError> {
        self.store_call("get_response", || self.store.get_response(key))
            .await
    }

    async fn store_call<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let timeout_ms = self.settings.store_timeout_ms.max(1);
        let max_attempts = self.settings.store_retry_max_attempts.max(1);
        let mut attempt = 1_usize;
        loop {
            let error = match tokio::time::timeout(Duration::from_millis(timeout_ms), call()).await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) if error.is_transient() => ReconcileError::Store(error),
                Ok(Err(error)) => return Err(ReconcileError::Store(error)),
                Err(_) => ReconcileError::StoreTimeout {
                    operation,
                    timeout_ms,
                },
            };
            if attempt >= max_attempts {
                return Err(error);
            }
            tracing::debug!(
                operation,
                attempt,
                max_attempts,
                error = %error,
                "retrying store call"
            );
            tokio::time::sleep(retry_delay(
                self.settings.store_retry_base_delay_ms,
                attempt,
                None,
            ))
            .await;
            attempt = attempt.saturating_add(1);
        }
    }
}

fn has_tracker_url(team: &Team) -> bool {
    team.tracker_url
        .as_deref()
        .is_some_and(|url| !url.trim().trim_end_matches('/').is_empty())
}
