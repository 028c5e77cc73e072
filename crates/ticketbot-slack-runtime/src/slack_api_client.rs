//! Slack Web API client used to post, update, and delete bot responses.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use ticketbot_core::ResponsePayload;

use crate::slack_helpers::{
    capped_retry_after, is_retryable_slack_status, is_retryable_transport_error, retry_delay,
    truncate_for_error,
};

pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const RETRY_ATTEMPT_HEADER: &str = "x-ticketbot-retry-attempt";
const RETRY_AFTER_TIMEOUT_MULTIPLIER: u64 = 3;

#[derive(Debug, Clone, Deserialize)]
struct SlackChatMessageResponse {
    ok: bool,
    ts: Option<String>,
    channel: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOAuthTeam {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOAuthAccessResponse {
    ok: bool,
    access_token: Option<String>,
    team: Option<SlackOAuthTeam>,
    error: Option<String>,
}

/// Connection settings shared by every per-team client.
#[derive(Debug, Clone)]
pub struct SlackClientSettings {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for SlackClientSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_SLACK_API_BASE.to_string(),
            request_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackPostedMessage {
    pub channel: String,
    pub ts: String,
}

/// Team credential returned by a completed OAuth installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackOAuthGrant {
    pub team_id: String,
    pub access_token: String,
}

#[derive(Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
    max_retry_after_seconds: u64,
}

impl SlackApiClient {
    pub fn new(settings: &SlackClientSettings, bot_token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("ticketbot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let request_timeout_ms = settings.request_timeout_ms.max(1);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .context("failed to create slack api client")?;

        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
            retry_max_attempts: settings.retry_max_attempts.max(1),
            retry_base_delay_ms: settings.retry_base_delay_ms.max(1),
            max_retry_after_seconds: (request_timeout_ms
                .saturating_mul(RETRY_AFTER_TIMEOUT_MULTIPLIER)
                / 1_000)
                .max(1),
        })
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }

    pub async fn post_message(
        &self,
        channel: &str,
        payload: &ResponsePayload,
    ) -> Result<SlackPostedMessage> {
        let body = json!({
            "channel": channel,
            "text": payload.fallback_text(),
            "blocks": payload.slack_blocks(),
            "unfurl_links": false,
            "unfurl_media": false,
        });

        let response: SlackChatMessageResponse = self
            .request_json("chat.postMessage", false, || {
                self.http
                    .post(format!("{}/chat.postMessage", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .json(&body)
            })
            .await?;

        if !response.ok {
            bail!(
                "slack chat.postMessage failed: {}",
                response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }

        Ok(SlackPostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response
                .ts
                .ok_or_else(|| anyhow!("slack chat.postMessage response missing ts"))?,
        })
    }

    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        payload: &ResponsePayload,
    ) -> Result<SlackPostedMessage> {
        let body = json!({
            "channel": channel,
            "ts": ts,
            "text": payload.fallback_text(),
            "blocks": payload.slack_blocks(),
        });
        let response: SlackChatMessageResponse = self
            .request_json("chat.update", true, || {
                self.http
                    .post(format!("{}/chat.update", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .json(&body)
            })
            .await?;
        if !response.ok {
            bail!(
                "slack chat.update failed: {}",
                response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(SlackPostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response.ts.unwrap_or_else(|| ts.to_string()),
        })
    }

    /// Deletes a bot message. A message that no longer exists counts as deleted.
    pub async fn delete_message(&self, channel: &str, ts: &str) -> Result<()> {
        let body = json!({ "channel": channel, "ts": ts });
        let response: SlackChatMessageResponse = self
            .request_json("chat.delete", true, || {
                self.http
                    .post(format!("{}/chat.delete", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .json(&body)
            })
            .await?;
        if response.ok || response.error.as_deref() == Some("message_not_found") {
            return Ok(());
        }
        bail!(
            "slack chat.delete failed: {}",
            response
                .error
                .unwrap_or_else(|| "unknown error".to_string())
        );
    }

    /// Exchanges an OAuth `code` for the installing team's bot token.
    pub async fn exchange_oauth_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<SlackOAuthGrant> {
        let mut form = vec![("code", code.to_string())];
        if let Some(redirect_uri) = redirect_uri.filter(|value| !value.trim().is_empty()) {
            form.push(("redirect_uri", redirect_uri.to_string()));
        }
        let response: SlackOAuthAccessResponse = self
            .request_json("oauth.v2.access", false, || {
                self.http
                    .post(format!("{}/oauth.v2.access", self.api_base))
                    .basic_auth(client_id, Some(client_secret))
                    .form(&form)
            })
            .await?;
        if !response.ok {
            bail!(
                "slack oauth.v2.access failed: {}",
                response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
        let team_id = response
            .team
            .map(|team| team.id)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack oauth.v2.access did not return team id"))?;
        let access_token = response
            .access_token
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack oauth.v2.access did not return access_token"))?;
        Ok(SlackOAuthGrant {
            team_id,
            access_token,
        })
    }

    /// Sends with bounded retries. `idempotent` gates retries of transport
    /// failures that may have reached Slack.
    async fn request_json<T, F>(
        &self,
        operation: &str,
        idempotent: bool,
        mut builder: F,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder()
                .header(RETRY_ATTEMPT_HEADER, attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode slack {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after =
                        capped_retry_after(response.headers(), self.max_retry_after_seconds);
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_slack_status(status.as_u16())
                    {
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying slack api call"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "slack api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts
                        && is_retryable_transport_error(&error, idempotent)
                    {
                        tracing::debug!(operation, attempt, %error, "retrying slack api call");
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("slack api {operation} request failed"));
                }
            }
        }
    }
}
