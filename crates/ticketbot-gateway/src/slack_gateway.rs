//! Slack-facing HTTP gateway: Events API intake, admin slash command, and OAuth install flow.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use ticketbot_core::current_unix_timestamp;
use ticketbot_slack_runtime::{
    route_slack_payload, DispatchOutcome, EventDispatcher, SlackApiClient, SlackClientRegistry,
    SlackInbound,
};
use ticketbot_store::{LinkStore, StoreError, TeamRegistry};
use tokio::net::TcpListener;

use crate::request_verification::verify_slack_request;

pub const SLACK_EVENTS_ENDPOINT: &str = "/slack/events";
pub const SLACK_TRACKER_URL_ENDPOINT: &str = "/slack/tracker-url";
pub const SLACK_INSTALL_ENDPOINT: &str = "/slack/install";
pub const SLACK_OAUTH_ENDPOINT: &str = "/slack/oauth";
pub const HEALTH_ENDPOINT: &str = "/healthz";

pub const DEFAULT_SLACK_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
pub const SLACK_BOT_SCOPES: &[&str] = &[
    "channels:history",
    "groups:history",
    "mpim:history",
    "im:history",
    "commands",
    "chat:write",
];

#[derive(Debug, Clone)]
pub struct SlackGatewayConfig {
    pub bind: String,
    pub signing_secret: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
    pub authorize_url: String,
    pub signature_max_skew_seconds: u64,
}

/// Shared state behind every gateway route.
pub struct SlackGatewayState {
    config: SlackGatewayConfig,
    store: Arc<dyn LinkStore>,
    dispatcher: Arc<EventDispatcher>,
    clients: Arc<SlackClientRegistry>,
}

impl SlackGatewayState {
    pub fn new(
        config: SlackGatewayConfig,
        store: Arc<dyn LinkStore>,
        dispatcher: Arc<EventDispatcher>,
        clients: Arc<SlackClientRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            clients,
        }
    }

    pub fn config(&self) -> &SlackGatewayConfig {
        &self.config
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), GatewayApiError> {
        verify_slack_request(
            headers,
            body,
            &self.config.signing_secret,
            current_unix_timestamp(),
            self.config.signature_max_skew_seconds,
        )
        .map_err(|error| {
            tracing::warn!(error = %format!("{error:#}"), "rejected unsigned slack request");
            GatewayApiError::unauthorized()
        })
    }
}

#[derive(Debug)]
struct GatewayApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl GatewayApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid slack request signature",
        )
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SlashCommandForm {
    team_id: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthCallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Binds the configured address and serves until ctrl-c.
pub async fn run_slack_gateway_server(state: Arc<SlackGatewayState>) -> Result<()> {
    let bind_addr = state
        .config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", state.config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind slack gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound slack gateway address")?;
    tracing::info!(addr = %local_addr, "slack gateway listening");

    let app = build_slack_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("slack gateway exited unexpectedly")?;
    tracing::info!("slack gateway stopped");
    Ok(())
}

pub fn build_slack_gateway_router(state: Arc<SlackGatewayState>) -> Router {
    Router::new()
        .route(SLACK_EVENTS_ENDPOINT, post(handle_slack_events))
        .route(SLACK_TRACKER_URL_ENDPOINT, post(handle_tracker_url_command))
        .route(SLACK_INSTALL_ENDPOINT, get(handle_slack_install))
        .route(SLACK_OAUTH_ENDPOINT, get(handle_slack_oauth_callback))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .with_state(state)
}

async fn handle_slack_events(
    State(state): State<Arc<SlackGatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayApiError> {
    state.verify(&headers, &body)?;
    let payload = serde_json::from_slice::<Value>(&body).map_err(|error| {
        GatewayApiError::bad_request("malformed_json", format!("invalid event body: {error}"))
    })?;
    let inbound = route_slack_payload(&payload).map_err(|error| {
        GatewayApiError::bad_request("malformed_event", format!("{error:#}"))
    })?;

    match inbound {
        SlackInbound::UrlVerification { challenge } => {
            Ok(Json(json!({ "challenge": challenge })).into_response())
        }
        SlackInbound::Ignored { reason } => {
            tracing::debug!(reason = %reason, "slack event ignored");
            Ok(StatusCode::OK.into_response())
        }
        SlackInbound::Message(event) => {
            let event_id = event.event_id.clone().unwrap_or_default();
            match state.dispatcher.dispatch(event) {
                DispatchOutcome::Spawned(_) => {
                    tracing::debug!(event_id = %event_id, "slack message event dispatched");
                }
                DispatchOutcome::Duplicate => {}
            }
            Ok(StatusCode::OK.into_response())
        }
    }
}

async fn handle_tracker_url_command(
    State(state): State<Arc<SlackGatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayApiError> {
    state.verify(&headers, &body)?;
    let form = serde_urlencoded::from_bytes::<SlashCommandForm>(&body).map_err(|error| {
        GatewayApiError::bad_request("malformed_form", format!("invalid slash command: {error}"))
    })?;

    let url = form.text.trim();
    let reply = match parse_tracker_url(url) {
        None => format!(
            "Failed to update tracker URL to '{url}': expected an http:// or https:// URL."
        ),
        Some(url) => match state.store.set_tracker_url(&form.team_id, url).await {
            Ok(()) => {
                tracing::info!(team_id = %form.team_id, tracker_url = url, "tracker url updated");
                format!("Successfully updated tracker URL to {url}.")
            }
            Err(StoreError::TeamNotFound(_)) => {
                format!("Failed to update tracker URL to {url}: team is not installed.")
            }
            Err(error) => {
                tracing::error!(team_id = %form.team_id, error = %error, "tracker url update failed");
                format!("Failed to update tracker URL to {url}: {error}")
            }
        },
    };
    Ok(Json(json!({ "response_type": "ephemeral", "text": reply })).into_response())
}

fn parse_tracker_url(value: &str) -> Option<&str> {
    let value = value.trim();
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))?;
    if rest.trim_end_matches('/').is_empty() || value.chars().any(char::is_whitespace) {
        return None;
    }
    Some(value)
}

async fn handle_slack_install(
    State(state): State<Arc<SlackGatewayState>>,
) -> Result<Response, GatewayApiError> {
    let client_id = state
        .config
        .client_id
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            GatewayApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "oauth_not_configured",
                "slack client id is not configured",
            )
        })?;

    let scope = SLACK_BOT_SCOPES.join(",");
    let mut params = vec![("client_id", client_id), ("scope", scope.as_str())];
    if let Some(redirect_url) = state.config.redirect_url.as_deref() {
        params.push(("redirect_uri", redirect_url));
    }
    let query = serde_urlencoded::to_string(&params).map_err(|error| {
        GatewayApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "install_url",
            error.to_string(),
        )
    })?;
    let location = format!("{}?{query}", state.config.authorize_url);
    Ok(Redirect::to(&location).into_response())
}

async fn handle_slack_oauth_callback(
    State(state): State<Arc<SlackGatewayState>>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayApiError> {
    let params = serde_urlencoded::from_str::<OAuthCallbackQuery>(query.as_deref().unwrap_or(""))
        .map_err(|error| GatewayApiError::bad_request("malformed_query", error.to_string()))?;
    if let Some(error) = params.error {
        return Err(GatewayApiError::bad_request(
            "oauth_denied",
            format!("slack authorization failed: {error}"),
        ));
    }
    let code = params
        .code
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| GatewayApiError::bad_request("missing_code", "missing oauth code"))?;

    let (Some(client_id), Some(client_secret)) = (
        state.config.client_id.as_deref(),
        state.config.client_secret.as_deref(),
    ) else {
        return Err(GatewayApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "oauth_not_configured",
            "slack client credentials are not configured",
        ));
    };

    let exchange = async {
        let client = SlackApiClient::new(state.clients.settings(), "")?;
        client
            .exchange_oauth_code(
                client_id,
                client_secret,
                &code,
                state.config.redirect_url.as_deref(),
            )
            .await
    };
    let grant = exchange.await.map_err(|error| {
        tracing::warn!(error = %format!("{error:#}"), "slack oauth exchange failed");
        GatewayApiError::new(StatusCode::BAD_GATEWAY, "oauth_exchange_failed", format!("{error:#}"))
    })?;

    let team = state
        .store
        .upsert_team(&grant.team_id, &grant.access_token)
        .await
        .map_err(|error| {
            GatewayApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                error.to_string(),
            )
        })?;
    state.clients.evict(&team.team_id);
    tracing::info!(team_id = %team.team_id, "slack workspace installed");

    Ok((
        StatusCode::OK,
        format!("ticketbot is installed for team {}.", team.team_id),
    )
        .into_response())
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests;
