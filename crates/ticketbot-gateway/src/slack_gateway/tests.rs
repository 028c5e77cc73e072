//! Tests for the Slack gateway routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use httpmock::prelude::*;
use serde_json::{json, Value};
use ticketbot_core::current_unix_timestamp;
use ticketbot_slack_runtime::{
    EventDispatcher, ReconcileSettings, ReconciliationEngine, SlackChatPlatform,
    SlackClientRegistry, SlackClientSettings,
};
use ticketbot_store::{InMemoryLinkStore, LinkStore, ResponseKey, ResponseLedger, Team, TeamRegistry};
use tokio::net::TcpListener;

use super::{
    build_slack_gateway_router, SlackGatewayConfig, SlackGatewayState, DEFAULT_SLACK_AUTHORIZE_URL,
};
use crate::request_verification::{
    slack_v0_signature, SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER,
};

const SIGNING_SECRET: &str = "gateway-test-secret";

struct TestGateway {
    addr: SocketAddr,
    store: Arc<InMemoryLinkStore>,
    clients: Arc<SlackClientRegistry>,
    _server: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn test_config() -> SlackGatewayConfig {
    SlackGatewayConfig {
        bind: "127.0.0.1:0".to_string(),
        signing_secret: SIGNING_SECRET.to_string(),
        client_id: Some("111.222".to_string()),
        client_secret: Some("client-secret".to_string()),
        redirect_url: Some("https://bot.example/slack/oauth".to_string()),
        authorize_url: DEFAULT_SLACK_AUTHORIZE_URL.to_string(),
        signature_max_skew_seconds: 300,
    }
}

async fn spawn_test_gateway(slack_base_url: String) -> Result<TestGateway> {
    let store = Arc::new(InMemoryLinkStore::new());
    let clients = Arc::new(SlackClientRegistry::new(SlackClientSettings {
        api_base: slack_base_url,
        request_timeout_ms: 2_000,
        retry_max_attempts: 2,
        retry_base_delay_ms: 1,
    }));
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone() as Arc<dyn LinkStore>,
        Arc::new(SlackChatPlatform::new(Arc::clone(&clients))),
        ReconcileSettings::default(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(engine, 64));
    let state = Arc::new(SlackGatewayState::new(
        test_config(),
        store.clone(),
        dispatcher,
        Arc::clone(&clients),
    ));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    let app = build_slack_gateway_router(state);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(TestGateway {
        addr,
        store,
        clients,
        _server: server,
    })
}

async fn signed_post(
    url: &str,
    content_type: &str,
    body: &str,
) -> Result<reqwest::Response> {
    let timestamp = current_unix_timestamp().to_string();
    let signature = slack_v0_signature(SIGNING_SECRET, &timestamp, body);
    reqwest::Client::new()
        .post(url)
        .header("content-type", content_type)
        .header(SLACK_TIMESTAMP_HEADER, timestamp)
        .header(SLACK_SIGNATURE_HEADER, signature)
        .body(body.to_string())
        .send()
        .await
        .context("send signed request")
}

fn message_event(event_id: &str, ts: &str, text: &str) -> String {
    json!({
        "type": "event_callback",
        "team_id": "T1",
        "event_id": event_id,
        "event": {
            "type": "message",
            "channel": "C1",
            "user": "U1",
            "text": text,
            "ts": ts
        }
    })
    .to_string()
}

async fn wait_for_responses(store: &InMemoryLinkStore, expected: usize) {
    for _ in 0..100 {
        if store.response_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("ledger never reached {expected} responses");
}

#[tokio::test]
async fn functional_url_verification_echoes_challenge() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");
    let body = json!({ "type": "url_verification", "challenge": "c-123" }).to_string();
    let response = signed_post(
        &gateway.url("/slack/events"),
        "application/json",
        &body,
    )
    .await
    .expect("response");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("json");
    assert_eq!(payload["challenge"], "c-123");
}

#[tokio::test]
async fn regression_unsigned_and_malformed_requests_are_rejected() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");

    let unsigned = reqwest::Client::new()
        .post(gateway.url("/slack/events"))
        .body(message_event("Ev1", "1.0", "ABC-1"))
        .send()
        .await
        .expect("unsigned");
    assert_eq!(unsigned.status(), reqwest::StatusCode::UNAUTHORIZED);

    let stale_timestamp = (current_unix_timestamp() - 3_600).to_string();
    let body = message_event("Ev1", "1.0", "ABC-1");
    let stale = reqwest::Client::new()
        .post(gateway.url("/slack/events"))
        .header(SLACK_TIMESTAMP_HEADER, stale_timestamp.as_str())
        .header(
            SLACK_SIGNATURE_HEADER,
            slack_v0_signature(SIGNING_SECRET, &stale_timestamp, &body),
        )
        .body(body)
        .send()
        .await
        .expect("stale");
    assert_eq!(stale.status(), reqwest::StatusCode::UNAUTHORIZED);

    let malformed = signed_post(&gateway.url("/slack/events"), "application/json", "{not json")
        .await
        .expect("malformed");
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    let missing_ts = json!({
        "type": "event_callback",
        "team_id": "T1",
        "event": { "type": "message", "channel": "C1", "text": "ABC-1" }
    })
    .to_string();
    let invalid_event = signed_post(&gateway.url("/slack/events"), "application/json", &missing_ts)
        .await
        .expect("invalid event");
    assert_eq!(invalid_event.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn integration_message_event_posts_links_once_per_delivery() {
    let slack = MockServer::start();
    let post = slack.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .header("authorization", "Bearer xoxb-t1")
            .body_includes("https://jira.example.com/browse/OPS-7");
        then.status(200)
            .json_body(json!({ "ok": true, "channel": "C1", "ts": "1700000100.000001" }));
    });
    let gateway = spawn_test_gateway(slack.base_url()).await.expect("gateway");
    gateway
        .store
        .seed_team(Team::new("T1", "xoxb-t1").with_tracker_url("https://jira.example.com/browse"))
        .await;

    let body = message_event("Ev100", "1700000000.000100", "deploy blocked by OPS-7");
    let first = signed_post(&gateway.url("/slack/events"), "application/json", &body)
        .await
        .expect("first delivery");
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    wait_for_responses(&gateway.store, 1).await;

    let retry = signed_post(&gateway.url("/slack/events"), "application/json", &body)
        .await
        .expect("redelivery");
    assert_eq!(retry.status(), reqwest::StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(post.calls(), 1);
    let record = gateway
        .store
        .get_response(&ResponseKey::new("T1", "C1", "1700000000.000100"))
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.handle.ts, "1700000100.000001");
}

#[tokio::test]
async fn functional_tracker_url_command_updates_known_team() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");
    gateway.store.seed_team(Team::new("T1", "xoxb-t1")).await;

    let form = "command=%2Ftracker-url&team_id=T1&text=+https%3A%2F%2Fjira.example.com%2Fbrowse+";
    let response = signed_post(
        &gateway.url("/slack/tracker-url"),
        "application/x-www-form-urlencoded",
        form,
    )
    .await
    .expect("response");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("json");
    assert_eq!(
        payload["text"],
        "Successfully updated tracker URL to https://jira.example.com/browse."
    );
    let team = gateway.store.get_team("T1").await.expect("get").expect("team");
    assert_eq!(
        team.tracker_url.as_deref(),
        Some("https://jira.example.com/browse")
    );
}

#[tokio::test]
async fn regression_tracker_url_command_reports_failures() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");
    gateway.store.seed_team(Team::new("T1", "xoxb-t1")).await;

    let invalid = signed_post(
        &gateway.url("/slack/tracker-url"),
        "application/x-www-form-urlencoded",
        "team_id=T1&text=jira.example.com",
    )
    .await
    .expect("invalid")
    .json::<Value>()
    .await
    .expect("json");
    assert!(invalid["text"]
        .as_str()
        .expect("text")
        .starts_with("Failed to update tracker URL"));
    let team = gateway.store.get_team("T1").await.expect("get").expect("team");
    assert!(team.tracker_url.is_none());

    let unknown = signed_post(
        &gateway.url("/slack/tracker-url"),
        "application/x-www-form-urlencoded",
        "team_id=T404&text=https%3A%2F%2Fjira.example.com",
    )
    .await
    .expect("unknown")
    .json::<Value>()
    .await
    .expect("json");
    assert_eq!(
        unknown["text"],
        "Failed to update tracker URL to https://jira.example.com: team is not installed."
    );

    let missing_team = signed_post(
        &gateway.url("/slack/tracker-url"),
        "application/x-www-form-urlencoded",
        "text=https%3A%2F%2Fjira.example.com",
    )
    .await
    .expect("missing team");
    assert_eq!(missing_team.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn functional_install_redirects_to_slack_authorize() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");
    let response = client
        .get(gateway.url("/slack/install"))
        .send()
        .await
        .expect("install");
    assert!(response.status().is_redirection());
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location")
        .to_string();
    assert!(location.starts_with("https://slack.com/oauth/v2/authorize?client_id=111.222"));
    assert!(location.contains("chat%3Awrite"));
    assert!(location.contains("redirect_uri=https%3A%2F%2Fbot.example%2Fslack%2Foauth"));
}

#[tokio::test]
async fn integration_oauth_callback_installs_team_and_evicts_cached_client() {
    let slack = MockServer::start();
    let exchange = slack.mock(|when, then| {
        when.method(POST)
            .path("/oauth.v2.access")
            .body_includes("code=auth-code");
        then.status(200).json_body(json!({
            "ok": true,
            "access_token": "xoxb-new",
            "team": { "id": "T9", "name": "Acme" }
        }));
    });
    let gateway = spawn_test_gateway(slack.base_url()).await.expect("gateway");
    gateway
        .store
        .seed_team(Team::new("T9", "xoxb-old").with_tracker_url("https://t.example"))
        .await;
    gateway
        .clients
        .client_for(&Team::new("T9", "xoxb-old"))
        .await
        .expect("cached client");
    assert_eq!(gateway.clients.len(), 1);

    let response = reqwest::get(gateway.url("/slack/oauth?code=auth-code"))
        .await
        .expect("callback");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    exchange.assert();

    let team = gateway.store.get_team("T9").await.expect("get").expect("team");
    assert_eq!(team.access_token, "xoxb-new");
    assert_eq!(team.tracker_url.as_deref(), Some("https://t.example"));
    assert!(gateway.clients.is_empty());

    let missing_code = reqwest::get(gateway.url("/slack/oauth"))
        .await
        .expect("missing code");
    assert_eq!(missing_code.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unit_health_endpoint_reports_ok() {
    let gateway = spawn_test_gateway("http://127.0.0.1:9".to_string())
        .await
        .expect("gateway");
    let payload = reqwest::get(gateway.url("/healthz"))
        .await
        .expect("health")
        .json::<Value>()
        .await
        .expect("json");
    assert_eq!(payload["status"], "ok");
}
