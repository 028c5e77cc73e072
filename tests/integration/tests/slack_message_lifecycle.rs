use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use httpmock::prelude::*;
use serde_json::json;
use sha2::Sha256;
use tempfile::TempDir;
use ticketbot_core::current_unix_timestamp;
use ticketbot_gateway::{
    build_slack_gateway_router, SlackGatewayConfig, SlackGatewayState, DEFAULT_SLACK_AUTHORIZE_URL,
    SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER,
};
use ticketbot_slack_runtime::{
    EventDispatcher, ReconcileSettings, ReconciliationEngine, SlackChatPlatform,
    SlackClientRegistry, SlackClientSettings,
};
use ticketbot_store::{LinkStore, ResponseKey, ResponseLedger, SqliteLinkStore, TeamRegistry};
use tokio::net::TcpListener;

const SIGNING_SECRET: &str = "integration-secret";

struct Harness {
    addr: SocketAddr,
    store: Arc<SqliteLinkStore>,
    _workspace: TempDir,
    _server: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(slack_base_url: String) -> Result<Self> {
        let workspace = tempfile::tempdir().context("tempdir")?;
        let store = Arc::new(
            SqliteLinkStore::new(workspace.path().join("ticketbot.sqlite3"))
                .context("open sqlite store")?,
        );
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
        let state = Arc::new(SlackGatewayState::new(
            SlackGatewayConfig {
                bind: "127.0.0.1:0".to_string(),
                signing_secret: SIGNING_SECRET.to_string(),
                client_id: Some("client-id".to_string()),
                client_secret: Some("client-secret".to_string()),
                redirect_url: None,
                authorize_url: DEFAULT_SLACK_AUTHORIZE_URL.to_string(),
                signature_max_skew_seconds: 300,
            },
            store.clone(),
            Arc::new(EventDispatcher::new(engine, 128)),
            clients,
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
        Ok(Self {
            addr,
            store,
            _workspace: workspace,
            _server: server,
        })
    }

    async fn signed_post(&self, path: &str, body: &str) -> Result<reqwest::Response> {
        let timestamp = current_unix_timestamp().to_string();
        reqwest::Client::new()
            .post(format!("http://{}{}", self.addr, path))
            .header(SLACK_TIMESTAMP_HEADER, timestamp.as_str())
            .header(
                SLACK_SIGNATURE_HEADER,
                slack_v0_signature(SIGNING_SECRET, &timestamp, body),
            )
            .body(body.to_string())
            .send()
            .await
            .context("send signed request")
    }

    async fn wait_for_ledger(&self, key: &ResponseKey, present: bool) {
        for _ in 0..150 {
            let found = self
                .store
                .get_response(key)
                .await
                .expect("ledger read")
                .is_some();
            if found == present {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("ledger entry for {key} never reached present={present}");
    }
}

fn slack_v0_signature(secret: &str, timestamp: &str, payload: &str) -> String {
    let signed = format!("v0:{timestamp}:{payload}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
    mac.update(signed.as_bytes());
    let digest = mac.finalize().into_bytes();
    format!(
        "v0={}",
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()
    )
}

fn callback(event_id: &str, event: serde_json::Value) -> String {
    json!({
        "type": "event_callback",
        "team_id": "T1",
        "event_id": event_id,
        "event": event
    })
    .to_string()
}

#[tokio::test]
async fn integration_install_configure_create_edit_delete_lifecycle() {
    let slack = MockServer::start();
    let oauth = slack.mock(|when, then| {
        when.method(POST).path("/oauth.v2.access");
        then.status(200).json_body(json!({
            "ok": true,
            "access_token": "xoxb-installed",
            "team": { "id": "T1" }
        }));
    });
    let post = slack.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .header("authorization", "Bearer xoxb-installed");
        then.status(200)
            .json_body(json!({ "ok": true, "channel": "C1", "ts": "1700000500.000001" }));
    });
    let update = slack.mock(|when, then| {
        when.method(POST)
            .path("/chat.update")
            .json_body_includes(json!({ "channel": "C1", "ts": "1700000500.000001" }).to_string())
            .body_includes("OPS-9");
        then.status(200)
            .json_body(json!({ "ok": true, "channel": "C1", "ts": "1700000500.000001" }));
    });
    let delete = slack.mock(|when, then| {
        when.method(POST)
            .path("/chat.delete")
            .json_body_includes(json!({ "channel": "C1", "ts": "1700000500.000001" }).to_string());
        then.status(200).json_body(json!({ "ok": true }));
    });

    let harness = Harness::start(slack.base_url()).await.expect("harness");

    let installed = reqwest::get(format!("http://{}/slack/oauth?code=c1", harness.addr))
        .await
        .expect("oauth callback");
    assert_eq!(installed.status(), reqwest::StatusCode::OK);
    oauth.assert();

    let configured = harness
        .signed_post(
            "/slack/tracker-url",
            "team_id=T1&text=https%3A%2F%2Fjira.example.com%2Fbrowse%2F",
        )
        .await
        .expect("tracker url");
    assert_eq!(configured.status(), reqwest::StatusCode::OK);

    let key = ResponseKey::new("T1", "C1", "1700000000.000100");
    harness
        .signed_post(
            "/slack/events",
            &callback(
                "Ev-create",
                json!({
                    "type": "message",
                    "channel": "C1",
                    "user": "U1",
                    "text": "blocked on OPS-7",
                    "ts": "1700000000.000100"
                }),
            ),
        )
        .await
        .expect("create event");
    harness.wait_for_ledger(&key, true).await;
    assert_eq!(post.calls(), 1);

    harness
        .signed_post(
            "/slack/events",
            &callback(
                "Ev-edit",
                json!({
                    "type": "message",
                    "subtype": "message_changed",
                    "channel": "C1",
                    "message": { "user": "U1", "text": "blocked on OPS-7 and OPS-9", "ts": "1700000000.000100" },
                    "previous_message": { "user": "U1", "text": "blocked on OPS-7", "ts": "1700000000.000100" }
                }),
            ),
        )
        .await
        .expect("edit event");
    for _ in 0..150 {
        if update.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(update.calls(), 1);
    let mut tickets = Vec::new();
    for _ in 0..150 {
        let record = harness
            .store
            .get_response(&key)
            .await
            .expect("ledger read")
            .expect("record");
        tickets = record.tickets.as_slice().to_vec();
        if tickets.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tickets, vec!["OPS-7".to_string(), "OPS-9".to_string()]);

    harness
        .signed_post(
            "/slack/events",
            &callback(
                "Ev-delete",
                json!({
                    "type": "message",
                    "subtype": "message_deleted",
                    "channel": "C1",
                    "deleted_ts": "1700000000.000100",
                    "previous_message": { "user": "U1", "text": "blocked on OPS-7 and OPS-9", "ts": "1700000000.000100" }
                }),
            ),
        )
        .await
        .expect("delete event");
    harness.wait_for_ledger(&key, false).await;
    assert_eq!(delete.calls(), 1);
    assert_eq!(post.calls(), 1);
}

#[tokio::test]
async fn integration_unconfigured_team_receives_single_advisory() {
    let slack = MockServer::start();
    let advisory = slack.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("No issue tracker URL is configured");
        then.status(200)
            .json_body(json!({ "ok": true, "channel": "C1", "ts": "1700000600.000001" }));
    });

    let harness = Harness::start(slack.base_url()).await.expect("harness");
    harness
        .store
        .upsert_team("T1", "xoxb-t1")
        .await
        .expect("install team");

    for (index, ts) in ["1700000000.000001", "1700000000.000002"].iter().enumerate() {
        let response = harness
            .signed_post(
                "/slack/events",
                &callback(
                    &format!("Ev-{index}"),
                    json!({
                        "type": "message",
                        "channel": "C1",
                        "user": "U1",
                        "text": format!("see ABC-{index}"),
                        "ts": ts
                    }),
                ),
            )
            .await
            .expect("event");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    for _ in 0..150 {
        let team = harness
            .store
            .get_team("T1")
            .await
            .expect("team read")
            .expect("team");
        if team.no_url_error_sent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(advisory.calls(), 1);
    assert!(harness
        .store
        .get_response(&ResponseKey::new("T1", "C1", "1700000000.000001"))
        .await
        .expect("ledger read")
        .is_none());
}
