use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ticketbot_gateway::{run_slack_gateway_server, SlackGatewayConfig, SlackGatewayState};
use ticketbot_slack_runtime::{
    EventDispatcher, ReconcileSettings, ReconciliationEngine, SlackChatPlatform,
    SlackClientRegistry, SlackClientSettings,
};
use ticketbot_store::{InMemoryLinkStore, LinkStore, SqliteLinkStore};

use crate::{Cli, CliLedgerBackend};

/// Opens the ledger backend selected on the command line.
pub fn build_link_store(cli: &Cli) -> Result<Arc<dyn LinkStore>> {
    match cli.ledger_backend {
        CliLedgerBackend::Memory => {
            tracing::warn!("using in-memory ledger; bot responses are lost on restart");
            Ok(Arc::new(InMemoryLinkStore::new()))
        }
        CliLedgerBackend::Sqlite => Ok(Arc::new(open_sqlite_store(cli)?)),
    }
}

/// Opens the SQLite ledger with lock waits bounded by the store-call timeout.
fn open_sqlite_store(cli: &Cli) -> Result<SqliteLinkStore> {
    let store = SqliteLinkStore::new(&cli.sqlite_path)
        .with_context(|| format!("failed to open sqlite ledger {}", cli.sqlite_path.display()))?
        .with_busy_timeout(Duration::from_millis(cli.store_timeout_ms));
    tracing::info!(
        path = %store.path().display(),
        busy_timeout_ms = cli.store_timeout_ms,
        "opened sqlite ledger"
    );
    Ok(store)
}

/// Wires store, Slack clients, engine, and dispatcher into gateway state.
pub fn build_gateway_state(cli: &Cli, store: Arc<dyn LinkStore>) -> Arc<SlackGatewayState> {
    let clients = Arc::new(SlackClientRegistry::new(SlackClientSettings {
        api_base: cli.slack_api_base.clone(),
        request_timeout_ms: cli.request_timeout_ms,
        retry_max_attempts: cli.retry_max_attempts,
        retry_base_delay_ms: cli.retry_base_delay_ms,
    }));
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::clone(&store),
        Arc::new(SlackChatPlatform::new(Arc::clone(&clients))),
        ReconcileSettings {
            store_timeout_ms: cli.store_timeout_ms,
            store_retry_max_attempts: cli.store_retry_max_attempts,
            store_retry_base_delay_ms: cli.store_retry_base_delay_ms,
        },
    ));
    let dispatcher = Arc::new(EventDispatcher::new(engine, cli.processed_event_cap));

    let config = SlackGatewayConfig {
        bind: cli.bind.clone(),
        signing_secret: cli.slack_signing_secret.clone(),
        client_id: non_empty(cli.slack_client_id.as_deref()),
        client_secret: non_empty(cli.slack_client_secret.as_deref()),
        redirect_url: non_empty(cli.slack_redirect_url.as_deref()),
        authorize_url: cli.slack_authorize_url.trim().to_string(),
        signature_max_skew_seconds: cli.signature_max_skew_seconds,
    };
    Arc::new(SlackGatewayState::new(config, store, dispatcher, clients))
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    if cli.slack_signing_secret.trim().is_empty() {
        anyhow::bail!("--slack-signing-secret must not be empty");
    }
    tracing::info!(
        bind = %cli.bind,
        ledger_backend = cli.ledger_backend.as_str(),
        slack_api_base = %cli.slack_api_base,
        "starting ticketbot"
    );
    let store = build_link_store(&cli)?;
    let state = build_gateway_state(&cli, store);
    run_slack_gateway_server(state).await
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
