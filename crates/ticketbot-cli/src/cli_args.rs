use std::path::PathBuf;

use clap::Parser;

use crate::CliLedgerBackend;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "ticketbot",
    about = "Slack bot that mirrors issue-tracker ticket mentions as link responses",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TICKETBOT_BIND",
        default_value = "0.0.0.0:3000",
        help = "Socket address the Slack gateway listens on"
    )]
    pub bind: String,

    #[arg(
        long = "slack-signing-secret",
        env = "SLACK_SIGNING_SECRET",
        hide_env_values = true,
        help = "Slack app signing secret used to verify inbound requests"
    )]
    pub slack_signing_secret: String,

    #[arg(
        long = "slack-client-id",
        env = "SLACK_CLIENT_ID",
        help = "Slack app client id for the OAuth install flow"
    )]
    pub slack_client_id: Option<String>,

    #[arg(
        long = "slack-client-secret",
        env = "SLACK_CLIENT_SECRET",
        hide_env_values = true,
        help = "Slack app client secret for the OAuth install flow"
    )]
    pub slack_client_secret: Option<String>,

    #[arg(
        long = "slack-redirect-url",
        env = "SLACK_REDIRECT_URL",
        help = "OAuth redirect URL registered with the Slack app"
    )]
    pub slack_redirect_url: Option<String>,

    #[arg(
        long = "slack-api-base",
        env = "TICKETBOT_SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Base URL for Slack Web API calls"
    )]
    pub slack_api_base: String,

    #[arg(
        long = "slack-authorize-url",
        env = "TICKETBOT_SLACK_AUTHORIZE_URL",
        default_value = "https://slack.com/oauth/v2/authorize",
        help = "Slack OAuth authorize URL used by the install redirect"
    )]
    pub slack_authorize_url: String,

    #[arg(
        long = "ledger-backend",
        env = "TICKETBOT_LEDGER_BACKEND",
        value_enum,
        default_value = "sqlite",
        help = "Storage backend for teams and bot responses"
    )]
    pub ledger_backend: CliLedgerBackend,

    #[arg(
        long = "sqlite-path",
        env = "TICKETBOT_SQLITE_PATH",
        default_value = ".ticketbot/ticketbot.sqlite3",
        help = "SQLite database path used when --ledger-backend=sqlite"
    )]
    pub sqlite_path: PathBuf,

    #[arg(
        long = "request-timeout-ms",
        env = "TICKETBOT_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each Slack Web API request in milliseconds"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "retry-max-attempts",
        env = "TICKETBOT_RETRY_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_usize,
        help = "Maximum attempts for retryable Slack Web API failures"
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long = "retry-base-delay-ms",
        env = "TICKETBOT_RETRY_BASE_DELAY_MS",
        default_value_t = 250,
        value_parser = parse_positive_u64,
        help = "Base backoff delay between Slack Web API retries in milliseconds"
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long = "store-timeout-ms",
        env = "TICKETBOT_STORE_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each ledger or team registry call in milliseconds"
    )]
    pub store_timeout_ms: u64,

    #[arg(
        long = "store-retry-max-attempts",
        env = "TICKETBOT_STORE_RETRY_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_usize,
        help = "Maximum attempts for transient store failures"
    )]
    pub store_retry_max_attempts: usize,

    #[arg(
        long = "store-retry-base-delay-ms",
        env = "TICKETBOT_STORE_RETRY_BASE_DELAY_MS",
        default_value_t = 50,
        value_parser = parse_positive_u64,
        help = "Base backoff delay between store retries in milliseconds"
    )]
    pub store_retry_base_delay_ms: u64,

    #[arg(
        long = "signature-max-skew-seconds",
        env = "TICKETBOT_SIGNATURE_MAX_SKEW_SECONDS",
        default_value_t = 300,
        help = "Maximum accepted age of a signed Slack request in seconds (0 disables the check)"
    )]
    pub signature_max_skew_seconds: u64,

    #[arg(
        long = "processed-event-cap",
        env = "TICKETBOT_PROCESSED_EVENT_CAP",
        default_value_t = 10_000,
        value_parser = parse_positive_usize,
        help = "Number of recent Slack event ids remembered for re-delivery detection"
    )]
    pub processed_event_cap: usize,
}
