//! HTTP gateway that receives Slack traffic for ticketbot.
pub mod request_verification;
pub mod slack_gateway;

pub use request_verification::{
    verify_slack_request, SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER,
};
pub use slack_gateway::{
    build_slack_gateway_router, run_slack_gateway_server, SlackGatewayConfig, SlackGatewayState,
    DEFAULT_SLACK_AUTHORIZE_URL, HEALTH_ENDPOINT, SLACK_BOT_SCOPES, SLACK_EVENTS_ENDPOINT,
    SLACK_INSTALL_ENDPOINT, SLACK_OAUTH_ENDPOINT, SLACK_TRACKER_URL_ENDPOINT,
};
