//! Slack runtime for ticketbot: Web API client, event routing, and the
//! message-link reconciliation engine.
//!
//! Inbound Events API payloads are routed into `MessageEvent`s, deduplicated
//! by delivery id, and reconciled on background tasks against the response
//! ledger and the Slack chat platform.

pub mod chat_platform;
pub mod event_dispatcher;
pub mod keyed_locks;
pub mod reconcile_engine;
pub mod slack_api_client;
pub mod slack_event_router;
mod slack_helpers;

pub use chat_platform::{ChatPlatform, SlackChatPlatform, SlackClientRegistry};
pub use event_dispatcher::{DispatchOutcome, EventDispatcher, ProcessedEventWindow, ReconcileTask};
pub use keyed_locks::{KeyedLockGuard, KeyedLocks};
pub use reconcile_engine::{
    ErrorClass, MessageEvent, MessageEventKind, ReconcileAction, ReconcileError,
    ReconcileSettings, ReconciliationEngine,
};
pub use slack_api_client::{
    SlackApiClient, SlackClientSettings, SlackOAuthGrant, SlackPostedMessage,
    DEFAULT_SLACK_API_BASE,
};
pub use slack_event_router::{route_slack_payload, SlackInbound};
