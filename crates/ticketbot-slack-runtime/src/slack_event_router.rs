//! Demultiplexes Slack Events API payloads into engine message events.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use ticketbot_store::ResponseKey;

use crate::reconcile_engine::{MessageEvent, MessageEventKind};

/// Routed form of one inbound Events API request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlackInbound {
    UrlVerification { challenge: String },
    Message(MessageEvent),
    Ignored { reason: String },
}

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event: Option<SlackMessagePayload>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackMessagePayload {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    deleted_ts: Option<String>,
    #[serde(default)]
    message: Option<Box<SlackMessagePayload>>,
    #[serde(default)]
    previous_message: Option<Box<SlackMessagePayload>>,
}

impl SlackMessagePayload {
    fn authored_by_bot(&self) -> bool {
        self.bot_id
            .as_deref()
            .is_some_and(|bot_id| !bot_id.trim().is_empty())
            || self.subtype.as_deref() == Some("bot_message")
    }
}

/// Routes one decoded Events API body.
///
/// Returns an error only for payloads that are structurally malformed; events
/// the bot does not act on come back as `SlackInbound::Ignored`.
pub fn route_slack_payload(payload: &Value) -> Result<SlackInbound> {
    let envelope = serde_json::from_value::<SlackEnvelope>(payload.clone())
        .context("failed to decode slack events api envelope")?;

    match envelope.envelope_type.as_str() {
        "url_verification" => {
            let challenge = non_empty(envelope.challenge)
                .context("url_verification payload is missing 'challenge'")?;
            Ok(SlackInbound::UrlVerification { challenge })
        }
        "event_callback" => {
            let event = envelope
                .event
                .context("event_callback payload is missing 'event'")?;
            let team_id = non_empty(envelope.team_id)
                .or_else(|| non_empty(event.team.clone()))
                .context("event_callback payload is missing 'team_id'")?;
            route_message_event(team_id, non_empty(envelope.event_id), event)
        }
        other => Ok(ignored(format!("unsupported envelope type '{other}'"))),
    }
}

fn route_message_event(
    team_id: String,
    event_id: Option<String>,
    event: SlackMessagePayload,
) -> Result<SlackInbound> {
    if event.event_type != "message" {
        return Ok(ignored(format!(
            "unsupported event type '{}'",
            event.event_type
        )));
    }
    let channel_id =
        non_empty(event.channel.clone()).context("message event is missing 'channel'")?;

    let (message_id, author_is_bot, kind, current_text, previous_text) =
        match event.subtype.as_deref() {
            None | Some("thread_broadcast") | Some("file_share") | Some("bot_message") => {
                let message_id =
                    non_empty(event.ts.clone()).context("message event is missing 'ts'")?;
                (
                    message_id,
                    event.authored_by_bot(),
                    MessageEventKind::Created,
                    event.text,
                    None,
                )
            }
            Some("message_changed") => {
                let message = event
                    .message
                    .context("message_changed event is missing 'message'")?;
                let message_id = non_empty(message.ts.clone())
                    .context("message_changed event is missing 'message.ts'")?;
                let previous_text = event.previous_message.and_then(|previous| previous.text);
                (
                    message_id,
                    message.authored_by_bot(),
                    MessageEventKind::Edited,
                    message.text,
                    previous_text,
                )
            }
            Some("message_deleted") => {
                let previous = event.previous_message.unwrap_or_default();
                let message_id = non_empty(event.deleted_ts)
                    .or_else(|| non_empty(previous.ts.clone()))
                    .context("message_deleted event is missing 'deleted_ts'")?;
                (
                    message_id,
                    previous.authored_by_bot(),
                    MessageEventKind::Deleted,
                    None,
                    previous.text,
                )
            }
            Some(other) => {
                return Ok(ignored(format!("unsupported message subtype '{other}'")));
            }
        };

    Ok(SlackInbound::Message(MessageEvent {
        event_id,
        key: ResponseKey::new(team_id, channel_id, message_id),
        author_is_bot,
        kind,
        current_text,
        previous_text,
    }))
}

fn ignored(reason: String) -> SlackInbound {
    SlackInbound::Ignored { reason }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
