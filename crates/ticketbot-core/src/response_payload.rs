//! Typed bot response payloads and their Slack Block Kit rendering.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::TicketSet;

pub const MISSING_TRACKER_URL_ADVISORY: &str = "No issue tracker URL is configured for this workspace, so ticket links cannot be built. An admin can set one with `/tracker-url https://your-tracker.example/browse`.";
const LINKS_HEADER: &str = "Links to tickets mentioned:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLink {
    pub ticket: String,
    pub url: String,
}

impl TicketLink {
    fn mrkdwn(&self) -> String {
        format!("<{}|{}>", self.url, self.ticket)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinksPayload {
    pub links: Vec<TicketLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryPayload {
    pub text: String,
}

/// Message content the bot posts in response to a source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    Links(LinksPayload),
    Advisory(AdvisoryPayload),
}

impl ResponsePayload {
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::Advisory(_))
    }

    /// Plain-text fallback used for notifications and clients without blocks.
    pub fn fallback_text(&self) -> String {
        match self {
            Self::Links(payload) => {
                let tickets = payload
                    .links
                    .iter()
                    .map(|link| link.ticket.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{LINKS_HEADER} {tickets}")
            }
            Self::Advisory(payload) => payload.text.clone(),
        }
    }

    pub fn slack_blocks(&self) -> Value {
        match self {
            Self::Links(payload) => {
                let elements = payload
                    .links
                    .iter()
                    .map(|link| json!({ "type": "mrkdwn", "text": link.mrkdwn() }))
                    .collect::<Vec<_>>();
                json!([
                    {
                        "type": "section",
                        "text": { "type": "mrkdwn", "text": LINKS_HEADER }
                    },
                    { "type": "context", "elements": elements }
                ])
            }
            Self::Advisory(payload) => json!([
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": payload.text }
                }
            ]),
        }
    }
}

/// Renders the response for `tickets` given the team's tracker base URL.
///
/// A missing or blank URL yields the configuration advisory instead of links.
pub fn render_response(tracker_url: Option<&str>, tickets: &TicketSet) -> ResponsePayload {
    let Some(base) = tracker_url
        .map(str::trim)
        .map(|value| value.trim_end_matches('/'))
        .filter(|value| !value.is_empty())
    else {
        return ResponsePayload::Advisory(AdvisoryPayload {
            text: MISSING_TRACKER_URL_ADVISORY.to_string(),
        });
    };

    let links = tickets
        .iter()
        .map(|ticket| TicketLink {
            ticket: ticket.to_string(),
            url: format!("{base}/{ticket}"),
        })
        .collect();
    ResponsePayload::Links(LinksPayload { links })
}
