#![no_main]

use libfuzzer_sys::fuzz_target;
use ticketbot_slack_runtime::{route_slack_payload, SlackInbound};

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    match route_slack_payload(&payload) {
        Ok(SlackInbound::UrlVerification { challenge }) => {
            assert!(!challenge.trim().is_empty());
        }
        Ok(SlackInbound::Message(event)) => {
            assert!(!event.key.team_id.trim().is_empty());
            assert!(!event.key.channel_id.trim().is_empty());
            assert!(!event.key.message_id.trim().is_empty());
        }
        Ok(SlackInbound::Ignored { reason }) => assert!(!reason.is_empty()),
        Err(error) => assert!(!error.to_string().is_empty()),
    }
});
