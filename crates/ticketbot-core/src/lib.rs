//! Foundational pieces shared across ticketbot crates.
//!
//! Provides ticket identifier extraction, response payload rendering, and the
//! time helpers used by request verification.

pub mod response_payload;
pub mod ticket_set;
pub mod time_utils;

pub use response_payload::{
    render_response, AdvisoryPayload, LinksPayload, ResponsePayload, TicketLink,
    MISSING_TRACKER_URL_ADVISORY,
};
pub use ticket_set::{extract_tickets, TicketSet, TICKET_PATTERN};
pub use time_utils::current_unix_timestamp;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_current_unix_timestamp_is_after_2020() {
        assert!(current_unix_timestamp() > 1_577_836_800);
    }

    #[test]
    fn functional_extracted_tickets_render_in_first_seen_order() {
        let tickets = extract_tickets(Some("OPS-7 then ABC-1 then OPS-7"));
        let payload = render_response(Some("https://tracker.example/browse"), &tickets);
        let ResponsePayload::Links(links) = payload else {
            panic!("expected links payload");
        };
        let rendered = links
            .links
            .iter()
            .map(|link| link.ticket.as_str())
            .collect::<Vec<_>>();
        assert_eq!(rendered, vec!["OPS-7", "ABC-1"]);
    }
}
