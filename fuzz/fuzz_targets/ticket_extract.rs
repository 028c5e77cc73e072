#![no_main]

use libfuzzer_sys::fuzz_target;
use ticketbot_core::{extract_tickets, render_response, ResponsePayload};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let tickets = extract_tickets(Some(&*text));

    let mut seen = std::collections::HashSet::new();
    for ticket in tickets.iter() {
        assert!(seen.insert(ticket.to_string()), "duplicate ticket {ticket}");
        let (letters, digits) = ticket.split_once('-').expect("ticket has a hyphen");
        assert!(!letters.is_empty() && letters.bytes().all(|byte| byte.is_ascii_uppercase()));
        assert!(!digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit()));
    }

    let rendered = tickets.iter().map(str::to_string).collect::<Vec<_>>().join(" ");
    assert_eq!(extract_tickets(Some(rendered.as_str())), tickets);

    match render_response(Some("https://tracker.example/browse/"), &tickets) {
        ResponsePayload::Links(payload) => assert_eq!(payload.links.len(), tickets.len()),
        ResponsePayload::Advisory(_) => panic!("configured url must render links"),
    }
});
