//! Ticket identifier extraction and the ordered ticket set type.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pattern for issue-tracker identifiers such as `ABC-123`.
pub const TICKET_PATTERN: &str = "[A-Z]+-[0-9]+";

fn ticket_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(TICKET_PATTERN).expect("ticket pattern is a valid regex"))
}

/// Distinct ticket identifiers in first-seen order.
///
/// Equality is set equality: two sets holding the same identifiers compare
/// equal regardless of order. Iteration and serialization keep the order in
/// which identifiers first appeared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TicketSet {
    tickets: Vec<String>,
}

impl TicketSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn contains(&self, ticket: &str) -> bool {
        self.tickets.iter().any(|existing| existing == ticket)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tickets.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tickets
    }

    /// Appends `ticket` unless it is already present. Returns true when added.
    pub fn insert(&mut self, ticket: impl Into<String>) -> bool {
        let ticket = ticket.into();
        if self.contains(&ticket) {
            return false;
        }
        self.tickets.push(ticket);
        true
    }
}

impl PartialEq for TicketSet {
    fn eq(&self, other: &Self) -> bool {
        if self.tickets.len() != other.tickets.len() {
            return false;
        }
        let lookup = self.tickets.iter().collect::<HashSet<_>>();
        other.tickets.iter().all(|ticket| lookup.contains(ticket))
    }
}

impl Eq for TicketSet {}

impl<S: Into<String>> FromIterator<S> for TicketSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for ticket in iter {
            set.insert(ticket);
        }
        set
    }
}

impl From<Vec<String>> for TicketSet {
    fn from(value: Vec<String>) -> Self {
        value.into_iter().collect()
    }
}

impl From<TicketSet> for Vec<String> {
    fn from(value: TicketSet) -> Self {
        value.tickets
    }
}

/// Scans message text for ticket identifiers.
///
/// Absent or empty text yields an empty set. Duplicates collapse onto their
/// first occurrence.
pub fn extract_tickets(text: Option<&str>) -> TicketSet {
    let Some(text) = text.filter(|value| !value.is_empty()) else {
        return TicketSet::new();
    };
    ticket_regex()
        .find_iter(text)
        .map(|found| found.as_str())
        .collect()
}
