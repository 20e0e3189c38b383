//! User-facing event log
//!
//! Both threads report here: the sync worker for connectivity, handshakes
//! and incoming messages; the foreground for intents it refused. Entries
//! carry a title, a timestamp and free text, and the oldest are dropped once
//! the log is full.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::model::ContactId;

/// Something the presentation layer may want to react to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The relay became reachable or unreachable
    ConnectivityChanged(bool),
    /// New messages from a contact were stored
    NewMessage(ContactId),
    /// A session key was derived with a contact
    HandshakeCompleted(ContactId),
    /// A fresh offer from a contact was recorded
    OfferReceived(ContactId),
    /// We posted an exchange-key offer
    OfferPosted(ContactId),
    /// The relay accepted a message we sent
    MessageSent(ContactId),
    /// A contact was added
    ContactAdded(ContactId),
    /// An operation was refused or abandoned
    OperationFailed(String),
}

impl Event {
    /// Default heading for the entry
    pub fn title(&self) -> &'static str {
        match self {
            Event::ConnectivityChanged(true) => "Connection Established",
            Event::ConnectivityChanged(false) => "Server Connection Error",
            Event::NewMessage(_) => "New Message",
            Event::HandshakeCompleted(_) => "Key Exchange Complete",
            Event::OfferReceived(_) => "Key Exchange Requested",
            Event::OfferPosted(_) => "Key Exchange Sent",
            Event::MessageSent(_) => "Message Sent",
            Event::ContactAdded(_) => "Contact Added",
            Event::OperationFailed(_) => "Operation Failed",
        }
    }
}

/// One log line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// What happened
    pub event: Event,
    /// Heading
    pub title: String,
    /// When it was logged
    pub timestamp: DateTime<Utc>,
    /// Detail
    pub text: String,
}

/// Bounded, append-only event log
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    last_seq: u64,
}

impl EventLog {
    /// Empty log holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_seq: 0,
        }
    }

    /// Append an entry under the event's default title
    pub fn push(&mut self, event: Event, text: impl Into<String>) -> u64 {
        let title = event.title();
        self.push_titled(event, title, text)
    }

    /// Append an entry with an explicit title
    pub fn push_titled(
        &mut self,
        event: Event,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> u64 {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.last_seq += 1;
        self.entries.push_back(LogEntry {
            seq: self.last_seq,
            event,
            title: title.into(),
            timestamp: Utc::now(),
            text: text.into(),
        });
        self.last_seq
    }

    /// Entries with a sequence number above `seq`, oldest first
    pub fn since(&self, seq: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.seq > seq)
            .cloned()
            .collect()
    }

    /// All retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Sequence number of the newest entry, 0 if none was ever logged
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_since() {
        let mut log = EventLog::new(10);
        log.push(Event::ConnectivityChanged(true), "Successfully connected to the server.");
        let mark = log.last_seq();
        log.push(Event::NewMessage(3), "1 new message from bob");

        let fresh = log.since(mark);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].event, Event::NewMessage(3));
        assert_eq!(fresh[0].title, "New Message");
        assert_eq!(log.since(0).len(), 2);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = EventLog::new(2);
        for id in 1..=3 {
            log.push(Event::ContactAdded(id), "added");
        }

        let events: Vec<_> = log.entries().map(|e| e.event.clone()).collect();
        assert_eq!(events, vec![Event::ContactAdded(2), Event::ContactAdded(3)]);
        assert_eq!(log.last_seq(), 3);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut log = EventLog::new(0);
        log.push(Event::OperationFailed("a".into()), "a");
        log.push(Event::OperationFailed("b".into()), "b");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_custom_title() {
        let mut log = EventLog::new(4);
        log.push_titled(
            Event::OperationFailed("rejected".into()),
            "Bad Response",
            "status error",
        );
        assert_eq!(log.entries().next().unwrap().title, "Bad Response");
    }
}
