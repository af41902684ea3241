// src/so/event.rs - Shared object events and messages

use rml_rtmp::rml_amf0::Amf0Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedObjectEventKind {
    // client -> server
    ServerConnect,
    ServerDisconnect,
    ServerSetAttribute,
    ServerDeleteAttribute,
    ServerSendMessage,
    // server -> client
    ClientInitialData,
    ClientClearData,
    ClientUpdateData,
    ClientUpdateAttribute,
    ClientDeleteData,
    ClientDeleteAttribute,
    ClientSendMessage,
    ClientStatus,
}

impl SharedObjectEventKind {
    /// Wire id of the event inside a shared object message.
    pub fn wire_id(&self) -> u8 {
        match self {
            SharedObjectEventKind::ServerConnect => 1,
            SharedObjectEventKind::ServerDisconnect => 2,
            SharedObjectEventKind::ServerSetAttribute => 3,
            SharedObjectEventKind::ClientUpdateData => 4,
            SharedObjectEventKind::ClientUpdateAttribute => 5,
            SharedObjectEventKind::ServerSendMessage | SharedObjectEventKind::ClientSendMessage => 6,
            SharedObjectEventKind::ClientStatus => 7,
            SharedObjectEventKind::ClientClearData => 8,
            SharedObjectEventKind::ClientDeleteData => 9,
            SharedObjectEventKind::ServerDeleteAttribute => 10,
            SharedObjectEventKind::ClientInitialData => 11,
            SharedObjectEventKind::ClientDeleteAttribute => 9,
        }
    }
}

/// Payload of a shared object event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Empty,
    Value(Amf0Value),
    Arguments(Vec<Amf0Value>),
    Attributes(HashMap<String, Amf0Value>),
}

/// Creation order of an event: monotonic nanoseconds, ties broken by a
/// global sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventStamp {
    pub nanos: u64,
    pub sequence: u64,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl EventStamp {
    pub fn now() -> Self {
        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        let anchor = ANCHOR.get_or_init(Instant::now);
        Self {
            nanos: anchor.elapsed().as_nanos() as u64,
            sequence: SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }
}

/// A single change. Equality and ordering only look at the stamp, which is
/// unique per event.
#[derive(Debug, Clone)]
pub struct SharedObjectEvent {
    pub kind: SharedObjectEventKind,
    pub key: Option<String>,
    pub data: EventData,
    pub stamp: EventStamp,
}

impl SharedObjectEvent {
    pub fn new(kind: SharedObjectEventKind, key: Option<String>, data: EventData) -> Self {
        Self {
            kind,
            key,
            data,
            stamp: EventStamp::now(),
        }
    }

    pub fn keyed(kind: SharedObjectEventKind, key: &str) -> Self {
        Self::new(kind, Some(key.to_string()), EventData::Empty)
    }

    pub fn value(&self) -> Option<&Amf0Value> {
        match &self.data {
            EventData::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn arguments(&self) -> &[Amf0Value] {
        match &self.data {
            EventData::Arguments(args) => args,
            _ => &[],
        }
    }
}

impl PartialEq for SharedObjectEvent {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp
    }
}

impl Eq for SharedObjectEvent {}

impl PartialOrd for SharedObjectEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SharedObjectEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp.cmp(&other.stamp)
    }
}

/// One batch of events for one object at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedObjectMessage {
    pub name: String,
    pub version: u32,
    pub persistent: bool,
    pub events: Vec<SharedObjectEvent>,
}

impl SharedObjectMessage {
    pub fn new(name: impl Into<String>, version: u32, persistent: bool) -> Self {
        Self {
            name: name.into(),
            version,
            persistent,
            events: Vec::new(),
        }
    }

    pub fn add_event(mut self, event: SharedObjectEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn kinds(&self) -> Vec<SharedObjectEventKind> {
        self.events.iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_events_order_by_creation() {
        let first = SharedObjectEvent::keyed(SharedObjectEventKind::ClientUpdateData, "a");
        let second = SharedObjectEvent::keyed(SharedObjectEventKind::ClientUpdateData, "b");
        let third = SharedObjectEvent::keyed(SharedObjectEventKind::ClientDeleteData, "c");
        assert!(first < second && second < third);

        let mut set = BTreeSet::new();
        set.insert(third.clone());
        set.insert(first.clone());
        set.insert(second.clone());
        let keys: Vec<_> = set.iter().map(|e| e.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_identical_content_is_not_coalesced() {
        let mut set = BTreeSet::new();
        set.insert(SharedObjectEvent::keyed(SharedObjectEventKind::ClientSendMessage, "x"));
        set.insert(SharedObjectEvent::keyed(SharedObjectEventKind::ClientSendMessage, "x"));
        assert_eq!(set.len(), 2);
    }
}
