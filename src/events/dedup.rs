//! Deduplication - semantic replay suppression keyed per event type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::events::{Event, EventType, Payload};

/// How the bus derives a dedup key from an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// No suppression
    None,
    /// Event id only
    Id,
    /// Key table: SIGNAL by rule_id, ORDER by rule_id then order_id,
    /// FILL by order_id, everything else by event id
    Rule,
    /// Key table, with FILL refined to order_id + fill_id when the fill
    /// carries one so successive partial fills are all delivered
    #[default]
    Full,
}

impl DedupStrategy {
    /// Derive the key for `event`, or `None` when dedup is disabled.
    pub fn key_for(&self, event: &Event) -> Option<String> {
        match self {
            DedupStrategy::None => None,
            DedupStrategy::Id => Some(id_key(event)),
            DedupStrategy::Rule => Some(table_key(event, false)),
            DedupStrategy::Full => Some(table_key(event, true)),
        }
    }
}

fn id_key(event: &Event) -> String {
    format!("id:{}", event.id())
}

fn table_key(event: &Event, with_fill_id: bool) -> String {
    let rule = || event.get_str("rule_id").map(|r| format!("rule:{}", r));
    let order = || event.get_str("order_id").map(|o| format!("order:{}", o));

    let key = match event.event_type() {
        EventType::Signal => rule(),
        EventType::Order => rule().or_else(order),
        EventType::Fill => match (event.get_str("order_id"), event.get_str("fill_id")) {
            (Some(o), Some(f)) if with_fill_id => Some(format!("fill:{}:{}", o, f)),
            _ => order(),
        },
        _ => None,
    };
    key.unwrap_or_else(|| id_key(event))
}

/// What was recorded for a key.
#[derive(Debug, Clone)]
pub struct DedupRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

/// Per-type key table plus the keys whose events are still being dispatched.
#[derive(Debug, Default)]
pub struct DedupTable {
    records: HashMap<EventType, HashMap<String, DedupRecord>>,
    in_flight: HashSet<(EventType, String)>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded, or currently in dispatch further up the stack.
    pub fn is_blocked(&self, event_type: EventType, key: &str) -> bool {
        self.records
            .get(&event_type)
            .is_some_and(|keys| keys.contains_key(key))
            || self.in_flight.contains(&(event_type, key.to_string()))
    }

    /// Mark a key as being dispatched.
    pub fn begin(&mut self, event_type: EventType, key: &str) {
        self.in_flight.insert((event_type, key.to_string()));
    }

    /// Dispatch finished: record the key permanently.
    pub fn record(&mut self, event_type: EventType, key: String, event: &Event) {
        self.in_flight.remove(&(event_type, key.clone()));
        self.records.entry(event_type).or_default().insert(
            key,
            DedupRecord {
                event_id: event.id(),
                timestamp: event.timestamp(),
                payload: event.payload().clone(),
            },
        );
    }

    pub fn get(&self, event_type: EventType, key: &str) -> Option<&DedupRecord> {
        self.records.get(&event_type)?.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.in_flight.clear();
    }
}
