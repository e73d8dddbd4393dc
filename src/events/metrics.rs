//! Bus counters

use serde::Serialize;
use std::collections::BTreeMap;

use crate::events::EventType;

/// Snapshot of dispatch counters since construction or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusMetrics {
    /// publish() calls that reached evaluation; batched events count once,
    /// when flushed
    pub events_published: u64,
    /// Events that passed dedup and were dispatched
    pub events_dispatched: u64,
    /// Handler calls, including failed ones
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub duplicates_blocked: u64,
    /// Publishes stopped early because a handler consumed the event
    pub consumed_short_circuits: u64,
    pub malformed_events: u64,
    pub events_batched: u64,
    pub events_replayed: u64,
    pub dead_handlers_pruned: u64,
    pub published_by_type: BTreeMap<EventType, u64>,
    pub dispatched_by_type: BTreeMap<EventType, u64>,
    pub dispatch_micros: u128,
}

impl BusMetrics {
    pub fn published(&self, event_type: EventType) -> u64 {
        self.published_by_type.get(&event_type).copied().unwrap_or(0)
    }

    pub fn dispatched(&self, event_type: EventType) -> u64 {
        self.dispatched_by_type.get(&event_type).copied().unwrap_or(0)
    }

    /// Mean handler-loop latency per dispatched event
    pub fn avg_dispatch_micros(&self) -> f64 {
        if self.events_dispatched == 0 {
            return 0.0;
        }
        self.dispatch_micros as f64 / self.events_dispatched as f64
    }
}
