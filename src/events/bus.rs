//! Event Bus - synchronous, deduplicating, priority-ordered pub/sub
//!
//! `publish` runs every matching handler on the caller's thread before it
//! returns. Handlers may publish re-entrantly (depth-first delivery). Locks
//! are only held around bookkeeping, never across a handler call, so a
//! handler can publish, subscribe or query the bus freely.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::{Bound, RangeBounds};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::Result;
use crate::core::config::BusConfig;
use crate::events::dedup::{DedupStrategy, DedupTable};
use crate::events::handler::{EventHandler, HandlerId, HandlerRef, HandlerResult, MethodHandler};
use crate::events::{BusMetrics, Event, EventType};

/// What the bus remembers about a dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub dedup_key: Option<String>,
    pub handlers_invoked: usize,
    pub consumed: bool,
}

#[derive(Clone)]
struct Subscription {
    id: HandlerId,
    name: String,
    priority: i32,
    handler: HandlerRef,
}

#[derive(Default)]
struct BusState {
    dedup: DedupTable,
    records: HashMap<Uuid, EventRecord>,
    metrics: BusMetrics,
    history: VecDeque<Event>,
    batch: Option<Vec<Event>>,
}

/// Central in-process router. One per simulation run, shared via `Arc`.
pub struct EventBus {
    config: BusConfig,
    subscribers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    pub fn with_strategy(strategy: DedupStrategy) -> Self {
        Self::build(BusConfig {
            deduplication_strategy: strategy,
            ..BusConfig::default()
        })
    }

    fn build(config: BusConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn strategy(&self) -> DedupStrategy {
        self.config.deduplication_strategy
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Register a handler. Lower priority runs earlier; ties run in
    /// registration order. Re-subscribing the same handler is a no-op.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        priority: i32,
    ) -> HandlerId {
        let id = HandlerId::of_arc(&handler);
        let name = handler.name().to_string();
        self.insert(
            event_type,
            Subscription {
                id,
                name,
                priority,
                handler: HandlerRef::Strong(handler),
            },
        )
    }

    /// Register without keeping the handler alive.
    pub fn subscribe_weak(
        &self,
        event_type: EventType,
        handler: &Arc<dyn EventHandler>,
        priority: i32,
    ) -> HandlerId {
        let id = HandlerId::of_arc(handler);
        let name = handler.name().to_string();
        self.insert(
            event_type,
            Subscription {
                id,
                name,
                priority,
                handler: HandlerRef::Weak(Arc::downgrade(handler)),
            },
        )
    }

    /// Register a method of `target`; the bus holds `target` weakly.
    pub fn subscribe_method<T>(
        &self,
        event_type: EventType,
        target: &Arc<T>,
        name: &str,
        method: fn(&T, &mut Event) -> HandlerResult,
        priority: i32,
    ) -> HandlerId
    where
        T: Send + Sync + 'static,
    {
        let handler = MethodHandler::new(name, target, method);
        let id = handler.id();
        self.insert(
            event_type,
            Subscription {
                id,
                name: name.to_string(),
                priority,
                handler: HandlerRef::Strong(Arc::new(handler)),
            },
        )
    }

    fn insert(&self, event_type: EventType, subscription: Subscription) -> HandlerId {
        let id = subscription.id;
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(event_type).or_default();

        // Dead entries could alias a new handler's address
        list.retain(|s| s.handler.upgrade().is_some());

        if list.iter().any(|s| s.id == id) {
            debug!("{} already subscribed to {}", subscription.name, event_type);
            return id;
        }

        let pos = list
            .iter()
            .position(|s| s.priority > subscription.priority)
            .unwrap_or(list.len());
        debug!(
            "Subscribed {} to {} (priority {})",
            subscription.name, event_type, subscription.priority
        );
        list.insert(pos, subscription);
        id
    }

    /// Remove a handler. Returns whether anything was removed.
    pub fn unsubscribe(&self, event_type: EventType, id: HandlerId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            subscribers.remove(&event_type);
        }
        removed
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .get(&event_type)
            .map_or(0, |list| list.len())
    }

    /// Handler names for a type, in dispatch order
    pub fn subscriber_names(&self, event_type: EventType) -> Vec<String> {
        self.subscribers
            .read()
            .get(&event_type)
            .map(|list| list.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish an event. Returns the number of handlers invoked; 0 when the
    /// event was batched, already consumed, malformed, a duplicate, or had
    /// no subscribers.
    pub fn publish(&self, mut event: Event) -> usize {
        let event_type = event.event_type();
        let key = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(queue) = state.batch.as_mut() {
                queue.push(event);
                self.count(&mut state.metrics, |m| m.events_batched += 1);
                return 0;
            }

            self.count(&mut state.metrics, |m| {
                m.events_published += 1;
                *m.published_by_type.entry(event_type).or_insert(0) += 1;
            });

            if !event.is_well_formed() {
                warn!("Dropping malformed {} event (nil id)", event_type);
                self.count(&mut state.metrics, |m| m.malformed_events += 1);
                return 0;
            }

            if event.is_consumed() {
                debug!("Event {} already consumed, not dispatched", event.id());
                return 0;
            }

            let key = self.config.deduplication_strategy.key_for(&event);
            if let Some(k) = &key {
                if state.dedup.is_blocked(event_type, k) {
                    debug!(
                        event_id = %event.id(),
                        %event_type,
                        key = %k,
                        "Duplicate event blocked"
                    );
                    self.count(&mut state.metrics, |m| m.duplicates_blocked += 1);
                    return 0;
                }
                state.dedup.begin(event_type, k);
            }

            state.records.insert(
                event.id(),
                EventRecord {
                    event_type,
                    timestamp: event.timestamp(),
                    dedup_key: key.clone(),
                    handlers_invoked: 0,
                    consumed: false,
                },
            );

            if self.config.replay_enabled {
                while state.history.len() >= self.config.replay_capacity.max(1) {
                    state.history.pop_front();
                }
                state.history.push_back(event.clone());
            }

            key
        };

        let invoked = self.dispatch(&mut event);

        let mut state = self.state.lock();
        if let Some(k) = key {
            state.dedup.record(event_type, k, &event);
        }
        if let Some(record) = state.records.get_mut(&event.id()) {
            record.handlers_invoked = invoked;
            record.consumed = event.is_consumed();
        }
        invoked
    }

    /// Run the handlers for one event in priority order.
    fn dispatch(&self, event: &mut Event) -> usize {
        let event_type = event.event_type();
        let subscribers = match self.subscribers.read().get(&event_type) {
            Some(list) => list.clone(),
            None => {
                debug!("No subscribers for {}", event_type);
                Vec::new()
            }
        };

        let started = Instant::now();
        let mut invoked = 0usize;
        let mut failures = 0u64;
        let mut short_circuited = false;
        let mut dead = Vec::new();

        for subscription in &subscribers {
            if event.is_consumed() {
                debug!(
                    "{} {} consumed, skipping remaining handlers",
                    event_type,
                    event.id()
                );
                short_circuited = true;
                break;
            }

            let Some(handler) = subscription.handler.upgrade() else {
                dead.push(subscription.id);
                continue;
            };

            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(
                        handler = handler.name(),
                        event_id = %event.id(),
                        %event_type,
                        "Subscriber failed: {:#}",
                        e
                    );
                }
                Err(payload) => {
                    failures += 1;
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        handler = handler.name(),
                        event_id = %event.id(),
                        %event_type,
                        "Subscriber panicked: {}",
                        msg
                    );
                }
            }
        }

        if self.config.metrics_enabled {
            let mut state = self.state.lock();
            let m = &mut state.metrics;
            m.events_dispatched += 1;
            m.handler_invocations += invoked as u64;
            m.handler_failures += failures;
            m.dead_handlers_pruned += dead.len() as u64;
            m.dispatch_micros += started.elapsed().as_micros();
            if short_circuited {
                m.consumed_short_circuits += 1;
            }
            *m.dispatched_by_type.entry(event_type).or_insert(0) += 1;
        }

        if !dead.is_empty() {
            self.prune(event_type, &dead);
        }

        invoked
    }

    fn prune(&self, event_type: EventType, dead: &[HandlerId]) {
        let mut subscribers = self.subscribers.write();
        if let Some(list) = subscribers.get_mut(&event_type) {
            list.retain(|s| !dead.contains(&s.id));
            debug!("Pruned {} dead {} handler(s)", dead.len(), event_type);
            if list.is_empty() {
                subscribers.remove(&event_type);
            }
        }
    }

    fn count(&self, metrics: &mut BusMetrics, update: impl FnOnce(&mut BusMetrics)) {
        if self.config.metrics_enabled {
            update(metrics);
        }
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Queue subsequent publishes until `end_batch`.
    pub fn start_batch(&self) {
        let mut state = self.state.lock();
        if state.batch.is_none() {
            state.batch = Some(Vec::new());
        }
    }

    /// Publish the queued events in enqueue order. Returns total handlers invoked.
    pub fn end_batch(&self) -> usize {
        let queued = self.state.lock().batch.take();
        match queued {
            Some(events) => {
                debug!("Flushing batch of {} event(s)", events.len());
                events.into_iter().map(|e| self.publish(e)).sum()
            }
            None => 0,
        }
    }

    /// Drop the queued events. Returns how many were dropped.
    pub fn discard_batch(&self) -> usize {
        let dropped = self.state.lock().batch.take().map_or(0, |q| q.len());
        if dropped > 0 {
            debug!("Discarded batch of {} event(s)", dropped);
        }
        dropped
    }

    pub fn is_batching(&self) -> bool {
        self.state.lock().batch.is_some()
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Re-dispatch retained events (by history index). Replays skip dedup
    /// and are not re-recorded.
    pub fn replay_events<R: RangeBounds<usize>>(&self, range: R) -> usize {
        if !self.config.replay_enabled {
            warn!("Replay requested but replay is disabled");
            return 0;
        }

        let events: Vec<Event> = {
            let state = self.state.lock();
            let len = state.history.len();
            let start = match range.start_bound() {
                Bound::Included(&s) => s,
                Bound::Excluded(&s) => s.saturating_add(1),
                Bound::Unbounded => 0,
            };
            let end = match range.end_bound() {
                Bound::Included(&e) => e.saturating_add(1),
                Bound::Excluded(&e) => e,
                Bound::Unbounded => len,
            }
            .min(len);
            if start >= end {
                return 0;
            }
            state.history.range(start..end).cloned().collect()
        };

        let replayed = events.len() as u64;
        let total: usize = events
            .into_iter()
            .map(|mut event| self.dispatch(&mut event))
            .sum();

        let mut state = self.state.lock();
        self.count(&mut state.metrics, |m| m.events_replayed += replayed);
        total
    }

    pub fn history(&self) -> Vec<Event> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn lookup(&self, event_id: Uuid) -> Option<EventRecord> {
        self.state.lock().records.get(&event_id).cloned()
    }

    pub fn metrics(&self) -> BusMetrics {
        self.state.lock().metrics.clone()
    }

    /// Number of recorded dedup keys across all types
    pub fn dedup_entries(&self) -> usize {
        self.state.lock().dedup.len()
    }

    /// Clear dedup records, counters, event registry and history.
    /// Subscriptions are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.dedup.clear();
        state.records.clear();
        state.metrics = BusMetrics::default();
        state.history.clear();
        debug!("Event bus reset");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::build(BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderType, Side, Symbol};
    use crate::events::handler::handler_fn;
    use crate::events::{OrderPayload, Payload, SignalPayload};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Arc<dyn EventHandler> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        handler_fn(tag.clone(), move |_e: &mut Event| {
            log.lock().push(tag.clone());
            Ok(())
        })
    }

    fn market() -> Event {
        Event::new(EventType::Market, Payload::new())
    }

    fn order_event(order_id: &str) -> Event {
        Event::order(&OrderPayload {
            order_id: order_id.into(),
            symbol: Symbol::new("TEST"),
            direction: Side::Buy,
            quantity: Decimal::from(10),
            price: Some(Decimal::from(100)),
            order_type: OrderType::Market,
            rule_id: None,
        })
    }

    #[test]
    fn test_no_subscribers_returns_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(market()), 0);
        assert_eq!(bus.publish(order_event("o1")), 0);
    }

    #[test]
    fn test_priority_order() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h1"), 10);
        bus.subscribe(EventType::Market, recorder(&log, "h2"), -5);
        bus.subscribe(EventType::Market, recorder(&log, "h3"), 10);

        assert_eq!(bus.publish(market()), 3);
        assert_eq!(*log.lock(), vec!["h2", "h1", "h3"]);
        assert_eq!(bus.subscriber_names(EventType::Market), vec!["h2", "h1", "h3"]);
    }

    #[test]
    fn test_duplicate_subscribe_is_noop() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let h = recorder(&log, "h");
        let a = bus.subscribe(EventType::Market, Arc::clone(&h), 0);
        let b = bus.subscribe(EventType::Market, Arc::clone(&h), 5);
        assert_eq!(a, b);
        assert_eq!(bus.subscriber_count(EventType::Market), 1);
        assert_eq!(bus.publish(market()), 1);
    }

    struct Tally(AtomicUsize);

    impl Tally {
        fn bump(&self, _e: &mut Event) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_method_subscriptions_keyed_by_name() {
        let bus = EventBus::default();
        let tally = Arc::new(Tally(AtomicUsize::new(0)));
        let a = bus.subscribe_method(EventType::Market, &tally, "Tally::first", Tally::bump, 0);
        let again = bus.subscribe_method(EventType::Market, &tally, "Tally::first", Tally::bump, 0);
        let b = bus.subscribe_method(EventType::Market, &tally, "Tally::second", Tally::bump, 0);
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(bus.subscriber_count(EventType::Market), 2);

        assert_eq!(bus.publish(market()), 2);
        assert_eq!(tally.0.load(Ordering::SeqCst), 2);
        assert!(bus.unsubscribe(EventType::Market, b));
        assert_eq!(bus.subscriber_names(EventType::Market), vec!["Tally::first"]);
    }

    #[test]
    fn test_unsubscribe_drops_empty_type() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(EventType::Market, recorder(&log, "h"), 0);
        assert!(bus.unsubscribe(EventType::Market, id));
        assert!(!bus.unsubscribe(EventType::Market, id));
        assert_eq!(bus.subscriber_count(EventType::Market), 0);
        assert_eq!(bus.publish(market()), 0);
    }

    #[test]
    fn test_identical_event_blocked_under_id_strategy() {
        let bus = EventBus::with_strategy(DedupStrategy::Id);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Order, recorder(&log, "h"), 0);

        let event = order_event("o1");
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(bus.publish(event), 0);
        // Different event id, same order id: allowed under Id
        assert_eq!(bus.publish(order_event("o1")), 1);
        assert_eq!(bus.metrics().duplicates_blocked, 1);
    }

    #[test]
    fn test_full_strategy_blocks_same_order_id() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Order, recorder(&log, "h"), 0);
        assert_eq!(bus.publish(order_event("o1")), 1);
        assert_eq!(bus.publish(order_event("o1")), 0);
        assert_eq!(bus.publish(order_event("o2")), 1);
    }

    #[test]
    fn test_rule_strategy_blocks_redelivered_fill() {
        let bus = EventBus::with_strategy(DedupStrategy::Rule);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Fill, recorder(&log, "h"), 0);

        let fill = |fill_id: &str| {
            Event::fill(&crate::events::FillPayload {
                order_id: "o1".into(),
                symbol: Symbol::new("TEST"),
                direction: Side::Buy,
                quantity: Decimal::from(50),
                price: Decimal::from(100),
                commission: Decimal::ZERO,
                fill_id: Some(fill_id.into()),
            })
        };
        assert_eq!(bus.publish(fill("f1")), 1);
        assert_eq!(bus.publish(fill("f2")), 0);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_none_strategy_delivers_repeats() {
        let bus = EventBus::with_strategy(DedupStrategy::None);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Order, recorder(&log, "h"), 0);
        let event = order_event("o1");
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(bus.publish(event), 1);
        assert_eq!(bus.dedup_entries(), 0);
    }

    #[test]
    fn test_consumed_stops_lower_priority() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Market,
            handler_fn("gate", |e: &mut Event| {
                e.consume();
                Ok(())
            }),
            0,
        );
        bus.subscribe(EventType::Market, recorder(&log, "late"), 1);

        assert_eq!(bus.publish(market()), 1);
        assert!(log.lock().is_empty());
        assert_eq!(bus.metrics().consumed_short_circuits, 1);

        // Scoped to that publish only: the gate consumes again, the next
        // event still reaches the gate
        assert_eq!(bus.publish(market()), 1);
    }

    #[test]
    fn test_pre_consumed_event_not_dispatched() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h"), 0);
        let mut event = market();
        event.consume();
        assert_eq!(bus.publish(event), 0);
    }

    #[test]
    fn test_failing_handler_isolated() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::Market,
            handler_fn("err", |_e: &mut Event| anyhow::bail!("boom")),
            0,
        );
        bus.subscribe(
            EventType::Market,
            handler_fn("panics", |_e: &mut Event| panic!("handler panic")),
            1,
        );
        bus.subscribe(EventType::Market, recorder(&log, "ok"), 2);

        assert_eq!(bus.publish(market()), 3);
        assert_eq!(*log.lock(), vec!["ok"]);
        assert_eq!(bus.metrics().handler_failures, 2);
    }

    #[test]
    fn test_malformed_event_returns_zero() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h"), 0);
        let event = Event::from_parts(Uuid::nil(), EventType::Market, Payload::new(), Utc::now());
        assert_eq!(bus.publish(event), 0);
        assert_eq!(bus.metrics().malformed_events, 1);
    }

    #[test]
    fn test_batch_delivers_in_order_on_end() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventType::Order,
            handler_fn("sink", move |e: &mut Event| {
                sink.lock().push(e.get_str("order_id").unwrap_or_default().to_string());
                Ok(())
            }),
            0,
        );

        bus.start_batch();
        assert!(bus.is_batching());
        assert_eq!(bus.publish(order_event("e1")), 0);
        assert_eq!(bus.publish(order_event("e2")), 0);
        assert!(seen.lock().is_empty());

        assert_eq!(bus.end_batch(), 2);
        assert!(!bus.is_batching());
        assert_eq!(*seen.lock(), vec!["e1", "e2"]);
    }

    #[test]
    fn test_discard_batch() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h"), 0);
        bus.start_batch();
        bus.publish(market());
        bus.publish(market());
        assert_eq!(bus.discard_batch(), 2);
        assert_eq!(bus.end_batch(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_reentrant_publish_depth_first() {
        let bus = Arc::new(EventBus::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = Arc::downgrade(&bus);
        let signal_log = Arc::clone(&log);
        bus.subscribe(
            EventType::Signal,
            handler_fn("signal->order", move |_e: &mut Event| {
                signal_log.lock().push("signal".to_string());
                if let Some(bus) = inner_bus.upgrade() {
                    bus.publish(order_event("child"));
                }
                signal_log.lock().push("signal-done".to_string());
                Ok(())
            }),
            0,
        );
        bus.subscribe(EventType::Order, recorder(&log, "order"), 0);

        bus.publish(Event::signal(&SignalPayload::new("test", 1.0, Decimal::ONE)));
        assert_eq!(*log.lock(), vec!["signal", "order", "signal-done"]);
    }

    #[test]
    fn test_reentrant_same_key_is_blocked() {
        let bus = Arc::new(EventBus::default());
        let depth = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&bus);
        let counter = Arc::clone(&depth);
        bus.subscribe(
            EventType::Order,
            handler_fn("echo", move |e: &mut Event| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(bus) = weak.upgrade() {
                    // Same order_id, fresh event id: must not recurse
                    let order_id = e.get_str("order_id").unwrap_or_default().to_string();
                    bus.publish(order_event(&order_id));
                }
                Ok(())
            }),
            0,
        );
        bus.publish(order_event("loop"));
        assert_eq!(depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_subscriber_pruned() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "weak");
        bus.subscribe_weak(EventType::Market, &handler, 0);
        assert_eq!(bus.publish(market()), 1);

        drop(handler);
        assert_eq!(bus.publish(market()), 0);
        assert_eq!(bus.subscriber_count(EventType::Market), 0);
        assert_eq!(bus.metrics().dead_handlers_pruned, 1);
    }

    #[test]
    fn test_replay_bounded_history() {
        let bus = EventBus::new(BusConfig {
            replay_enabled: true,
            replay_capacity: 2,
            ..BusConfig::default()
        })
        .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h"), 0);

        for _ in 0..3 {
            bus.publish(market());
        }
        assert_eq!(bus.history_len(), 2);

        log.lock().clear();
        assert_eq!(bus.replay_events(..), 2);
        assert_eq!(log.lock().len(), 2);
        // Replays are not re-recorded
        assert_eq!(bus.history_len(), 2);
        assert_eq!(bus.replay_events(1..), 1);
        assert_eq!(bus.replay_events(5..), 0);
        assert_eq!(bus.metrics().events_replayed, 3);
    }

    #[test]
    fn test_replay_disabled() {
        let bus = EventBus::default();
        bus.publish(market());
        assert_eq!(bus.history_len(), 0);
        assert_eq!(bus.replay_events(..), 0);
    }

    #[test]
    fn test_zero_capacity_replay_rejected() {
        let cfg = BusConfig {
            replay_enabled: true,
            replay_capacity: 0,
            ..BusConfig::default()
        };
        assert!(EventBus::new(cfg).is_err());
    }

    #[test]
    fn test_reset_keeps_subscriptions() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Order, recorder(&log, "h"), 0);

        let event = order_event("o1");
        let id = event.id();
        assert_eq!(bus.publish(event), 1);
        assert_eq!(bus.lookup(id).map(|r| r.handlers_invoked), Some(1));
        assert_eq!(bus.publish(order_event("o1")), 0);

        bus.reset();
        assert!(bus.lookup(id).is_none());
        assert_eq!(bus.metrics(), BusMetrics::default());
        assert_eq!(bus.publish(order_event("o1")), 1);
    }

    #[test]
    fn test_published_counts_per_type() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Order, recorder(&log, "h"), 0);

        bus.publish(order_event("o1"));
        bus.publish(order_event("o1"));
        bus.publish(market());
        bus.start_batch();
        bus.publish(market());
        bus.end_batch();

        let m = bus.metrics();
        assert_eq!(m.events_published, 4);
        assert_eq!(m.published(EventType::Order), 2);
        assert_eq!(m.published(EventType::Market), 2);
        assert_eq!(m.dispatched(EventType::Order), 1);
        assert_eq!(m.duplicates_blocked, 1);
        assert_eq!(m.events_batched, 1);
    }

    #[test]
    fn test_metrics_disabled() {
        let bus = EventBus::new(BusConfig {
            metrics_enabled: false,
            ..BusConfig::default()
        })
        .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::Market, recorder(&log, "h"), 0);
        assert_eq!(bus.publish(market()), 1);
        assert_eq!(bus.metrics(), BusMetrics::default());
    }
}
