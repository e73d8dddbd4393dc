//! Order Registry - authoritative order store and lifecycle state machine
//!
//! Consumes ORDER / FILL / CANCEL from the bus and publishes a PORTFOLIO
//! state-change notification for every lifecycle step. A rule_id can
//! produce at most one order for the lifetime of the registry.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{Error, Order, OrderStatus, Result, Symbol};
use crate::events::{
    CancelPayload, Event, EventBus, EventType, FillPayload, HandlerId, HandlerResult,
    OrderPayload, OrderSnapshot, StateChangePayload,
};

/// Registry runs ahead of default-priority consumers.
pub const REGISTRY_PRIORITY: i32 = -10;

/// One recorded lifecycle step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub order_id: String,
    /// `None` for registration
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub transition: String,
    pub timestamp: DateTime<Utc>,
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_orders: usize,
    pub active_orders: usize,
    pub completed_orders: usize,
    pub by_status: BTreeMap<OrderStatus, usize>,
    pub rule_ids_seen: usize,
    pub duplicates_blocked: u64,
    pub events_processed: usize,
    pub state_changes: usize,
    pub total_filled_quantity: Decimal,
}

#[derive(Default)]
struct RegistryState {
    orders: HashMap<String, Order>,
    rule_ids: HashSet<String>,
    /// symbol -> non-terminal order ids
    active_by_symbol: HashMap<Symbol, BTreeSet<String>>,
    processed_events: HashSet<Uuid>,
    history: Vec<StateChange>,
    duplicates_blocked: u64,
}

impl RegistryState {
    fn deactivate(&mut self, symbol: &Symbol, order_id: &str) {
        if let Some(ids) = self.active_by_symbol.get_mut(symbol) {
            ids.remove(order_id);
            if ids.is_empty() {
                self.active_by_symbol.remove(symbol);
            }
        }
    }

    /// Strict transition. `Ok(None)` for a same-state no-op.
    fn set_status(&mut self, order_id: &str, to: OrderStatus) -> Result<Option<StateChange>> {
        let order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))?;
        let from = order.status;

        if from == to {
            return Ok(None);
        }
        if from.is_terminal() {
            return Err(Error::TerminalOrder {
                order_id: order_id.to_string(),
                status: from,
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                order_id: order_id.to_string(),
                from,
                to,
            });
        }

        order.status = to;
        let symbol = order.symbol.clone();
        if to.is_terminal() {
            self.deactivate(&symbol, order_id);
        }

        let change = StateChange {
            order_id: order_id.to_string(),
            from: Some(from),
            to,
            transition: format!("{}->{}", from, to),
            timestamp: Utc::now(),
        };
        self.history.push(change.clone());
        Ok(Some(change))
    }

    fn sorted(&self, mut filter: impl FnMut(&Order) -> bool) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.values().filter(|o| filter(*o)).cloned().collect();
        orders.sort_by(|a, b| {
            a.created_time
                .cmp(&b.created_time)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        orders
    }
}

/// Order Registry - the single owner of order state
pub struct OrderRegistry {
    bus: Arc<EventBus>,
    state: RwLock<RegistryState>,
    subscriptions: Mutex<Vec<(EventType, HandlerId)>>,
}

impl OrderRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: RwLock::new(RegistryState::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to ORDER, FILL and CANCEL.
    pub fn attach(self: &Arc<Self>) {
        let bus = Arc::clone(&self.bus);
        let ids = [
            (
                EventType::Order,
                bus.subscribe_method(EventType::Order, self, "OrderRegistry::on_order", Self::on_order, REGISTRY_PRIORITY),
            ),
            (
                EventType::Fill,
                bus.subscribe_method(EventType::Fill, self, "OrderRegistry::on_fill", Self::on_fill, REGISTRY_PRIORITY),
            ),
            (
                EventType::Cancel,
                bus.subscribe_method(EventType::Cancel, self, "OrderRegistry::on_cancel", Self::on_cancel, REGISTRY_PRIORITY),
            ),
        ];
        self.subscriptions.lock().extend(ids);
    }

    /// Remove this registry's subscriptions.
    pub fn detach(&self) {
        for (event_type, id) in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(event_type, id);
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Store a new order. Rejects invalid orders, known order ids and
    /// rule ids that already produced an order.
    pub fn register_order(&self, order: Order) -> Result<()> {
        order.validate().map_err(|reason| Error::InvalidOrder {
            order_id: order.order_id.clone(),
            reason,
        })?;

        let change = {
            let mut state = self.state.write();
            if state.orders.contains_key(&order.order_id) {
                state.duplicates_blocked += 1;
                return Err(Error::DuplicateOrderId(order.order_id));
            }
            if let Some(rule_id) = &order.rule_id {
                if state.rule_ids.contains(rule_id) {
                    state.duplicates_blocked += 1;
                    return Err(Error::DuplicateRuleId(rule_id.clone()));
                }
                state.rule_ids.insert(rule_id.clone());
            }
            if order.is_active() {
                state
                    .active_by_symbol
                    .entry(order.symbol.clone())
                    .or_default()
                    .insert(order.order_id.clone());
            }

            let change = StateChange {
                order_id: order.order_id.clone(),
                from: None,
                to: order.status,
                transition: "REGISTERED".to_string(),
                timestamp: Utc::now(),
            };
            state.history.push(change.clone());
            state.orders.insert(order.order_id.clone(), order.clone());
            change
        };

        info!(
            "Registered order {}: {} {} {} @ {:?} ({})",
            order.order_id, order.side, order.quantity, order.symbol, order.price, order.status
        );
        self.notify(&change, &order);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bus handlers
    // ------------------------------------------------------------------

    /// ORDER: register a PENDING order unless its rule_id was already used.
    pub fn on_order(&self, event: &mut Event) -> HandlerResult {
        if !self.first_delivery(event) {
            debug!("ORDER {} already processed", event.id());
            return Ok(());
        }
        let payload: OrderPayload = event.decode()?;

        if let Some(rule_id) = &payload.rule_id {
            let mut state = self.state.write();
            if state.rule_ids.contains(rule_id) {
                state.duplicates_blocked += 1;
                drop(state);
                debug!(
                    "ORDER {} blocked: rule {} already produced an order",
                    payload.order_id, rule_id
                );
                event.consume();
                return Ok(());
            }
        }

        if let Err(e) = self.register_order(payload.to_order(OrderStatus::Pending)) {
            warn!("ORDER {} not registered: {}", payload.order_id, e);
            // Downstream consumers must not act on an order we refused
            event.consume();
        }
        Ok(())
    }

    /// FILL: accumulate quantity and advance the lifecycle.
    pub fn on_fill(&self, event: &mut Event) -> HandlerResult {
        if !self.first_delivery(event) {
            debug!("FILL {} already processed", event.id());
            return Ok(());
        }
        let fill: FillPayload = event.decode()?;
        if let Err(e) = self.apply_fill(&fill) {
            warn!("FILL for {} ignored: {}", fill.order_id, e);
        }
        Ok(())
    }

    /// Apply one fill; PARTIAL until the full quantity has executed.
    pub fn apply_fill(&self, fill: &FillPayload) -> Result<OrderStatus> {
        let (changes, snapshot) = {
            let mut state = self.state.write();
            let order = state
                .orders
                .get_mut(&fill.order_id)
                .ok_or_else(|| Error::UnknownOrder(fill.order_id.clone()))?;

            if order.status.is_terminal() {
                return Err(Error::TerminalOrder {
                    order_id: fill.order_id.clone(),
                    status: order.status,
                });
            }
            if fill.quantity <= Decimal::ZERO {
                return Err(Error::InvalidOrder {
                    order_id: fill.order_id.clone(),
                    reason: format!("non-positive fill quantity {}", fill.quantity),
                });
            }
            if fill.direction != order.side {
                warn!(
                    "Fill direction {} differs from order {} side {}",
                    fill.direction, order.order_id, order.side
                );
            }

            let applied = order.apply_fill(fill.quantity, fill.price, Utc::now());
            if applied < fill.quantity {
                warn!(
                    "Overfill on {}: {} requested, {} applied",
                    order.order_id, fill.quantity, applied
                );
            }
            let from = order.status;
            let target = if order.is_fully_filled() {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };

            let mut changes = Vec::new();
            if from == OrderStatus::Created && target == OrderStatus::Partial {
                changes.extend(state.set_status(&fill.order_id, OrderStatus::Pending)?);
            }
            match state.set_status(&fill.order_id, target)? {
                Some(change) => changes.push(change),
                None => {
                    // Another partial fill; status unchanged but still reported
                    let change = StateChange {
                        order_id: fill.order_id.clone(),
                        from: Some(target),
                        to: target,
                        transition: format!("{}->{}", target, target),
                        timestamp: Utc::now(),
                    };
                    state.history.push(change.clone());
                    changes.push(change);
                }
            }

            let snapshot = state.orders.get(&fill.order_id).cloned();
            (changes, snapshot)
        };

        let Some(order) = snapshot else {
            return Err(Error::UnknownOrder(fill.order_id.clone()));
        };
        info!(
            "Fill {} {} @ {} on {}: filled {}/{} avg {:?} -> {}",
            fill.direction,
            fill.quantity,
            fill.price,
            order.order_id,
            order.filled_quantity,
            order.quantity,
            order.average_fill_price,
            order.status
        );
        for change in &changes {
            self.notify(change, &order);
        }
        Ok(order.status)
    }

    /// CANCEL: cancel unless already terminal.
    pub fn on_cancel(&self, event: &mut Event) -> HandlerResult {
        if !self.first_delivery(event) {
            debug!("CANCEL {} already processed", event.id());
            return Ok(());
        }
        let payload: CancelPayload = event.decode()?;
        let reason = payload.reason.unwrap_or_else(|| "cancel event".to_string());
        if let Err(e) = self.cancel_order(&payload.order_id, reason) {
            warn!("CANCEL for {} ignored: {}", payload.order_id, e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Direct transitions
    // ------------------------------------------------------------------

    pub fn cancel_order(&self, order_id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let (change, order) = {
            let mut state = self.state.write();
            let change = state.set_status(order_id, OrderStatus::Canceled)?;
            let Some(order) = state.orders.get_mut(order_id) else {
                return Err(Error::UnknownOrder(order_id.to_string()));
            };
            if change.is_some() {
                order.cancel_time = Some(Utc::now());
                order.cancel_reason = Some(reason.clone());
            }
            (change, order.clone())
        };

        // Same-state: the only way to reach here is an already-canceled order
        let Some(change) = change else {
            return Err(Error::TerminalOrder {
                order_id: order_id.to_string(),
                status: order.status,
            });
        };
        info!("Canceled order {}: {}", order_id, reason);
        self.notify(&change, &order);
        Ok(())
    }

    /// Broker refused the order.
    pub fn reject_order(&self, order_id: &str, reason: &str) -> Result<()> {
        self.transition(order_id, OrderStatus::Rejected)?;
        warn!("Order {} rejected: {}", order_id, reason);
        Ok(())
    }

    /// Strict table transition; same-state is a silent no-op.
    pub fn transition(&self, order_id: &str, to: OrderStatus) -> Result<()> {
        let (change, order) = {
            let mut state = self.state.write();
            let change = state.set_status(order_id, to).inspect_err(|e| {
                warn!("Transition refused: {}", e);
            })?;
            (change, state.orders.get(order_id).cloned())
        };
        if let (Some(change), Some(order)) = (change, order) {
            self.notify(&change, &order);
        }
        Ok(())
    }

    fn notify(&self, change: &StateChange, order: &Order) {
        let payload = StateChangePayload {
            order_id: change.order_id.clone(),
            status: change.to,
            transition: change.transition.clone(),
            timestamp: change.timestamp,
            order_snapshot: OrderSnapshot::from(order),
            rule_id: order.rule_id.clone(),
        };
        self.bus
            .publish(Event::with_payload(EventType::Portfolio, &payload));
    }

    fn first_delivery(&self, event: &Event) -> bool {
        self.state.write().processed_events.insert(event.id())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.state.read().orders.get(order_id).cloned()
    }

    /// Non-terminal orders
    pub fn get_active_orders(&self) -> Vec<Order> {
        self.state.read().sorted(|o| o.is_active())
    }

    /// FILLED orders
    pub fn get_completed_orders(&self) -> Vec<Order> {
        self.get_orders_by_status(OrderStatus::Filled)
    }

    pub fn get_orders_by_status(&self, status: OrderStatus) -> Vec<Order> {
        self.state.read().sorted(|o| o.status == status)
    }

    pub fn get_orders_for_symbol(&self, symbol: &Symbol) -> Vec<Order> {
        self.state.read().sorted(|o| &o.symbol == symbol)
    }

    /// Size of the active-order index for `symbol`
    pub fn active_order_count(&self, symbol: &Symbol) -> usize {
        self.state
            .read()
            .active_by_symbol
            .get(symbol)
            .map_or(0, BTreeSet::len)
    }

    pub fn active_order_ids(&self, symbol: &Symbol) -> Vec<String> {
        self.state
            .read()
            .active_by_symbol
            .get(symbol)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_rule_seen(&self, rule_id: &str) -> bool {
        self.state.read().rule_ids.contains(rule_id)
    }

    pub fn state_changes(&self) -> Vec<StateChange> {
        self.state.read().history.clone()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut by_status = BTreeMap::new();
        let mut total_filled_quantity = Decimal::ZERO;
        for order in state.orders.values() {
            *by_status.entry(order.status).or_insert(0) += 1;
            total_filled_quantity += order.filled_quantity;
        }

        RegistryStats {
            total_orders: state.orders.len(),
            active_orders: state.orders.values().filter(|o| o.is_active()).count(),
            completed_orders: by_status.get(&OrderStatus::Filled).copied().unwrap_or(0),
            by_status,
            rule_ids_seen: state.rule_ids.len(),
            duplicates_blocked: state.duplicates_blocked,
            events_processed: state.processed_events.len(),
            state_changes: state.history.len(),
            total_filled_quantity,
        }
    }

    /// Forget all orders, rule ids, history and processed events.
    pub fn reset(&self) {
        *self.state.write() = RegistryState::default();
        debug!("Order registry reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderType, Side};
    use crate::events::handler_fn;

    fn setup() -> (Arc<EventBus>, Arc<OrderRegistry>) {
        let bus = Arc::new(EventBus::default());
        let registry = Arc::new(OrderRegistry::new(Arc::clone(&bus)));
        registry.attach();
        (bus, registry)
    }

    fn order(id: &str, qty: i64) -> Order {
        Order::new_market(id, Symbol::new("TEST"), Side::Buy, Decimal::from(qty), Some(Decimal::from(100)))
            .with_status(OrderStatus::Pending)
    }

    fn fill(id: &str, qty: i64, price: i64) -> FillPayload {
        FillPayload {
            order_id: id.into(),
            symbol: Symbol::new("TEST"),
            direction: Side::Buy,
            quantity: Decimal::from(qty),
            price: Decimal::from(price),
            commission: Decimal::ZERO,
            fill_id: None,
        }
    }

    fn order_event(id: &str, rule: Option<&str>) -> Event {
        Event::order(&OrderPayload {
            order_id: id.into(),
            symbol: Symbol::new("TEST"),
            direction: Side::Buy,
            quantity: Decimal::from(100),
            price: Some(Decimal::from(100)),
            order_type: OrderType::Market,
            rule_id: rule.map(String::from),
        })
    }

    #[test]
    fn test_register_then_get_is_identical() {
        let (_bus, registry) = setup();
        let o = order("o1", 100).with_rule_id("r1");
        registry.register_order(o.clone()).unwrap();
        assert_eq!(registry.get_order("o1"), Some(o));
        assert!(registry.is_rule_seen("r1"));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 10).with_rule_id("r1")).unwrap();
        assert!(matches!(
            registry.register_order(order("o1", 10)),
            Err(Error::DuplicateOrderId(_))
        ));
        assert!(matches!(
            registry.register_order(order("o2", 10).with_rule_id("r1")),
            Err(Error::DuplicateRuleId(_))
        ));
        assert_eq!(registry.get_stats().total_orders, 1);
        assert_eq!(registry.get_stats().duplicates_blocked, 2);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let (_bus, registry) = setup();
        assert!(registry.register_order(order("o1", 0)).is_err());
        let mut limit = order("o2", 5);
        limit.order_type = OrderType::Stop;
        limit.price = None;
        assert!(matches!(
            registry.register_order(limit),
            Err(Error::InvalidOrder { .. })
        ));
        assert_eq!(registry.get_stats().total_orders, 0);
    }

    #[test]
    fn test_full_fill_via_bus() {
        let (bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();
        bus.publish(Event::fill(&fill("o1", 100, 101)));

        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.average_fill_price, Some(Decimal::from(101)));
        assert!(o.fill_time.is_some());
        assert_eq!(registry.active_order_count(&Symbol::new("TEST")), 0);
        assert_eq!(registry.get_completed_orders().len(), 1);
    }

    #[test]
    fn test_partial_fills_accumulate() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();

        assert_eq!(registry.apply_fill(&fill("o1", 30, 100)).unwrap(), OrderStatus::Partial);
        assert_eq!(registry.apply_fill(&fill("o1", 30, 110)).unwrap(), OrderStatus::Partial);
        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.filled_quantity, Decimal::from(60));
        assert_eq!(o.average_fill_price, Some(Decimal::from(105)));
        assert_eq!(registry.active_order_count(&Symbol::new("TEST")), 1);

        // Overfill clamps to quantity
        assert_eq!(registry.apply_fill(&fill("o1", 80, 100)).unwrap(), OrderStatus::Filled);
        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.filled_quantity, Decimal::from(100));
        assert!(registry.apply_fill(&fill("o1", 1, 100)).is_err());
    }

    #[test]
    fn test_partial_fill_on_created_goes_through_pending() {
        let (_bus, registry) = setup();
        registry
            .register_order(order("o1", 10).with_status(OrderStatus::Created))
            .unwrap();
        registry.apply_fill(&fill("o1", 4, 10)).unwrap();
        let transitions: Vec<String> = registry
            .state_changes()
            .into_iter()
            .map(|c| c.transition)
            .collect();
        assert_eq!(transitions, vec!["REGISTERED", "CREATED->PENDING", "PENDING->PARTIAL"]);
    }

    #[test]
    fn test_on_fill_is_idempotent_per_event() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();

        let event = Event::fill(&fill("o1", 40, 100));
        registry.on_fill(&mut event.clone()).unwrap();
        registry.on_fill(&mut event.clone()).unwrap();

        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.filled_quantity, Decimal::from(40));
        assert_eq!(o.status, OrderStatus::Partial);
        assert_eq!(registry.get_stats().events_processed, 1);
    }

    #[test]
    fn test_on_cancel_is_idempotent_per_event() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();

        let event = Event::cancel(&CancelPayload {
            order_id: "o1".into(),
            reason: Some("first".into()),
        });
        registry.on_cancel(&mut event.clone()).unwrap();
        let history = registry.state_changes().len();
        registry.on_cancel(&mut event.clone()).unwrap();

        assert_eq!(registry.state_changes().len(), history);
        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.status, OrderStatus::Canceled);
        assert_eq!(o.cancel_reason.as_deref(), Some("first"));
    }

    #[test]
    fn test_replayed_fill_not_reapplied() {
        let bus = Arc::new(
            EventBus::new(crate::core::BusConfig {
                replay_enabled: true,
                ..crate::core::BusConfig::default()
            })
            .unwrap(),
        );
        let registry = Arc::new(OrderRegistry::new(Arc::clone(&bus)));
        registry.attach();
        registry.register_order(order("o1", 100)).unwrap();

        assert_eq!(bus.publish(Event::fill(&fill("o1", 30, 100))), 1);
        // History also holds the PORTFOLIO notifications; only the FILL has a subscriber
        let retained = bus.history_len();
        assert_eq!(bus.replay_events(..), 1);

        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.filled_quantity, Decimal::from(30));
        assert_eq!(o.status, OrderStatus::Partial);
        assert_eq!(bus.metrics().events_replayed, retained as u64);
    }

    #[test]
    fn test_exact_decimal_fill_completes() {
        let (bus, registry) = setup();
        let quantity: Decimal = "1.000000000000000001".parse().unwrap();
        let o = Order::new_market("o1", Symbol::new("TEST"), Side::Buy, quantity, None)
            .with_status(OrderStatus::Pending);
        registry.register_order(o).unwrap();

        let mut exact = fill("o1", 0, 0);
        exact.quantity = quantity;
        exact.price = "100.000000000000000001".parse().unwrap();
        bus.publish(Event::fill(&exact));

        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.filled_quantity, quantity);
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn test_unknown_fill_ignored() {
        let (bus, registry) = setup();
        assert_eq!(bus.publish(Event::fill(&fill("ghost", 1, 1))), 1);
        assert!(registry.get_order("ghost").is_none());
    }

    #[test]
    fn test_cancel_after_fill_refused() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();
        registry.apply_fill(&fill("o1", 100, 101)).unwrap();

        assert!(matches!(
            registry.cancel_order("o1", "too late"),
            Err(Error::TerminalOrder { .. })
        ));
        assert_eq!(registry.get_order("o1").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_cancel_via_event() {
        let (bus, registry) = setup();
        registry.register_order(order("o1", 100)).unwrap();
        bus.publish(Event::cancel(&CancelPayload {
            order_id: "o1".into(),
            reason: Some("user".into()),
        }));
        let o = registry.get_order("o1").unwrap();
        assert_eq!(o.status, OrderStatus::Canceled);
        assert_eq!(o.cancel_reason.as_deref(), Some("user"));
        assert!(o.cancel_time.is_some());
        assert!(registry.cancel_order("o1", "again").is_err());
    }

    #[test]
    fn test_on_order_blocks_known_rule() {
        let (bus, registry) = setup();
        let downstream = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&downstream);
        bus.subscribe(
            EventType::Order,
            handler_fn("broker", move |_e: &mut Event| {
                *counter.lock() += 1;
                Ok(())
            }),
            0,
        );

        // Second order goes straight to the handler, past bus dedup
        bus.publish(order_event("o1", Some("r1")));
        registry.on_order(&mut order_event("o2", Some("r1"))).unwrap();

        assert!(registry.get_order("o2").is_none());
        assert_eq!(registry.get_orders_by_status(OrderStatus::Pending).len(), 1);
        assert_eq!(*downstream.lock(), 1);
    }

    #[test]
    fn test_on_order_is_idempotent_per_event() {
        let (_bus, registry) = setup();
        let mut event = order_event("o1", None);
        registry.on_order(&mut event).unwrap();
        let mut again = event.clone();
        registry.on_order(&mut again).unwrap();
        assert_eq!(registry.get_stats().total_orders, 1);
        assert!(!again.is_consumed());
    }

    #[test]
    fn test_transition_table_enforced() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 10)).unwrap();
        assert!(registry.transition("o1", OrderStatus::Pending).is_ok());
        assert!(matches!(
            registry.transition("o1", OrderStatus::Created),
            Err(Error::InvalidTransition { .. })
        ));
        registry.reject_order("o1", "no liquidity").unwrap();
        assert_eq!(registry.get_order("o1").unwrap().status, OrderStatus::Rejected);
        assert!(registry.transition("o1", OrderStatus::Filled).is_err());
        assert!(registry.transition("missing", OrderStatus::Filled).is_err());
    }

    #[test]
    fn test_notifications_published() {
        let (bus, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventType::Portfolio,
            handler_fn("watcher", move |e: &mut Event| {
                let change: StateChangePayload = e.decode()?;
                sink.lock().push((change.transition, change.rule_id));
                Ok(())
            }),
            0,
        );

        registry.register_order(order("o1", 10).with_rule_id("r9")).unwrap();
        registry.apply_fill(&fill("o1", 10, 5)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("REGISTERED".to_string(), Some("r9".to_string())));
        assert_eq!(seen[1].0, "PENDING->FILLED");
    }

    #[test]
    fn test_stats_and_reset() {
        let (_bus, registry) = setup();
        registry.register_order(order("o1", 10).with_rule_id("a")).unwrap();
        registry.register_order(order("o2", 10).with_rule_id("b")).unwrap();
        registry.apply_fill(&fill("o2", 10, 1)).unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.total_orders, 2);
        assert_eq!(stats.active_orders, 1);
        assert_eq!(stats.completed_orders, 1);
        assert_eq!(stats.by_status.get(&OrderStatus::Pending), Some(&1));
        assert_eq!(stats.total_filled_quantity, Decimal::from(10));

        registry.reset();
        assert_eq!(registry.get_stats(), RegistryStats::default());
        assert!(!registry.is_rule_seen("a"));
        registry.register_order(order("o1", 10).with_rule_id("a")).unwrap();
    }

    #[test]
    fn test_detach_stops_consumption() {
        let (bus, registry) = setup();
        registry.detach();
        assert_eq!(bus.publish(order_event("o1", None)), 0);
        assert!(registry.get_order("o1").is_none());
    }
}
