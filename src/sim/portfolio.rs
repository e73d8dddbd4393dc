//! Position ledger - terminal consumer of FILL and PORTFOLIO events
//!
//! Applies every fill it sees, including fills for orders it never heard
//! registered.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{OrderStatus, Symbol};
use crate::events::{
    Event, EventBus, EventType, FillPayload, HandlerId, HandlerResult, StateChangePayload,
};

pub const LEDGER_PRIORITY: i32 = 10;

/// Net position in one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Position {
    /// Signed: long > 0, short < 0
    pub quantity: Decimal,
    /// Cash flow from fills, net of commission
    pub cash: Decimal,
    pub commission: Decimal,
    pub fills: u64,
}

impl Position {
    /// Mark-to-market value at `price`
    pub fn equity(&self, price: Decimal) -> Decimal {
        self.cash + self.quantity * price
    }
}

#[derive(Default)]
struct LedgerState {
    positions: BTreeMap<Symbol, Position>,
    tracked_orders: HashSet<String>,
    untracked_fills: u64,
    notifications: u64,
    filled_orders: u64,
}

pub struct PositionLedger {
    bus: Arc<EventBus>,
    state: RwLock<LedgerState>,
    subscriptions: Mutex<Vec<(EventType, HandlerId)>>,
}

impl PositionLedger {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: RwLock::new(LedgerState::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(self: &Arc<Self>) {
        let fill = self.bus.subscribe_method(
            EventType::Fill,
            self,
            "PositionLedger::on_fill",
            Self::on_fill,
            LEDGER_PRIORITY,
        );
        let change = self.bus.subscribe_method(
            EventType::Portfolio,
            self,
            "PositionLedger::on_state_change",
            Self::on_state_change,
            LEDGER_PRIORITY,
        );
        self.subscriptions
            .lock()
            .extend([(EventType::Fill, fill), (EventType::Portfolio, change)]);
    }

    pub fn detach(&self) {
        for (event_type, id) in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(event_type, id);
        }
    }

    pub fn on_fill(&self, event: &mut Event) -> HandlerResult {
        let fill: FillPayload = event.decode()?;
        let mut state = self.state.write();

        if !state.tracked_orders.contains(&fill.order_id) {
            debug!("Fill for untracked order {}", fill.order_id);
            state.untracked_fills += 1;
        }

        let position = state.positions.entry(fill.symbol.clone()).or_default();
        let signed = fill.quantity * fill.direction.sign();
        position.quantity += signed;
        position.cash -= signed * fill.price + fill.commission;
        position.commission += fill.commission;
        position.fills += 1;
        info!(
            "Position {}: {} (cash {})",
            fill.symbol, position.quantity, position.cash
        );
        Ok(())
    }

    pub fn on_state_change(&self, event: &mut Event) -> HandlerResult {
        let change: StateChangePayload = event.decode()?;
        let mut state = self.state.write();
        state.notifications += 1;
        state.tracked_orders.insert(change.order_id);
        if change.status == OrderStatus::Filled {
            state.filled_orders += 1;
        }
        Ok(())
    }

    pub fn position(&self, symbol: &Symbol) -> Position {
        self.state
            .read()
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn positions(&self) -> BTreeMap<Symbol, Position> {
        self.state.read().positions.clone()
    }

    pub fn untracked_fills(&self) -> u64 {
        self.state.read().untracked_fills
    }

    pub fn notifications(&self) -> u64 {
        self.state.read().notifications
    }

    pub fn filled_orders(&self) -> u64 {
        self.state.read().filled_orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Side;

    fn fill(order_id: &str, side: Side, qty: i64, price: i64) -> Event {
        Event::fill(&FillPayload {
            order_id: order_id.into(),
            symbol: Symbol::new("TEST"),
            direction: side,
            quantity: Decimal::from(qty),
            price: Decimal::from(price),
            commission: Decimal::ONE,
            fill_id: None,
        })
    }

    #[test]
    fn test_round_trip_position() {
        let bus = Arc::new(EventBus::default());
        let ledger = Arc::new(PositionLedger::new(Arc::clone(&bus)));
        ledger.attach();

        bus.publish(fill("o1", Side::Buy, 10, 100));
        bus.publish(fill("o2", Side::Sell, 10, 110));

        let p = ledger.position(&Symbol::new("TEST"));
        assert_eq!(p.quantity, Decimal::ZERO);
        assert_eq!(p.cash, Decimal::from(98));
        assert_eq!(p.commission, Decimal::from(2));
        assert_eq!(p.fills, 2);
        assert_eq!(p.equity(Decimal::from(500)), Decimal::from(98));
    }

    #[test]
    fn test_untracked_fills_still_applied() {
        let bus = Arc::new(EventBus::default());
        let ledger = Arc::new(PositionLedger::new(Arc::clone(&bus)));
        ledger.attach();

        bus.publish(fill("ghost", Side::Sell, 5, 20));
        assert_eq!(ledger.untracked_fills(), 1);
        assert_eq!(ledger.position(&Symbol::new("TEST")).quantity, Decimal::from(-5));
    }

    #[test]
    fn test_dropped_ledger_is_pruned() {
        let bus = Arc::new(EventBus::default());
        let ledger = Arc::new(PositionLedger::new(Arc::clone(&bus)));
        ledger.attach();
        drop(ledger);
        assert_eq!(bus.publish(fill("o1", Side::Buy, 1, 1)), 0);
    }
}
