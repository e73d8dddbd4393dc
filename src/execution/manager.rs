//! Order Manager - turns signals into orders under a per-symbol cap
//!
//! Holds no order state of its own: active counts, fill progress and
//! cancellability are all read back from the [`OrderRegistry`].

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{Error, OrderConfig, OrderStatus, OrderType, PositionSizer, Result};
use crate::events::{
    CancelPayload, Event, EventBus, EventType, FillPayload, HandlerId, HandlerResult,
    OrderPayload, SignalPayload,
};
use crate::execution::OrderRegistry;

/// Fill observers run after the registry and broker.
pub const MANAGER_FILL_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub signals_received: u64,
    pub neutral_signals: u64,
    /// Dropped by the per-symbol cap or the sizer
    pub signals_dropped: u64,
    pub orders_submitted: u64,
    /// Submitted orders the registry accepted
    pub orders_registered: u64,
    pub fills_observed: u64,
    pub slots_released: u64,
}

/// Order Manager
pub struct OrderManager {
    bus: Arc<EventBus>,
    registry: Arc<OrderRegistry>,
    sizer: Box<dyn PositionSizer>,
    config: OrderConfig,
    stats: Mutex<ManagerStats>,
    subscriptions: Mutex<Vec<(EventType, HandlerId)>>,
}

impl OrderManager {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<OrderRegistry>,
        sizer: Box<dyn PositionSizer>,
        config: OrderConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            sizer,
            config,
            stats: Mutex::new(ManagerStats::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to SIGNAL and FILL.
    pub fn attach(self: &Arc<Self>) {
        let signal = self.bus.subscribe_method(
            EventType::Signal,
            self,
            "OrderManager::on_signal",
            Self::on_signal,
            0,
        );
        let fill = self.bus.subscribe_method(
            EventType::Fill,
            self,
            "OrderManager::on_fill",
            Self::on_fill,
            MANAGER_FILL_PRIORITY,
        );
        self.subscriptions
            .lock()
            .extend([(EventType::Signal, signal), (EventType::Fill, fill)]);
    }

    pub fn detach(&self) {
        for (event_type, id) in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(event_type, id);
        }
    }

    pub fn on_signal(&self, event: &mut Event) -> HandlerResult {
        let signal: SignalPayload = event.decode()?;
        self.submit_signal(&signal);
        Ok(())
    }

    /// Build and publish a market order for `signal`.
    /// Returns the new order id, or `None` if the signal produced nothing.
    pub fn submit_signal(&self, signal: &SignalPayload) -> Option<String> {
        self.stats.lock().signals_received += 1;

        let Some(side) = signal.side() else {
            debug!("Neutral signal for {} ignored", signal.symbol);
            self.stats.lock().neutral_signals += 1;
            return None;
        };

        if self.config.enforce_single_position {
            let active = self.registry.active_order_count(&signal.symbol);
            if active >= self.config.max_orders_per_symbol {
                warn!(
                    "Signal for {} dropped: {} active order(s), limit {}",
                    signal.symbol, active, self.config.max_orders_per_symbol
                );
                self.stats.lock().signals_dropped += 1;
                return None;
            }
        }

        let quantity = match self.sizer.order_quantity(signal) {
            Some(q) if q > rust_decimal::Decimal::ZERO => q,
            other => {
                warn!(
                    "Sizer {} returned {:?} for {}; no order",
                    self.sizer.name(),
                    other,
                    signal.symbol
                );
                self.stats.lock().signals_dropped += 1;
                return None;
            }
        };

        let payload = OrderPayload {
            order_id: Uuid::new_v4().to_string(),
            symbol: signal.symbol.clone(),
            direction: side,
            quantity,
            price: Some(signal.price),
            order_type: OrderType::Market,
            rule_id: signal.rule_id.clone(),
        };

        info!(
            "Submitting {} {} {} @ {} (rule {:?})",
            payload.direction, payload.quantity, payload.symbol, signal.price, payload.rule_id
        );
        self.stats.lock().orders_submitted += 1;
        let order_id = payload.order_id.clone();
        let handled = self.bus.publish(Event::order(&payload));

        if self.registry.get_order(&order_id).is_some() {
            self.stats.lock().orders_registered += 1;
        } else {
            debug!("Order {} not registered ({} handler(s) ran)", order_id, handled);
        }
        Some(order_id)
    }

    /// Observes fills after the registry has applied them.
    pub fn on_fill(&self, event: &mut Event) -> HandlerResult {
        let fill: FillPayload = event.decode()?;
        let mut stats = self.stats.lock();
        stats.fills_observed += 1;

        if let Some(order) = self.registry.get_order(&fill.order_id) {
            if order.status == OrderStatus::Filled {
                stats.slots_released += 1;
                debug!(
                    "Order {} complete; {} slot(s) in use for {}",
                    order.order_id,
                    self.registry.active_order_count(&order.symbol),
                    order.symbol
                );
            }
        }
        Ok(())
    }

    /// Publish a CANCEL for a live order.
    pub fn cancel_order(&self, order_id: &str, reason: &str) -> Result<()> {
        let order = self
            .registry
            .get_order(order_id)
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(Error::TerminalOrder {
                order_id: order_id.to_string(),
                status: order.status,
            });
        }

        self.bus.publish(Event::cancel(&CancelPayload {
            order_id: order_id.to_string(),
            reason: Some(reason.to_string()),
        }));

        match self.registry.get_order(order_id) {
            Some(o) if o.status == OrderStatus::Canceled => Ok(()),
            Some(o) => Err(Error::InvalidTransition {
                order_id: order_id.to_string(),
                from: o.status,
                to: OrderStatus::Canceled,
            }),
            None => Err(Error::UnknownOrder(order_id.to_string())),
        }
    }

    pub fn config(&self) -> &OrderConfig {
        &self.config
    }

    pub fn get_stats(&self) -> ManagerStats {
        self.stats.lock().clone()
    }

    pub fn reset(&self) {
        *self.stats.lock() = ManagerStats::default();
    }
}
