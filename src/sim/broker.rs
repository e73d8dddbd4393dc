//! Paper broker - fills every accepted ORDER at its reference price

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::BrokerConfig;
use crate::events::{
    Event, EventBus, EventType, FillPayload, HandlerId, HandlerResult, OrderPayload,
};

pub const BROKER_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrokerStats {
    pub orders_received: u64,
    /// Orders without a reference price
    pub orders_unfillable: u64,
    pub fills_sent: u64,
    pub commission_charged: Decimal,
}

pub struct PaperBroker {
    bus: Arc<EventBus>,
    commission: Decimal,
    /// Number of fills each order is split into
    slices: u32,
    stats: Mutex<BrokerStats>,
    subscription: Mutex<Option<HandlerId>>,
}

impl PaperBroker {
    pub fn new(bus: Arc<EventBus>, config: &BrokerConfig) -> Self {
        Self {
            bus,
            commission: config.commission,
            slices: 1,
            stats: Mutex::new(BrokerStats::default()),
            subscription: Mutex::new(None),
        }
    }

    /// Split each order into `slices` partial fills.
    pub fn with_slices(mut self, slices: u32) -> Self {
        self.slices = slices.max(1);
        self
    }

    pub fn attach(self: &Arc<Self>) {
        let id = self.bus.subscribe_method(
            EventType::Order,
            self,
            "PaperBroker::on_order",
            Self::on_order,
            BROKER_PRIORITY,
        );
        *self.subscription.lock() = Some(id);
    }

    pub fn detach(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.bus.unsubscribe(EventType::Order, id);
        }
    }

    pub fn on_order(&self, event: &mut Event) -> HandlerResult {
        let order: OrderPayload = event.decode()?;
        self.stats.lock().orders_received += 1;

        let Some(price) = order.price else {
            warn!("Order {} has no reference price; not filled", order.order_id);
            self.stats.lock().orders_unfillable += 1;
            return Ok(());
        };

        for (i, quantity) in self.slice(order.quantity).into_iter().enumerate() {
            let fill = FillPayload {
                order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                direction: order.direction,
                quantity,
                price,
                commission: self.commission,
                fill_id: (self.slices > 1).then(|| format!("{}", i + 1)),
            };
            debug!(
                "Paper fill {} {} {} @ {} ({})",
                order.order_id, fill.direction, quantity, price, i + 1
            );
            {
                let mut stats = self.stats.lock();
                stats.fills_sent += 1;
                stats.commission_charged += self.commission;
            }
            self.bus.publish(Event::fill(&fill));
        }
        Ok(())
    }

    /// Whole-unit slices; the last slice takes the remainder.
    fn slice(&self, quantity: Decimal) -> Vec<Decimal> {
        let n = Decimal::from(self.slices);
        let each = (quantity / n).floor();
        if self.slices == 1 || each <= Decimal::ZERO {
            return vec![quantity];
        }
        let mut out = vec![each; self.slices as usize - 1];
        out.push(quantity - each * (n - Decimal::ONE));
        out
    }

    pub fn get_stats(&self) -> BrokerStats {
        self.stats.lock().clone()
    }
}
