//! Event record and typed payloads carried on the bus

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{Error, Order, OrderStatus, OrderType, Result, Side, Symbol};

/// String-keyed payload map; field semantics depend on the event type.
pub type Payload = serde_json::Map<String, Value>;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Signal,
    Order,
    Fill,
    Cancel,
    /// Order state-change notifications
    Portfolio,
    Market,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Signal => "SIGNAL",
            EventType::Order => "ORDER",
            EventType::Fill => "FILL",
            EventType::Cancel => "CANCEL",
            EventType::Portfolio => "PORTFOLIO",
            EventType::Market => "MARKET",
        };
        write!(f, "{}", s)
    }
}

/// Identified, typed, timestamped message.
///
/// Identity, type, payload and timestamp are fixed at construction; only the
/// `consumed` flag changes, and any handler may set it to stop delivery to
/// the remaining handlers of the current publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    event_type: EventType,
    payload: Payload,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    consumed: bool,
}

impl Event {
    pub fn new(event_type: EventType, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            timestamp: Utc::now(),
            consumed: false,
        }
    }

    /// Rebuild an event from stored parts (e.g. a journal).
    pub fn from_parts(
        id: Uuid,
        event_type: EventType,
        payload: Payload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            payload,
            timestamp,
            consumed: false,
        }
    }

    /// Serialize a typed payload into a new event.
    pub fn with_payload<T: Serialize>(event_type: EventType, payload: &T) -> Self {
        Self::new(event_type, to_payload(payload))
    }

    pub fn signal(payload: &SignalPayload) -> Self {
        Self::with_payload(EventType::Signal, payload)
    }

    pub fn order(payload: &OrderPayload) -> Self {
        Self::with_payload(EventType::Order, payload)
    }

    pub fn fill(payload: &FillPayload) -> Self {
        Self::with_payload(EventType::Fill, payload)
    }

    pub fn cancel(payload: &CancelPayload) -> Self {
        Self::with_payload(EventType::Cancel, payload)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Stop delivery to lower-priority handlers of this publish.
    pub fn consume(&mut self) {
        self.consumed = true;
    }

    /// Nil ids only come from externally rebuilt events.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_nil()
    }

    /// Non-empty string field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Decode the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            Error::MalformedEvent {
                event_id: self.id.to_string(),
                reason: format!("{} payload: {}", self.event_type, e),
            }
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Payload {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!("Non-object payload {:?} dropped", other);
            Payload::new()
        }
        Err(e) => {
            tracing::warn!("Payload serialization failed: {}", e);
            Payload::new()
        }
    }
}

/// SIGNAL payload: a trading decision from a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub symbol: Symbol,
    /// positive = buy, negative = sell, zero = neutral
    pub signal_value: f64,
    /// Reference price
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SignalPayload {
    pub fn new(symbol: impl Into<Symbol>, signal_value: f64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            signal_value,
            price,
            rule_id: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// `None` for neutral (or NaN) signals
    pub fn side(&self) -> Option<Side> {
        if self.signal_value > 0.0 {
            Some(Side::Buy)
        } else if self.signal_value < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// ORDER payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order_id: String,
    pub symbol: Symbol,
    pub direction: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

impl OrderPayload {
    /// Build the order this payload describes, in `status`.
    pub fn to_order(&self, status: OrderStatus) -> Order {
        let mut order = Order::new(
            self.order_id.clone(),
            self.symbol.clone(),
            self.direction,
            self.order_type,
            self.quantity,
            self.price,
        )
        .with_status(status);
        order.rule_id = self.rule_id.clone();
        order
    }
}

impl From<&Order> for OrderPayload {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            direction: order.side,
            quantity: order.quantity,
            price: order.price,
            order_type: order.order_type,
            rule_id: order.rule_id.clone(),
        }
    }
}

/// FILL payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillPayload {
    pub order_id: String,
    pub symbol: Symbol,
    pub direction: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub commission: Decimal,
    /// Distinguishes successive partial fills of one order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_id: Option<String>,
}

/// CANCEL payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Order fields carried on state-change notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub symbol: Symbol,
    pub direction: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub status: OrderStatus,
}

impl From<&Order> for OrderSnapshot {
    fn from(order: &Order) -> Self {
        Self {
            symbol: order.symbol.clone(),
            direction: order.side,
            quantity: order.quantity,
            price: order.price,
            order_type: order.order_type,
            status: order.status,
        }
    }
}

/// PORTFOLIO payload: one order state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangePayload {
    pub order_id: String,
    pub status: OrderStatus,
    /// e.g. "REGISTERED", "PENDING->FILLED"
    pub transition: String,
    pub timestamp: DateTime<Utc>,
    pub order_snapshot: OrderSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}
