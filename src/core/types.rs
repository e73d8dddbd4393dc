//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tradeable symbol (e.g., "AAPL", "BTC/USDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn requires_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::Stop)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Created,
    Pending,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::Partial,
        OrderStatus::Filled,
        OrderStatus::Canceled,
        OrderStatus::Rejected,
        OrderStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Lifecycle table. Same-state is always allowed.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            OrderStatus::Created => matches!(
                next,
                OrderStatus::Pending | OrderStatus::Canceled | OrderStatus::Filled
            ),
            OrderStatus::Pending => matches!(
                next,
                OrderStatus::Partial
                    | OrderStatus::Filled
                    | OrderStatus::Rejected
                    | OrderStatus::Canceled
            ),
            OrderStatus::Partial => matches!(next, OrderStatus::Filled | OrderStatus::Canceled),
            OrderStatus::Filled
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// `None` for market orders without a reference price
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    /// Correlation key shared with the originating signal
    pub rule_id: Option<String>,
    pub created_time: DateTime<Utc>,
    pub fill_time: Option<DateTime<Utc>>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol,
            side,
            quantity,
            price,
            order_type,
            status: OrderStatus::Created,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            rule_id: None,
            created_time: Utc::now(),
            fill_time: None,
            cancel_time: None,
            cancel_reason: None,
        }
    }

    pub fn new_market(
        order_id: impl Into<String>,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        reference_price: Option<Decimal>,
    ) -> Self {
        Self::new(order_id, symbol, side, OrderType::Market, quantity, reference_price)
    }

    pub fn new_limit(
        order_id: impl Into<String>,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self::new(order_id, symbol, side, OrderType::Limit, quantity, Some(price))
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Structural checks applied before registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.order_id.trim().is_empty() {
            return Err("missing order_id".into());
        }
        if self.symbol.is_empty() {
            return Err("missing symbol".into());
        }
        if self.quantity <= Decimal::ZERO {
            return Err(format!("non-positive quantity {}", self.quantity));
        }
        if self.order_type.requires_price() && self.price.is_none() {
            return Err(format!("{} order without price", self.order_type));
        }
        Ok(())
    }

    /// Accumulate a fill, clamped to the remaining quantity.
    /// Returns the quantity actually applied.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal, at: DateTime<Utc>) -> Decimal {
        let applied = quantity.min(self.remaining());
        if applied <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let prior_notional = self.average_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        let filled = self.filled_quantity + applied;
        self.average_fill_price = Some((prior_notional + price * applied) / filled);
        self.filled_quantity = filled;
        self.fill_time = Some(at);
        applied
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }
}
