//! Error handling - flat, recoverable pipeline errors

use thiserror::Error;

use crate::core::types::OrderStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structurally invalid order (missing symbol, bad quantity, missing price)
    #[error("Invalid order {order_id}: {reason}")]
    InvalidOrder { order_id: String, reason: String },

    /// Order id already registered
    #[error("Duplicate order id: {0}")]
    DuplicateOrderId(String),

    /// Rule id already produced an order
    #[error("Duplicate rule id: {0}")]
    DuplicateRuleId(String),

    /// No order with this id
    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    /// Transition outside the lifecycle table
    #[error("Invalid transition for {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Order already resolved
    #[error("Order {order_id} is terminal ({status})")]
    TerminalOrder { order_id: String, status: OrderStatus },

    /// Payload could not be decoded for the event type
    #[error("Malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: String, reason: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
