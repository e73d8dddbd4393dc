//! Core traits - collaborator contracts consumed by the pipeline

use rust_decimal::Decimal;

use crate::events::SignalPayload;

/// Position sizing policy - supplies the order quantity for a signal.
///
/// Returning `None` (or a non-positive quantity) means "do not trade".
pub trait PositionSizer: Send + Sync {
    /// Sizer name (for logs)
    fn name(&self) -> &str;

    /// Quantity to order for this signal
    fn order_quantity(&self, signal: &SignalPayload) -> Option<Decimal>;
}
