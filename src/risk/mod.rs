//! Risk - position sizing policies

use rust_decimal::prelude::*;
use tracing::debug;

use crate::core::{OrderConfig, PositionSizer};
use crate::events::SignalPayload;

/// Same quantity for every signal
pub struct FixedSizer {
    quantity: Decimal,
}

impl FixedSizer {
    pub fn new(quantity: Decimal) -> Self {
        Self { quantity }
    }

    pub fn from_config(config: &OrderConfig) -> Self {
        Self::new(config.default_quantity)
    }
}

impl PositionSizer for FixedSizer {
    fn name(&self) -> &str {
        "fixed"
    }

    fn order_quantity(&self, _signal: &SignalPayload) -> Option<Decimal> {
        Some(self.quantity)
    }
}

/// Sizes to a target notional at the signal's reference price, optionally
/// scaled by signal strength, rounded down to whole units.
pub struct NotionalSizer {
    notional: Decimal,
    scale_by_strength: bool,
    max_quantity: Option<Decimal>,
}

impl NotionalSizer {
    pub fn new(notional: Decimal) -> Self {
        Self {
            notional,
            scale_by_strength: false,
            max_quantity: None,
        }
    }

    pub fn scaled_by_strength(mut self) -> Self {
        self.scale_by_strength = true;
        self
    }

    pub fn with_max_quantity(mut self, max: Decimal) -> Self {
        self.max_quantity = Some(max);
        self
    }
}

impl PositionSizer for NotionalSizer {
    fn name(&self) -> &str {
        "notional"
    }

    fn order_quantity(&self, signal: &SignalPayload) -> Option<Decimal> {
        if signal.price <= Decimal::ZERO {
            debug!("No reference price for {}; cannot size", signal.symbol);
            return None;
        }

        let mut notional = self.notional;
        if self.scale_by_strength {
            let strength = Decimal::from_f64(signal.signal_value.abs())?;
            notional *= strength.min(Decimal::ONE);
        }

        let mut quantity = (notional / signal.price).floor();
        if let Some(max) = self.max_quantity {
            quantity = quantity.min(max);
        }
        (quantity > Decimal::ZERO).then_some(quantity)
    }
}
