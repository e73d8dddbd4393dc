//! Configuration - Type-safe, validated config
//!
//! Loads from `config.toml`. Every field has a default so a partial file
//! (or no file at all) still yields a runnable pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::{Error, Result};
use crate::events::DedupStrategy;

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Order creation limits
    #[serde(default)]
    pub orders: OrderConfig,

    /// Paper broker settings
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// none | id | rule | full
    #[serde(default)]
    pub deduplication_strategy: DedupStrategy,

    /// Collect dispatch counters
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Keep a bounded history of dispatched events
    #[serde(default)]
    pub replay_enabled: bool,

    /// Max events retained for replay (oldest evicted)
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    /// Max concurrently active orders per symbol
    #[serde(default = "default_max_orders_per_symbol")]
    pub max_orders_per_symbol: usize,

    /// Enable the per-symbol cap
    #[serde(default = "default_true")]
    pub enforce_single_position: bool,

    /// Quantity used by the fixed sizer
    #[serde(default = "default_quantity")]
    pub default_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Flat commission charged per fill
    #[serde(default)]
    pub commission: Decimal,
}

fn default_true() -> bool {
    true
}
fn default_replay_capacity() -> usize {
    1000
}
fn default_max_orders_per_symbol() -> usize {
    1
}
fn default_quantity() -> Decimal {
    Decimal::from(100)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            deduplication_strategy: DedupStrategy::default(),
            metrics_enabled: true,
            replay_enabled: false,
            replay_capacity: default_replay_capacity(),
        }
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            max_orders_per_symbol: default_max_orders_per_symbol(),
            enforce_single_position: true,
            default_quantity: default_quantity(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            commission: Decimal::ZERO,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replay_enabled && self.replay_capacity == 0 {
            return Err(Error::Config(
                "replay_capacity must be > 0 when replay is enabled".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("Loaded config from {}", path);
                    return cfg;
                }
                Err(e) => tracing::debug!("Skipping {}: {}", path, e),
            }
        }

        tracing::warn!("No usable config.toml found, using defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        if self.orders.max_orders_per_symbol == 0 {
            return Err(Error::Config("max_orders_per_symbol must be >= 1".into()));
        }
        if self.orders.default_quantity <= Decimal::ZERO {
            return Err(Error::Config("default_quantity must be positive".into()));
        }
        if self.broker.commission < Decimal::ZERO {
            return Err(Error::Config("commission must not be negative".into()));
        }
        Ok(())
    }
}
