//! Execution layer - order registry and signal-to-order management

pub mod manager;
pub mod registry;

pub use manager::{ManagerStats, OrderManager, MANAGER_FILL_PRIORITY};
pub use registry::{OrderRegistry, RegistryStats, StateChange, REGISTRY_PRIORITY};
