//! signal-flow - Core Library
//! Event-driven signal → order → fill pipeline

// Public modules
pub mod core;
pub mod events;
pub mod execution;
pub mod risk;
pub mod sim;

// Re-exports
pub use core::{Config, Error, Result};
pub use events::{Event, EventBus, EventType};
pub use execution::{OrderManager, OrderRegistry};
