//! Event layer - event record, deduplication, subscribers and the bus

pub mod bus;
pub mod dedup;
pub mod event;
pub mod handler;
pub mod metrics;

pub use bus::{EventBus, EventRecord};
pub use dedup::{DedupRecord, DedupStrategy, DedupTable};
pub use event::{
    CancelPayload, Event, EventType, FillPayload, OrderPayload, OrderSnapshot, Payload,
    SignalPayload, StateChangePayload,
};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerId, HandlerResult, MethodHandler};
pub use metrics::BusMetrics;
