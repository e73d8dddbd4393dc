//! In-process collaborators: a paper broker and a position ledger

pub mod broker;
pub mod portfolio;

pub use broker::{BrokerStats, PaperBroker, BROKER_PRIORITY};
pub use portfolio::{Position, PositionLedger, LEDGER_PRIORITY};
