//! Inventory domain module: the stock ledger aggregate.
//!
//! This crate contains business rules for stock accounting, implemented purely
//! as in-memory domain logic (no IO, no async, no storage). Persistence and
//! concurrency control live in `stockledger-infra`.

pub mod event;
pub mod ledger;
pub mod operation;
pub mod status;

pub use event::{
    LedgerCreated, LedgerDeleted, LedgerUpdated, LockChanged, LowStock, OutOfStock,
    QuantityChanged, StockEvent,
};
pub use ledger::{LedgerState, StockLedger};
pub use operation::{OperationType, StockOperation};
pub use status::StockStatus;

/// Aggregate type name carried by published event envelopes.
pub const AGGREGATE_TYPE: &str = "inventory.stock_ledger";
