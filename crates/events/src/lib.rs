//! Domain events and their publication seam.
//!
//! - [`Event`]: metadata every domain event exposes
//! - [`EventEnvelope`]: ledger-scoped wrapper handed to publishers
//! - [`EventPublisher`]: transport-agnostic, best-effort publish
//! - [`InMemoryEventBus`]: fan-out publisher for tests/dev

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventPublisher, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
