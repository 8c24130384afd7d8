use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{EventId, LedgerId};

use crate::event::Event;

/// Envelope for a published event.
///
/// Carries the ledger the event belongs to and the ledger version the change
/// was committed at, so consumers can order and de-duplicate deliveries
/// (publication is at-least-once).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    event_type: String,
    ledger_id: LedgerId,
    aggregate_type: String,

    /// Ledger version after the commit that produced this event.
    version: u64,

    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a domain event, taking type and timestamp from the event itself.
    pub fn wrap(ledger_id: LedgerId, aggregate_type: impl Into<String>, version: u64, payload: E) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: payload.event_type().to_string(),
            ledger_id,
            aggregate_type: aggregate_type.into(),
            version,
            occurred_at: payload.occurred_at(),
            payload,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
