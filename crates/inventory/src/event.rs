use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{LedgerId, OperationId};
use stockledger_events::Event;

use crate::ledger::StockLedger;
use crate::operation::{OperationType, StockOperation};
use crate::status::StockStatus;

/// Event: LedgerCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCreated {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub sku: String,
    pub warehouse_id: String,
    pub initial_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LedgerUpdated (snapshot of the buckets after a commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUpdated {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub sku: String,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
    pub status: StockStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QuantityChanged (one per quantity-moving ledger entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityChanged {
    pub ledger_id: LedgerId,
    pub operation_id: OperationId,
    pub product_id: String,
    pub operation_type: OperationType,
    pub old_quantity: i64,
    pub new_quantity: i64,
    pub change_quantity: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_order_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LowStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStock {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub sku: String,
    pub current_quantity: i64,
    pub low_stock_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OutOfStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfStock {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub sku: String,
    pub occurred_at: DateTime<Utc>,
}

/// Payload shared by Locked/Unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChanged {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LedgerDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDeleted {
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    LedgerCreated(LedgerCreated),
    LedgerUpdated(LedgerUpdated),
    QuantityChanged(QuantityChanged),
    LowStock(LowStock),
    OutOfStock(OutOfStock),
    Locked(LockChanged),
    Unlocked(LockChanged),
    LedgerDeleted(LedgerDeleted),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::LedgerCreated(_) => "inventory.created",
            StockEvent::LedgerUpdated(_) => "inventory.updated",
            StockEvent::QuantityChanged(_) => "inventory.quantity_changed",
            StockEvent::LowStock(_) => "inventory.low_stock",
            StockEvent::OutOfStock(_) => "inventory.out_of_stock",
            StockEvent::Locked(_) => "inventory.locked",
            StockEvent::Unlocked(_) => "inventory.unlocked",
            StockEvent::LedgerDeleted(_) => "inventory.deleted",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::LedgerCreated(e) => e.occurred_at,
            StockEvent::LedgerUpdated(e) => e.occurred_at,
            StockEvent::QuantityChanged(e) => e.occurred_at,
            StockEvent::LowStock(e) => e.occurred_at,
            StockEvent::OutOfStock(e) => e.occurred_at,
            StockEvent::Locked(e) | StockEvent::Unlocked(e) => e.occurred_at,
            StockEvent::LedgerDeleted(e) => e.occurred_at,
        }
    }
}

impl StockEvent {
    /// Events for a freshly created ledger.
    pub fn for_creation(ledger: &StockLedger) -> Vec<StockEvent> {
        let mut events = vec![StockEvent::LedgerCreated(LedgerCreated {
            ledger_id: ledger.id_typed(),
            product_id: ledger.product_id().to_string(),
            sku: ledger.sku().to_string(),
            warehouse_id: ledger.warehouse_id().to_string(),
            initial_quantity: ledger.available_quantity(),
            occurred_at: ledger.created_at(),
        })];
        events.extend(status_alert(ledger, None));
        events
    }

    /// Events for one committed ledger entry.
    ///
    /// `previous` is the status the ledger had when it was loaded. Lock
    /// transitions produce Locked/Unlocked, quantity moves produce
    /// QuantityChanged, and entering Low/OutOfStock raises an alert.
    pub fn for_change(previous: StockStatus, ledger: &StockLedger, entry: &StockOperation) -> Vec<StockEvent> {
        let mut events = Vec::new();
        let was_locked = previous == StockStatus::Locked;

        if ledger.is_locked() != was_locked {
            let payload = LockChanged {
                ledger_id: ledger.id_typed(),
                product_id: ledger.product_id().to_string(),
                reason: entry.reason.clone(),
                occurred_at: entry.created_at,
            };
            events.push(if ledger.is_locked() {
                StockEvent::Locked(payload)
            } else {
                StockEvent::Unlocked(payload)
            });
        } else if entry.changes_quantity() {
            events.push(StockEvent::QuantityChanged(QuantityChanged {
                ledger_id: ledger.id_typed(),
                operation_id: entry.id,
                product_id: entry.product_id.clone(),
                operation_type: entry.op_type,
                old_quantity: entry.before_stock,
                new_quantity: entry.after_stock,
                change_quantity: entry.quantity,
                reason: entry.reason.clone(),
                related_order_id: entry.related_order_id.clone(),
                occurred_at: entry.created_at,
            }));
        }

        events.push(StockEvent::LedgerUpdated(LedgerUpdated {
            ledger_id: ledger.id_typed(),
            product_id: ledger.product_id().to_string(),
            sku: ledger.sku().to_string(),
            available_quantity: ledger.available_quantity(),
            reserved_quantity: ledger.reserved_quantity(),
            status: ledger.status(),
            occurred_at: ledger.updated_at(),
        }));

        events.extend(status_alert(ledger, Some(previous)));
        events
    }

    pub fn for_deletion(ledger: &StockLedger, at: DateTime<Utc>) -> StockEvent {
        StockEvent::LedgerDeleted(LedgerDeleted {
            ledger_id: ledger.id_typed(),
            product_id: ledger.product_id().to_string(),
            occurred_at: at,
        })
    }
}

fn status_alert(ledger: &StockLedger, previous: Option<StockStatus>) -> Option<StockEvent> {
    let status = ledger.status();
    if previous == Some(status) {
        return None;
    }

    match status {
        StockStatus::Low => Some(StockEvent::LowStock(LowStock {
            ledger_id: ledger.id_typed(),
            product_id: ledger.product_id().to_string(),
            sku: ledger.sku().to_string(),
            current_quantity: ledger.available_quantity(),
            low_stock_threshold: ledger.low_stock_threshold(),
            occurred_at: ledger.updated_at(),
        })),
        StockStatus::OutOfStock => Some(StockEvent::OutOfStock(OutOfStock {
            ledger_id: ledger.id_typed(),
            product_id: ledger.product_id().to_string(),
            sku: ledger.sku().to_string(),
            occurred_at: ledger.updated_at(),
        })),
        StockStatus::Normal | StockStatus::Locked => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(events: &[StockEvent]) -> Vec<&'static str> {
        events.iter().map(Event::event_type).collect()
    }

    #[test]
    fn creation_emits_created_and_initial_alert() {
        let normal = StockLedger::new("p", "s", 10, 3, "w").unwrap();
        assert_eq!(types(&StockEvent::for_creation(&normal)), vec!["inventory.created"]);

        let empty = StockLedger::new("p", "s", 0, 3, "w").unwrap();
        assert_eq!(
            types(&StockEvent::for_creation(&empty)),
            vec!["inventory.created", "inventory.out_of_stock"]
        );
    }

    #[test]
    fn crossing_the_threshold_raises_low_stock_once() {
        let mut l = StockLedger::new("p", "s", 10, 3, "w").unwrap();

        let previous = l.status();
        let entry = l.outbound(7, Some("o1"), "sale", None).unwrap();
        assert_eq!(
            types(&StockEvent::for_change(previous, &l, &entry)),
            vec!["inventory.quantity_changed", "inventory.updated", "inventory.low_stock"]
        );

        let previous = l.status();
        let entry = l.outbound(1, Some("o2"), "sale", None).unwrap();
        assert_eq!(
            types(&StockEvent::for_change(previous, &l, &entry)),
            vec!["inventory.quantity_changed", "inventory.updated"]
        );
    }

    #[test]
    fn lock_transitions_map_to_lock_events() {
        let mut l = StockLedger::new("p", "s", 0, 3, "w").unwrap();

        let previous = l.status();
        let entry = l.lock("audit", None).unwrap();
        let events = StockEvent::for_change(previous, &l, &entry);
        assert_eq!(types(&events), vec!["inventory.locked", "inventory.updated"]);

        let previous = l.status();
        let entry = l.unlock("done", None).unwrap();
        let events = StockEvent::for_change(previous, &l, &entry);
        assert_eq!(
            types(&events),
            vec!["inventory.unlocked", "inventory.updated", "inventory.out_of_stock"]
        );
        match &events[0] {
            StockEvent::Unlocked(e) => assert_eq!(e.reason, "Unlock inventory: done"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn confirm_is_reported_as_quantity_change() {
        let mut l = StockLedger::new("p", "s", 10, 3, "w").unwrap();
        l.reserve(4, "o", "r").unwrap();
        let previous = l.status();
        let entry = l.confirm_reservation(4, "o", "paid").unwrap();

        let events = StockEvent::for_change(previous, &l, &entry);
        match &events[0] {
            StockEvent::QuantityChanged(e) => {
                assert_eq!(e.operation_type, OperationType::Outbound);
                assert_eq!(e.change_quantity, 4);
                assert_eq!(e.related_order_id.as_deref(), Some("o"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_variant_tag() {
        let l = StockLedger::new("p", "s", 1, 3, "w").unwrap();
        let event = StockEvent::for_deletion(&l, Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["LedgerDeleted"]["product_id"], "p");
    }
}
