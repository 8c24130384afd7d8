use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DomainError, DomainResult, LedgerId, OperationId};

use crate::operation::{OperationType, StockOperation};
use crate::status::StockStatus;

/// Persisted scalar state of a ledger, used to rebuild it from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub id: LedgerId,
    pub product_id: String,
    pub sku: String,
    pub warehouse_id: String,
    pub shelf_location: String,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
    pub low_stock_threshold: i64,
    pub locked: bool,
    pub last_stock_check_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// Aggregate root: StockLedger.
///
/// Tracks the available and reserved buckets for one product and appends one
/// [`StockOperation`] per successful change. Invariants:
///
/// - both buckets stay non-negative
/// - reserve/release/confirm only move quantity between buckets
/// - `status` is always `StockStatus::derive(available, threshold, locked)`
/// - nothing but `unlock` succeeds while locked
///
/// Methods never touch `version`; it is advanced by the repository's
/// conditional write and written back with [`mark_committed`](Self::mark_committed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedger {
    id: LedgerId,
    product_id: String,
    sku: String,
    warehouse_id: String,
    shelf_location: String,
    available_quantity: i64,
    reserved_quantity: i64,
    low_stock_threshold: i64,
    locked: bool,
    status: StockStatus,
    last_stock_check_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    version: u64,
    operations: Vec<StockOperation>,
}

impl StockLedger {
    /// Version of a ledger that has just been created.
    pub const INITIAL_VERSION: u64 = 1;

    /// Create a ledger for `product_id`.
    ///
    /// A positive initial quantity is recorded as an inbound entry from zero.
    pub fn new(
        product_id: impl Into<String>,
        sku: impl Into<String>,
        initial_quantity: i64,
        low_stock_threshold: i64,
        warehouse_id: impl Into<String>,
    ) -> DomainResult<Self> {
        let product_id = product_id.into();
        if product_id.trim().is_empty() {
            return Err(DomainError::validation("product id cannot be empty"));
        }
        if initial_quantity < 0 {
            return Err(DomainError::validation("initial quantity cannot be negative"));
        }
        if low_stock_threshold < 0 {
            return Err(DomainError::validation("low stock threshold cannot be negative"));
        }

        let now = Utc::now();
        let mut ledger = Self {
            id: LedgerId::new(),
            product_id,
            sku: sku.into(),
            warehouse_id: warehouse_id.into(),
            shelf_location: String::new(),
            available_quantity: 0,
            reserved_quantity: 0,
            low_stock_threshold,
            locked: false,
            status: StockStatus::OutOfStock,
            last_stock_check_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: Self::INITIAL_VERSION,
            operations: Vec::new(),
        };

        if initial_quantity > 0 {
            ledger.available_quantity = initial_quantity;
            ledger.record(
                OperationType::Inbound,
                initial_quantity,
                0,
                "Initial inventory setup".to_string(),
                None,
                None,
            );
        }
        ledger.refresh_status();

        Ok(ledger)
    }

    /// Set the shelf location at creation time (no ledger entry).
    pub fn with_shelf_location(mut self, shelf_location: impl Into<String>) -> Self {
        self.shelf_location = shelf_location.into();
        self
    }

    /// Rebuild a ledger from persisted state and its ordered history.
    pub fn restore(state: LedgerState, operations: Vec<StockOperation>) -> Self {
        let status = StockStatus::derive(
            state.available_quantity,
            state.low_stock_threshold,
            state.locked,
        );
        Self {
            id: state.id,
            product_id: state.product_id,
            sku: state.sku,
            warehouse_id: state.warehouse_id,
            shelf_location: state.shelf_location,
            available_quantity: state.available_quantity,
            reserved_quantity: state.reserved_quantity,
            low_stock_threshold: state.low_stock_threshold,
            locked: state.locked,
            status,
            last_stock_check_at: state.last_stock_check_at,
            created_at: state.created_at,
            updated_at: state.updated_at,
            deleted_at: state.deleted_at,
            version: state.version,
            operations,
        }
    }

    pub fn state(&self) -> LedgerState {
        LedgerState {
            id: self.id,
            product_id: self.product_id.clone(),
            sku: self.sku.clone(),
            warehouse_id: self.warehouse_id.clone(),
            shelf_location: self.shelf_location.clone(),
            available_quantity: self.available_quantity,
            reserved_quantity: self.reserved_quantity,
            low_stock_threshold: self.low_stock_threshold,
            locked: self.locked,
            last_stock_check_at: self.last_stock_check_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn warehouse_id(&self) -> &str {
        &self.warehouse_id
    }

    pub fn shelf_location(&self) -> &str {
        &self.shelf_location
    }

    pub fn available_quantity(&self) -> i64 {
        self.available_quantity
    }

    pub fn reserved_quantity(&self) -> i64 {
        self.reserved_quantity
    }

    pub fn total_quantity(&self) -> i64 {
        self.available_quantity.saturating_add(self.reserved_quantity)
    }

    pub fn low_stock_threshold(&self) -> i64 {
        self.low_stock_threshold
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn status(&self) -> StockStatus {
        self.status
    }

    pub fn last_stock_check_at(&self) -> DateTime<Utc> {
        self.last_stock_check_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Ledger history, oldest first.
    pub fn operations(&self) -> &[StockOperation] {
        &self.operations
    }

    /// Record the version the repository committed this state at.
    pub fn mark_committed(&mut self, version: u64) {
        self.version = version;
    }

    pub fn inbound(
        &mut self,
        quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        ensure_positive(quantity, "inbound")?;
        self.ensure_mutable("inbound")?;

        let before = self.available_quantity;
        let after = checked(before.checked_add(quantity))?;
        self.ensure_total_fits(after)?;
        self.available_quantity = after;
        Ok(self.record(
            OperationType::Inbound,
            quantity,
            before,
            reason.to_string(),
            None,
            operator_id,
        ))
    }

    pub fn outbound(
        &mut self,
        quantity: i64,
        order_id: Option<&str>,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        ensure_positive(quantity, "outbound")?;
        self.ensure_mutable("outbound")?;
        self.ensure_available(quantity)?;

        let before = self.available_quantity;
        self.available_quantity -= quantity;
        Ok(self.record(
            OperationType::Outbound,
            quantity,
            before,
            reason.to_string(),
            order_id,
            operator_id,
        ))
    }

    /// Move `quantity` from available to reserved.
    pub fn reserve(&mut self, quantity: i64, order_id: &str, reason: &str) -> DomainResult<StockOperation> {
        ensure_positive(quantity, "reserve")?;
        self.ensure_mutable("reserve")?;
        self.ensure_available(quantity)?;

        let reserved = checked(self.reserved_quantity.checked_add(quantity))?;
        let before = self.available_quantity;
        self.available_quantity -= quantity;
        self.reserved_quantity = reserved;
        Ok(self.record(
            OperationType::Reserve,
            quantity,
            before,
            reason.to_string(),
            Some(order_id),
            None,
        ))
    }

    /// Move `quantity` back from reserved to available.
    pub fn release_reservation(
        &mut self,
        quantity: i64,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<StockOperation> {
        ensure_positive(quantity, "release")?;
        self.ensure_mutable("release reservation")?;
        self.ensure_reserved(quantity, "release")?;

        let available = checked(self.available_quantity.checked_add(quantity))?;
        let before = self.available_quantity;
        self.available_quantity = available;
        self.reserved_quantity -= quantity;
        Ok(self.record(
            OperationType::Release,
            quantity,
            before,
            reason.to_string(),
            Some(order_id),
            None,
        ))
    }

    /// Finalize a reservation: the reserved bucket shrinks, available is
    /// untouched (it was debited at reserve time).
    pub fn confirm_reservation(
        &mut self,
        quantity: i64,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<StockOperation> {
        ensure_positive(quantity, "confirmation")?;
        self.ensure_mutable("confirm reservation")?;
        self.ensure_reserved(quantity, "confirmation")?;

        self.reserved_quantity -= quantity;
        let before = self.available_quantity;
        Ok(self.record(
            OperationType::Outbound,
            quantity,
            before,
            format!("Confirm reservation: {reason}"),
            Some(order_id),
            None,
        ))
    }

    /// Manual correction: set the available bucket to `new_quantity`.
    pub fn adjust_stock(
        &mut self,
        new_quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        if new_quantity < 0 {
            return Err(DomainError::validation("new quantity cannot be negative"));
        }
        self.ensure_mutable("adjust stock")?;
        self.ensure_total_fits(new_quantity)?;

        let before = self.available_quantity;
        self.available_quantity = new_quantity;
        Ok(self.record(
            OperationType::Adjust,
            new_quantity - before,
            before,
            reason.to_string(),
            None,
            operator_id,
        ))
    }

    /// Reconcile available with a physically counted quantity.
    pub fn stock_check(
        &mut self,
        actual_quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        if actual_quantity < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        self.ensure_mutable("stock check")?;
        self.ensure_total_fits(actual_quantity)?;

        let before = self.available_quantity;
        self.available_quantity = actual_quantity;
        self.last_stock_check_at = Utc::now();
        Ok(self.record(
            OperationType::Adjust,
            actual_quantity - before,
            before,
            format!("Stock check: {reason}"),
            None,
            operator_id,
        ))
    }

    pub fn lock(&mut self, reason: &str, operator_id: Option<&str>) -> DomainResult<StockOperation> {
        self.ensure_live()?;
        if self.locked {
            return Err(DomainError::invalid_state("stock ledger is already locked"));
        }

        self.locked = true;
        let before = self.available_quantity;
        Ok(self.record(
            OperationType::Adjust,
            0,
            before,
            format!("Lock inventory: {reason}"),
            None,
            operator_id,
        ))
    }

    pub fn unlock(&mut self, reason: &str, operator_id: Option<&str>) -> DomainResult<StockOperation> {
        self.ensure_live()?;
        if !self.locked {
            return Err(DomainError::invalid_state("stock ledger is not locked"));
        }

        self.locked = false;
        let before = self.available_quantity;
        Ok(self.record(
            OperationType::Adjust,
            0,
            before,
            format!("Unlock inventory: {reason}"),
            None,
            operator_id,
        ))
    }

    pub fn update_shelf_location(
        &mut self,
        shelf_location: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        self.ensure_mutable("update shelf location")?;

        self.shelf_location = shelf_location.to_string();
        let before = self.available_quantity;
        Ok(self.record(
            OperationType::Adjust,
            0,
            before,
            format!("Update shelf location to: {shelf_location}"),
            None,
            operator_id,
        ))
    }

    pub fn update_low_stock_threshold(
        &mut self,
        threshold: i64,
        operator_id: Option<&str>,
    ) -> DomainResult<StockOperation> {
        if threshold < 0 {
            return Err(DomainError::validation("low stock threshold cannot be negative"));
        }
        self.ensure_mutable("update low stock threshold")?;

        self.low_stock_threshold = threshold;
        let before = self.available_quantity;
        Ok(self.record(
            OperationType::Adjust,
            0,
            before,
            format!("Update low stock threshold to: {threshold}"),
            None,
            operator_id,
        ))
    }

    /// Soft delete. History is kept; the ledger stops accepting changes.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_mutable("delete")?;
        self.deleted_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    fn ensure_live(&self) -> DomainResult<()> {
        if self.is_deleted() {
            return Err(DomainError::invalid_state(format!(
                "stock ledger for product {} is deleted",
                self.product_id
            )));
        }
        Ok(())
    }

    fn ensure_mutable(&self, action: &str) -> DomainResult<()> {
        self.ensure_live()?;
        if self.locked {
            return Err(DomainError::locked(format!(
                "cannot {action} product {}",
                self.product_id
            )));
        }
        Ok(())
    }

    fn ensure_available(&self, requested: i64) -> DomainResult<()> {
        if self.available_quantity < requested {
            return Err(DomainError::insufficient_stock(requested, self.available_quantity));
        }
        Ok(())
    }

    /// `available + reserved` must stay representable.
    fn ensure_total_fits(&self, available: i64) -> DomainResult<()> {
        checked(available.checked_add(self.reserved_quantity)).map(|_| ())
    }

    fn ensure_reserved(&self, requested: i64, what: &str) -> DomainResult<()> {
        if self.reserved_quantity < requested {
            return Err(DomainError::invalid_state(format!(
                "reserved quantity {} is less than requested {what} quantity {requested}",
                self.reserved_quantity
            )));
        }
        Ok(())
    }

    fn refresh_status(&mut self) {
        self.status = StockStatus::derive(
            self.available_quantity,
            self.low_stock_threshold,
            self.locked,
        );
    }

    fn record(
        &mut self,
        op_type: OperationType,
        quantity: i64,
        before_stock: i64,
        reason: String,
        related_order_id: Option<&str>,
        operator_id: Option<&str>,
    ) -> StockOperation {
        let now = Utc::now();
        self.updated_at = now;
        self.refresh_status();

        let entry = StockOperation {
            id: OperationId::new(),
            ledger_id: self.id,
            product_id: self.product_id.clone(),
            op_type,
            quantity,
            before_stock,
            after_stock: self.available_quantity,
            reason,
            related_order_id: non_empty(related_order_id),
            operator_id: non_empty(operator_id),
            created_at: now,
        };
        self.operations.push(entry.clone());
        entry
    }
}

impl AggregateRoot for StockLedger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn ensure_positive(quantity: i64, what: &str) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation(format!("{what} quantity must be positive")));
    }
    Ok(())
}

fn checked(value: Option<i64>) -> DomainResult<i64> {
    value.ok_or_else(|| DomainError::validation("quantity overflow"))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stockledger_core::ErrorKind;

    fn ledger(initial: i64, threshold: i64) -> StockLedger {
        StockLedger::new("prod-1", "SKU-1", initial, threshold, "wh-1").unwrap()
    }

    #[test]
    fn create_records_initial_inbound_entry() {
        let l = ledger(10, 3);
        assert_eq!(l.status(), StockStatus::Normal);
        assert_eq!(l.version(), StockLedger::INITIAL_VERSION);
        assert_eq!(l.operations().len(), 1);

        let entry = &l.operations()[0];
        assert_eq!(entry.op_type, OperationType::Inbound);
        assert_eq!(entry.quantity, 10);
        assert_eq!((entry.before_stock, entry.after_stock), (0, 10));
    }

    #[test]
    fn create_with_zero_quantity_is_out_of_stock_without_history() {
        let l = ledger(0, 3);
        assert_eq!(l.status(), StockStatus::OutOfStock);
        assert!(l.operations().is_empty());
    }

    #[test]
    fn create_validates_inputs() {
        let err = StockLedger::new("  ", "SKU", 1, 0, "wh").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = StockLedger::new("p", "SKU", -1, 0, "wh").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = StockLedger::new("p", "SKU", 1, -1, "wh").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn outbound_to_zero_then_insufficient() {
        let mut l = ledger(5, 2);
        l.outbound(5, Some("o1"), "sale", None).unwrap();
        assert_eq!(l.available_quantity(), 0);
        assert_eq!(l.status(), StockStatus::OutOfStock);

        let err = l.outbound(1, Some("o1b"), "sale", None).unwrap_err();
        assert_eq!(err, DomainError::insufficient_stock(1, 0));
        assert_eq!(l.operations().len(), 2);
    }

    #[test]
    fn reserve_then_confirm_finalizes_without_touching_available() {
        let mut l = ledger(10, 2);
        l.reserve(4, "o2", "checkout").unwrap();
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (6, 4));

        let entry = l.confirm_reservation(4, "o2", "paid").unwrap();
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (6, 0));
        assert_eq!(l.total_quantity(), 6);
        assert_eq!(entry.op_type, OperationType::Outbound);
        assert_eq!((entry.before_stock, entry.after_stock), (6, 6));
        assert_eq!(entry.reason, "Confirm reservation: paid");
        assert_eq!(entry.related_order_id.as_deref(), Some("o2"));
    }

    #[test]
    fn release_returns_reserved_quantity() {
        let mut l = ledger(10, 2);
        l.reserve(7, "o3", "checkout").unwrap();
        l.release_reservation(3, "o3", "partial cancel").unwrap();
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (6, 4));

        let err = l.release_reservation(5, "o3", "too much").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = l.confirm_reservation(5, "o3", "too much").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn total_is_capped_at_i64_max() {
        let mut l = ledger(10, 2);
        l.reserve(5, "o1", "cart").unwrap();

        let err = l.adjust_stock(i64::MAX, "miscount", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = l.stock_check(i64::MAX, "count", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (5, 5));
        assert_eq!(l.operations().len(), 2);

        // exactly at the cap is fine, and every bucket move stays in range
        l.adjust_stock(i64::MAX - 5, "recount", None).unwrap();
        assert_eq!(l.total_quantity(), i64::MAX);
        assert_eq!(l.inbound(1, "restock", None).unwrap_err().kind(), ErrorKind::Validation);

        l.reserve(i64::MAX - 5, "o2", "bulk").unwrap();
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (0, i64::MAX));
        l.release_reservation(i64::MAX, "o2", "cancel").unwrap();
        assert_eq!((l.available_quantity(), l.reserved_quantity()), (i64::MAX, 0));
        assert_eq!(l.total_quantity(), i64::MAX);
    }

    #[test]
    fn lock_blocks_every_change_until_unlock() {
        let mut l = ledger(10, 3);
        l.reserve(2, "o4", "hold").unwrap();
        l.lock("audit", Some("op-1")).unwrap();
        assert_eq!(l.status(), StockStatus::Locked);

        let kinds = [
            l.inbound(1, "r", None).unwrap_err().kind(),
            l.outbound(1, None, "r", None).unwrap_err().kind(),
            l.reserve(1, "o", "r").unwrap_err().kind(),
            l.release_reservation(1, "o4", "r").unwrap_err().kind(),
            l.confirm_reservation(1, "o4", "r").unwrap_err().kind(),
            l.adjust_stock(3, "r", None).unwrap_err().kind(),
            l.stock_check(3, "r", None).unwrap_err().kind(),
            l.update_shelf_location("A-1", None).unwrap_err().kind(),
            l.update_low_stock_threshold(1, None).unwrap_err().kind(),
            l.mark_deleted(Utc::now()).unwrap_err().kind(),
        ];
        assert!(kinds.iter().all(|k| *k == ErrorKind::Locked), "{kinds:?}");
        assert_eq!(l.operations().len(), 3);

        let err = l.lock("again", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        l.unlock("done", Some("op-1")).unwrap();
        assert_eq!(l.status(), StockStatus::Normal);
        assert_eq!(l.unlock("again", None).unwrap_err().kind(), ErrorKind::InvalidState);

        let lock_entry = &l.operations()[2];
        assert_eq!(lock_entry.op_type, OperationType::Adjust);
        assert_eq!(lock_entry.reason, "Lock inventory: audit");
        assert_eq!(lock_entry.operator_id.as_deref(), Some("op-1"));
    }

    #[test]
    fn unlock_restores_status_from_current_quantities() {
        let mut l = ledger(3, 3);
        l.lock("count", None).unwrap();
        l.unlock("count done", None).unwrap();
        assert_eq!(l.status(), StockStatus::Low);
    }

    #[test]
    fn validation_precedes_lock_check() {
        let mut l = ledger(1, 0);
        l.lock("x", None).unwrap();
        assert_eq!(l.inbound(0, "r", None).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(l.outbound(-2, None, "r", None).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(l.outbound(5, None, "r", None).unwrap_err().kind(), ErrorKind::Locked);
    }

    #[test]
    fn adjust_and_stock_check_record_signed_deltas() {
        let mut l = ledger(10, 3);
        let adj = l.adjust_stock(4, "damaged", Some("op")).unwrap();
        assert_eq!(adj.quantity, -6);
        assert_eq!(l.status(), StockStatus::Low);

        let before_check = l.last_stock_check_at();
        let check = l.stock_check(9, "cycle count", None).unwrap();
        assert_eq!(check.quantity, 5);
        assert_eq!(check.reason, "Stock check: cycle count");
        assert!(l.last_stock_check_at() >= before_check);
        assert_eq!(l.available_quantity(), 9);
    }

    #[test]
    fn threshold_update_rederives_status() {
        let mut l = ledger(5, 2);
        assert_eq!(l.status(), StockStatus::Normal);
        l.update_low_stock_threshold(5, None).unwrap();
        assert_eq!(l.status(), StockStatus::Low);
        assert_eq!(
            l.update_low_stock_threshold(-1, None).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn shelf_location_change_is_recorded() {
        let mut l = ledger(5, 2).with_shelf_location("A-1");
        let entry = l.update_shelf_location("B-7", Some("op")).unwrap();
        assert_eq!(l.shelf_location(), "B-7");
        assert_eq!(entry.quantity, 0);
        assert!(!entry.changes_quantity());
    }

    #[test]
    fn deleted_ledger_rejects_changes() {
        let mut l = ledger(5, 2);
        l.mark_deleted(Utc::now()).unwrap();
        assert!(l.is_deleted());
        assert_eq!(l.inbound(1, "r", None).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(l.lock("r", None).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(l.mark_deleted(Utc::now()).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn restore_round_trips_state() {
        let mut l = ledger(8, 2);
        l.reserve(3, "o", "r").unwrap();
        l.mark_committed(5);

        let restored = StockLedger::restore(l.state(), l.operations().to_vec());
        assert_eq!(restored, l);
    }

    #[test]
    fn empty_optional_ids_are_not_stored() {
        let mut l = ledger(8, 2);
        let entry = l.outbound(1, Some(""), "r", Some("  ")).unwrap();
        assert_eq!(entry.related_order_id, None);
        assert_eq!(entry.operator_id, None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Inbound(i64),
        Outbound(i64),
        Reserve(i64),
        Release(i64),
        Confirm(i64),
        Adjust(i64),
        StockCheck(i64),
        Lock,
        Unlock,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (-2i64..20).prop_map(Op::Inbound),
            (-2i64..20).prop_map(Op::Outbound),
            (-2i64..20).prop_map(Op::Reserve),
            (-2i64..20).prop_map(Op::Release),
            (-2i64..20).prop_map(Op::Confirm),
            (-2i64..30).prop_map(Op::Adjust),
            (-2i64..30).prop_map(Op::StockCheck),
            Just(Op::Lock),
            Just(Op::Unlock),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn random_sequences_preserve_invariants(
            initial in 0i64..50,
            threshold in 0i64..10,
            ops in proptest::collection::vec(op_strategy(), 1..40),
        ) {
            let mut l = StockLedger::new("p", "s", initial, threshold, "w").unwrap();

            for op in ops {
                let total_before = l.total_quantity();
                let entries_before = l.operations().len();
                let available_before = l.available_quantity();

                let (result, conserves_total) = match op {
                    Op::Inbound(q) => (l.inbound(q, "r", None), false),
                    Op::Outbound(q) => (l.outbound(q, None, "r", None), false),
                    Op::Reserve(q) => (l.reserve(q, "o", "r"), true),
                    Op::Release(q) => (l.release_reservation(q, "o", "r"), true),
                    Op::Confirm(q) => (l.confirm_reservation(q, "o", "r"), false),
                    Op::Adjust(q) => (l.adjust_stock(q, "r", None), false),
                    Op::StockCheck(q) => (l.stock_check(q, "r", None), false),
                    Op::Lock => (l.lock("r", None), true),
                    Op::Unlock => (l.unlock("r", None), true),
                };

                prop_assert!(l.available_quantity() >= 0);
                prop_assert!(l.reserved_quantity() >= 0);
                prop_assert_eq!(
                    l.status(),
                    StockStatus::derive(l.available_quantity(), l.low_stock_threshold(), l.is_locked())
                );

                match result {
                    Ok(entry) => {
                        prop_assert_eq!(l.operations().len(), entries_before + 1);
                        prop_assert_eq!(entry.before_stock, available_before);
                        prop_assert_eq!(entry.after_stock, l.available_quantity());
                        if conserves_total {
                            prop_assert_eq!(l.total_quantity(), total_before);
                        }
                    }
                    Err(_) => {
                        prop_assert_eq!(l.operations().len(), entries_before);
                        prop_assert_eq!(l.total_quantity(), total_before);
                    }
                }
            }
        }
    }
}
