use std::collections::HashMap;
use std::sync::Arc;

use stockledger_core::{DomainResult, ExpectedVersion, LedgerId};
use stockledger_inventory::{StockLedger, StockOperation, StockStatus};

use super::query::{Page, Pagination};

/// Persistence boundary for stock ledgers and their ledger entries.
///
/// ## Write path
///
/// `update` is the conditional write every mutation goes through: it succeeds
/// only if the stored version still equals `ledger.version()`, bumps the stored
/// version by one and returns it. A mismatch is a `VersionConflict`, a missing
/// or soft-deleted row is `NotFound`. `save` rejects a second live ledger for
/// the same product with `DuplicateProduct`.
///
/// Ledger entries are append-only and written in the same unit as the update
/// through [`commit`](Self::commit).
///
/// ## Read path
///
/// Single-ledger lookups return the full history. Paged queries return ledger
/// state without history. Soft-deleted ledgers are invisible to every read.
#[async_trait::async_trait]
pub trait StockLedgerRepository: Send + Sync {
    /// Insert a new ledger together with the entries it already carries.
    async fn save(&self, ledger: &StockLedger) -> DomainResult<()>;

    async fn find_by_id(&self, id: LedgerId) -> DomainResult<Option<StockLedger>>;

    async fn find_by_product_id(&self, product_id: &str) -> DomainResult<Option<StockLedger>>;

    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<StockLedger>>;

    async fn find_by_warehouse_id(
        &self,
        warehouse_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>>;

    async fn find_by_status(
        &self,
        status: StockStatus,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>>;

    /// Ledgers whose available quantity is at or below their threshold.
    async fn find_low_stock(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>>;

    async fn find_all(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>>;

    /// Substring match over product id, SKU and shelf location, newest first.
    async fn search(&self, keyword: &str, pagination: Pagination) -> DomainResult<Page<StockLedger>>;

    /// Version-gated write. Returns the newly committed version.
    async fn update(&self, ledger: &StockLedger) -> DomainResult<u64>;

    /// Soft delete. Returns the newly committed version.
    async fn soft_delete(&self, id: LedgerId, expected: ExpectedVersion) -> DomainResult<u64>;

    async fn save_operation(&self, entry: &StockOperation) -> DomainResult<()>;

    /// Entries for a product, newest first.
    async fn find_operations_by_product_id(
        &self,
        product_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockOperation>>;

    /// Entries referencing an order, oldest first.
    async fn find_operations_by_order_id(&self, order_id: &str) -> DomainResult<Vec<StockOperation>>;

    async fn count_by_status(&self) -> DomainResult<HashMap<StockStatus, u64>>;

    /// Persist the updated ledger and its new entries as one unit.
    ///
    /// The default runs `update` then `save_operation`; entries are only
    /// written once the conditional write has succeeded. Backends with
    /// transactions should override this.
    async fn commit(&self, ledger: &StockLedger, new_entries: &[StockOperation]) -> DomainResult<u64> {
        let version = self.update(ledger).await?;
        for entry in new_entries {
            self.save_operation(entry).await?;
        }
        Ok(version)
    }
}

#[async_trait::async_trait]
impl<R> StockLedgerRepository for Arc<R>
where
    R: StockLedgerRepository + ?Sized,
{
    async fn save(&self, ledger: &StockLedger) -> DomainResult<()> {
        (**self).save(ledger).await
    }

    async fn find_by_id(&self, id: LedgerId) -> DomainResult<Option<StockLedger>> {
        (**self).find_by_id(id).await
    }

    async fn find_by_product_id(&self, product_id: &str) -> DomainResult<Option<StockLedger>> {
        (**self).find_by_product_id(product_id).await
    }

    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<StockLedger>> {
        (**self).find_by_sku(sku).await
    }

    async fn find_by_warehouse_id(
        &self,
        warehouse_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        (**self).find_by_warehouse_id(warehouse_id, pagination).await
    }

    async fn find_by_status(
        &self,
        status: StockStatus,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        (**self).find_by_status(status, pagination).await
    }

    async fn find_low_stock(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        (**self).find_low_stock(pagination).await
    }

    async fn find_all(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        (**self).find_all(pagination).await
    }

    async fn search(&self, keyword: &str, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        (**self).search(keyword, pagination).await
    }

    async fn update(&self, ledger: &StockLedger) -> DomainResult<u64> {
        (**self).update(ledger).await
    }

    async fn soft_delete(&self, id: LedgerId, expected: ExpectedVersion) -> DomainResult<u64> {
        (**self).soft_delete(id, expected).await
    }

    async fn save_operation(&self, entry: &StockOperation) -> DomainResult<()> {
        (**self).save_operation(entry).await
    }

    async fn find_operations_by_product_id(
        &self,
        product_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockOperation>> {
        (**self).find_operations_by_product_id(product_id, pagination).await
    }

    async fn find_operations_by_order_id(&self, order_id: &str) -> DomainResult<Vec<StockOperation>> {
        (**self).find_operations_by_order_id(order_id).await
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<StockStatus, u64>> {
        (**self).count_by_status().await
    }

    async fn commit(&self, ledger: &StockLedger, new_entries: &[StockOperation]) -> DomainResult<u64> {
        (**self).commit(ledger, new_entries).await
    }
}
