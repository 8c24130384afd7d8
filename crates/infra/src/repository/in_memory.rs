use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use stockledger_concurrency::VersionedCounter;
use stockledger_core::{AggregateRoot, DomainError, DomainResult, ExpectedVersion, LedgerId};
use stockledger_inventory::{StockLedger, StockOperation, StockStatus};

use super::query::{Page, Pagination};
use super::r#trait::StockLedgerRepository;

#[derive(Debug)]
struct StoredLedger {
    ledger: StockLedger,
    version: VersionedCounter,
}

impl StoredLedger {
    fn is_live(&self) -> bool {
        !self.ledger.is_deleted()
    }
}

#[derive(Debug, Default)]
struct Tables {
    ledgers: HashMap<LedgerId, StoredLedger>,
    /// Live ledgers only.
    by_product: HashMap<String, LedgerId>,
    operations: Vec<StockOperation>,
}

impl Tables {
    fn live(&self) -> impl Iterator<Item = &StockLedger> {
        self.ledgers
            .values()
            .filter(|s| s.is_live())
            .map(|s| &s.ledger)
    }

    fn live_mut(&mut self, id: LedgerId) -> DomainResult<&mut StoredLedger> {
        self.ledgers
            .get_mut(&id)
            .filter(|s| s.is_live())
            .ok_or_else(|| DomainError::not_found(format!("stock ledger {id}")))
    }

    /// Version-gated replace; the shared write path of `update` and `commit`.
    fn apply_update(&mut self, ledger: &StockLedger) -> DomainResult<u64> {
        let stored = self.live_mut(ledger.id_typed())?;
        let version = stored.version.advance_from(ledger.version())?;

        let mut next = ledger.clone();
        next.mark_committed(version);
        let deleted = next.is_deleted();
        stored.ledger = next;

        if deleted {
            self.by_product.remove(ledger.product_id());
        }
        Ok(version)
    }

    /// Filter live ledgers, newest first, without history.
    fn page_of(&self, pagination: Pagination, mut keep: impl FnMut(&StockLedger) -> bool) -> Page<StockLedger> {
        let mut matching: Vec<&StockLedger> = self.live().filter(|l| keep(l)).collect();
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id_typed().cmp(&a.id_typed()))
        });
        let summaries = matching
            .into_iter()
            .map(|l| StockLedger::restore(l.state(), Vec::new()))
            .collect();
        Page::from_sorted(summaries, pagination)
    }
}

/// In-memory ledger repository.
///
/// Intended for tests/dev. Each stored ledger carries its own
/// [`VersionedCounter`], so the conditional write is the same compare-and-advance
/// a SQL backend performs with `WHERE version = $expected`.
#[derive(Debug, Default)]
pub struct InMemoryStockLedgerRepository {
    tables: RwLock<Tables>,
}

impl InMemoryStockLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> DomainResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| DomainError::storage("lock poisoned"))
    }

    fn write(&self) -> DomainResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| DomainError::storage("lock poisoned"))
    }
}

#[async_trait::async_trait]
impl StockLedgerRepository for InMemoryStockLedgerRepository {
    async fn save(&self, ledger: &StockLedger) -> DomainResult<()> {
        let mut tables = self.write()?;

        if tables.by_product.contains_key(ledger.product_id()) {
            return Err(DomainError::duplicate_product(ledger.product_id()));
        }
        if tables.ledgers.contains_key(&ledger.id_typed()) {
            return Err(DomainError::storage(format!(
                "stock ledger {} already stored",
                ledger.id_typed()
            )));
        }

        tables
            .by_product
            .insert(ledger.product_id().to_string(), ledger.id_typed());
        tables.operations.extend(ledger.operations().iter().cloned());
        tables.ledgers.insert(
            ledger.id_typed(),
            StoredLedger {
                ledger: ledger.clone(),
                version: VersionedCounter::starting_at(ledger.version()),
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: LedgerId) -> DomainResult<Option<StockLedger>> {
        let tables = self.read()?;
        Ok(tables
            .ledgers
            .get(&id)
            .filter(|s| s.is_live())
            .map(|s| s.ledger.clone()))
    }

    async fn find_by_product_id(&self, product_id: &str) -> DomainResult<Option<StockLedger>> {
        let tables = self.read()?;
        Ok(tables
            .by_product
            .get(product_id)
            .and_then(|id| tables.ledgers.get(id))
            .map(|s| s.ledger.clone()))
    }

    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<StockLedger>> {
        let tables = self.read()?;
        Ok(tables.live().find(|l| l.sku() == sku).cloned())
    }

    async fn find_by_warehouse_id(
        &self,
        warehouse_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let tables = self.read()?;
        Ok(tables.page_of(pagination, |l| l.warehouse_id() == warehouse_id))
    }

    async fn find_by_status(
        &self,
        status: StockStatus,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let tables = self.read()?;
        Ok(tables.page_of(pagination, |l| l.status() == status))
    }

    async fn find_low_stock(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        let tables = self.read()?;
        Ok(tables.page_of(pagination, |l| {
            l.available_quantity() <= l.low_stock_threshold()
        }))
    }

    async fn find_all(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        let tables = self.read()?;
        Ok(tables.page_of(pagination, |_| true))
    }

    async fn search(&self, keyword: &str, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        let needle = keyword.to_lowercase();
        let tables = self.read()?;
        Ok(tables.page_of(pagination, |l| {
            [l.product_id(), l.sku(), l.shelf_location()]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle))
        }))
    }

    async fn update(&self, ledger: &StockLedger) -> DomainResult<u64> {
        self.write()?.apply_update(ledger)
    }

    async fn soft_delete(&self, id: LedgerId, expected: ExpectedVersion) -> DomainResult<u64> {
        let mut tables = self.write()?;
        let stored = tables.live_mut(id)?;

        let current = stored.version.current_version();
        expected.check(current)?;
        let version = stored.version.advance_from(current)?;

        let now = Utc::now();
        let mut state = stored.ledger.state();
        state.deleted_at = Some(now);
        state.updated_at = now;
        state.version = version;
        let history = stored.ledger.operations().to_vec();
        stored.ledger = StockLedger::restore(state, history);

        let product_id = stored.ledger.product_id().to_string();
        tables.by_product.remove(&product_id);
        Ok(version)
    }

    async fn save_operation(&self, entry: &StockOperation) -> DomainResult<()> {
        self.write()?.operations.push(entry.clone());
        Ok(())
    }

    async fn find_operations_by_product_id(
        &self,
        product_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockOperation>> {
        let tables = self.read()?;
        let newest_first: Vec<StockOperation> = tables
            .operations
            .iter()
            .rev()
            .filter(|op| op.product_id == product_id)
            .cloned()
            .collect();
        Ok(Page::from_sorted(newest_first, pagination))
    }

    async fn find_operations_by_order_id(&self, order_id: &str) -> DomainResult<Vec<StockOperation>> {
        let tables = self.read()?;
        Ok(tables
            .operations
            .iter()
            .filter(|op| op.related_order_id.as_deref() == Some(order_id))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<StockStatus, u64>> {
        let tables = self.read()?;
        let mut counts = HashMap::new();
        for ledger in tables.live() {
            *counts.entry(ledger.status()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn commit(&self, ledger: &StockLedger, new_entries: &[StockOperation]) -> DomainResult<u64> {
        let mut tables = self.write()?;
        let version = tables.apply_update(ledger)?;
        tables.operations.extend(new_entries.iter().cloned());
        Ok(version)
    }
}
