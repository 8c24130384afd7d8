//! Stock domain service: load → mutate → version-gated commit → publish.
//!
//! Every mutation runs as a cycle:
//!
//! 1. optional in-process per-product lock (fast path, avoids wasted retries)
//! 2. load the ledger under the admission limiter and the caller's deadline
//! 3. apply the ledger method in memory
//! 4. commit ledger + new entry through the repository's conditional write,
//!    again under limiter and deadline
//!
//! `VersionConflict` and `AdmissionTimeout` rerun the whole cycle per the
//! [`RetryPolicy`]. Events are published after the commit; a failed publish is
//! logged and never rolls the change back.

use std::collections::HashMap;
use std::future::Future;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use stockledger_concurrency::{
    retry_on_conflict, AdmissionLimiter, Interrupted, KeyedMutexRegistry, OpContext, RetryPolicy,
};
use stockledger_core::{AggregateRoot, DomainError, DomainResult, ExpectedVersion, LedgerId};
use stockledger_events::{EventEnvelope, EventPublisher};
use stockledger_inventory::{StockEvent, StockLedger, StockOperation, StockStatus, AGGREGATE_TYPE};

use crate::config::ServiceConfig;
use crate::repository::{Page, Pagination, StockLedgerRepository};

/// Input for [`StockDomainService::create_ledger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedger {
    pub product_id: String,
    pub sku: String,
    pub initial_quantity: i64,
    pub low_stock_threshold: i64,
    pub warehouse_id: String,
    pub shelf_location: String,
}

impl NewLedger {
    pub fn new(product_id: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            sku: sku.into(),
            initial_quantity: 0,
            low_stock_threshold: 0,
            warehouse_id: String::new(),
            shelf_location: String::new(),
        }
    }

    pub fn initial_quantity(mut self, quantity: i64) -> Self {
        self.initial_quantity = quantity;
        self
    }

    pub fn low_stock_threshold(mut self, threshold: i64) -> Self {
        self.low_stock_threshold = threshold;
        self
    }

    pub fn warehouse(mut self, warehouse_id: impl Into<String>) -> Self {
        self.warehouse_id = warehouse_id.into();
        self
    }

    pub fn shelf(mut self, shelf_location: impl Into<String>) -> Self {
        self.shelf_location = shelf_location.into();
        self
    }
}

/// Published message type.
pub type StockEnvelope = EventEnvelope<StockEvent>;

/// Orchestrates ledger creation, mutation and reads.
///
/// All collaborators are passed in at construction; nothing is read from
/// process-global state.
pub struct StockDomainService<R, P> {
    repository: Arc<R>,
    publisher: P,
    limiter: AdmissionLimiter,
    locks: Option<Arc<KeyedMutexRegistry>>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl<R, P> StockDomainService<R, P>
where
    R: StockLedgerRepository,
    P: EventPublisher<StockEnvelope>,
{
    /// Service with default retry policy, keyed mutex enabled and a 5s
    /// operation timeout.
    pub fn new(repository: Arc<R>, publisher: P, limiter: AdmissionLimiter) -> Self {
        let defaults = ServiceConfig::default();
        Self {
            repository,
            publisher,
            limiter,
            locks: Some(Arc::new(KeyedMutexRegistry::new())),
            retry: defaults.retry,
            operation_timeout: defaults.operation_timeout,
        }
    }

    pub fn from_config(config: &ServiceConfig, repository: Arc<R>, publisher: P) -> Self {
        Self {
            repository,
            publisher,
            limiter: AdmissionLimiter::new(config.max_concurrent),
            locks: config
                .use_keyed_mutex
                .then(|| Arc::new(KeyedMutexRegistry::new())),
            retry: config.retry.clone(),
            operation_timeout: config.operation_timeout,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a registry (e.g. between services in one process) or pass `None`
    /// to rely on the version check alone.
    pub fn with_keyed_mutex(mut self, locks: Option<Arc<KeyedMutexRegistry>>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    // ---- writes -------------------------------------------------------

    /// Create the ledger for a product. At most one live ledger per product.
    #[instrument(skip_all, fields(product_id = %input.product_id), err)]
    pub async fn create_ledger(&self, ctx: &OpContext, input: NewLedger) -> DomainResult<StockLedger> {
        let ctx = self.scoped(ctx);
        let input = &input;
        let ledger = retry_on_conflict(&self.retry, &ctx, |attempt| {
            self.create_cycle(&ctx, input, attempt)
        })
        .await?;

        info!(ledger_id = %ledger.id_typed(), available = ledger.available_quantity(), "stock ledger created");
        self.publish(&ledger, StockEvent::for_creation(&ledger));
        Ok(ledger)
    }

    pub async fn inbound(
        &self,
        ctx: &OpContext,
        product_id: &str,
        quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "inbound", |ledger| {
            ledger.inbound(quantity, reason, operator_id)
        })
        .await
    }

    pub async fn outbound(
        &self,
        ctx: &OpContext,
        product_id: &str,
        quantity: i64,
        order_id: Option<&str>,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "outbound", |ledger| {
            ledger.outbound(quantity, order_id, reason, operator_id)
        })
        .await
    }

    pub async fn reserve(
        &self,
        ctx: &OpContext,
        product_id: &str,
        quantity: i64,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "reserve", |ledger| {
            ledger.reserve(quantity, order_id, reason)
        })
        .await
    }

    pub async fn release_reservation(
        &self,
        ctx: &OpContext,
        product_id: &str,
        quantity: i64,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "release", |ledger| {
            ledger.release_reservation(quantity, order_id, reason)
        })
        .await
    }

    pub async fn confirm_reservation(
        &self,
        ctx: &OpContext,
        product_id: &str,
        quantity: i64,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "confirm", |ledger| {
            ledger.confirm_reservation(quantity, order_id, reason)
        })
        .await
    }

    pub async fn adjust_stock(
        &self,
        ctx: &OpContext,
        product_id: &str,
        new_quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "adjust", |ledger| {
            ledger.adjust_stock(new_quantity, reason, operator_id)
        })
        .await
    }

    pub async fn lock(
        &self,
        ctx: &OpContext,
        product_id: &str,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "lock", |ledger| ledger.lock(reason, operator_id))
            .await
    }

    pub async fn unlock(
        &self,
        ctx: &OpContext,
        product_id: &str,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "unlock", |ledger| ledger.unlock(reason, operator_id))
            .await
    }

    pub async fn stock_check(
        &self,
        ctx: &OpContext,
        product_id: &str,
        actual_quantity: i64,
        reason: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "stock_check", |ledger| {
            ledger.stock_check(actual_quantity, reason, operator_id)
        })
        .await
    }

    pub async fn update_shelf_location(
        &self,
        ctx: &OpContext,
        product_id: &str,
        shelf_location: &str,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "update_shelf_location", |ledger| {
            ledger.update_shelf_location(shelf_location, operator_id)
        })
        .await
    }

    pub async fn update_low_stock_threshold(
        &self,
        ctx: &OpContext,
        product_id: &str,
        threshold: i64,
        operator_id: Option<&str>,
    ) -> DomainResult<StockLedger> {
        self.mutate(ctx, product_id, "update_low_stock_threshold", |ledger| {
            ledger.update_low_stock_threshold(threshold, operator_id)
        })
        .await
    }

    /// Soft delete. History stays queryable; the product may be stocked again.
    #[instrument(skip(self, ctx), err)]
    pub async fn delete_ledger(&self, ctx: &OpContext, product_id: &str) -> DomainResult<()> {
        let ctx = self.scoped(ctx);
        let ledger = retry_on_conflict(&self.retry, &ctx, |attempt| {
            self.delete_cycle(&ctx, product_id, attempt)
        })
        .await?;

        let at = ledger.deleted_at().unwrap_or_else(Utc::now);
        info!(ledger_id = %ledger.id_typed(), "stock ledger deleted");
        self.publish(&ledger, vec![StockEvent::for_deletion(&ledger, at)]);
        Ok(())
    }

    // ---- reads --------------------------------------------------------

    pub async fn get_ledger(&self, ctx: &OpContext, id: LedgerId) -> DomainResult<StockLedger> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "find_by_id", self.repository.find_by_id(id))
            .await?
            .ok_or_else(|| DomainError::not_found(format!("stock ledger {id}")))
    }

    pub async fn get_by_product(&self, ctx: &OpContext, product_id: &str) -> DomainResult<StockLedger> {
        let ctx = self.scoped(ctx);
        self.load(&ctx, product_id).await
    }

    pub async fn get_by_sku(&self, ctx: &OpContext, sku: &str) -> DomainResult<StockLedger> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "find_by_sku", self.repository.find_by_sku(sku))
            .await?
            .ok_or_else(|| DomainError::not_found(format!("stock ledger for sku {sku}")))
    }

    pub async fn list(&self, ctx: &OpContext, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "find_all", self.repository.find_all(pagination))
            .await
    }

    pub async fn by_warehouse(
        &self,
        ctx: &OpContext,
        warehouse_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let ctx = self.scoped(ctx);
        self.guarded(
            &ctx,
            "find_by_warehouse_id",
            self.repository.find_by_warehouse_id(warehouse_id, pagination),
        )
        .await
    }

    pub async fn by_status(
        &self,
        ctx: &OpContext,
        status: StockStatus,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "find_by_status", self.repository.find_by_status(status, pagination))
            .await
    }

    pub async fn low_stock(&self, ctx: &OpContext, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "find_low_stock", self.repository.find_low_stock(pagination))
            .await
    }

    pub async fn search(
        &self,
        ctx: &OpContext,
        keyword: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "search", self.repository.search(keyword, pagination))
            .await
    }

    pub async fn operations_for_product(
        &self,
        ctx: &OpContext,
        product_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockOperation>> {
        let ctx = self.scoped(ctx);
        self.guarded(
            &ctx,
            "find_operations_by_product_id",
            self.repository.find_operations_by_product_id(product_id, pagination),
        )
        .await
    }

    pub async fn operations_for_order(&self, ctx: &OpContext, order_id: &str) -> DomainResult<Vec<StockOperation>> {
        let ctx = self.scoped(ctx);
        self.guarded(
            &ctx,
            "find_operations_by_order_id",
            self.repository.find_operations_by_order_id(order_id),
        )
        .await
    }

    pub async fn status_counts(&self, ctx: &OpContext) -> DomainResult<HashMap<StockStatus, u64>> {
        let ctx = self.scoped(ctx);
        self.guarded(&ctx, "count_by_status", self.repository.count_by_status())
            .await
    }

    // ---- cycle --------------------------------------------------------

    #[instrument(skip(self, ctx, apply), err)]
    async fn mutate<F>(
        &self,
        ctx: &OpContext,
        product_id: &str,
        action: &'static str,
        apply: F,
    ) -> DomainResult<StockLedger>
    where
        F: Fn(&mut StockLedger) -> DomainResult<StockOperation> + Sync,
    {
        let ctx = self.scoped(ctx);
        let apply = &apply;
        let (ledger, events) = retry_on_conflict(&self.retry, &ctx, |attempt| {
            self.mutate_cycle(&ctx, product_id, attempt, apply)
        })
        .await?;

        debug!(
            version = ledger.version(),
            available = ledger.available_quantity(),
            reserved = ledger.reserved_quantity(),
            status = %ledger.status(),
            "stock ledger committed"
        );
        self.publish(&ledger, events);
        Ok(ledger)
    }

    #[instrument(level = "debug", skip(self, ctx, apply))]
    async fn mutate_cycle<F>(
        &self,
        ctx: &OpContext,
        product_id: &str,
        attempt: u32,
        apply: &F,
    ) -> DomainResult<(StockLedger, Vec<StockEvent>)>
    where
        F: Fn(&mut StockLedger) -> DomainResult<StockOperation> + Sync,
    {
        let _guard = self.lock_product(ctx, product_id).await?;

        let mut ledger = self.load(ctx, product_id).await?;
        let previous = ledger.status();
        let entry = apply(&mut ledger)?;

        let version = self
            .guarded(
                ctx,
                "commit",
                self.repository.commit(&ledger, slice::from_ref(&entry)),
            )
            .await?;
        ledger.mark_committed(version);

        let events = StockEvent::for_change(previous, &ledger, &entry);
        Ok((ledger, events))
    }

    async fn create_cycle(&self, ctx: &OpContext, input: &NewLedger, attempt: u32) -> DomainResult<StockLedger> {
        let _guard = self.lock_product(ctx, &input.product_id).await?;

        let existing = self
            .guarded(
                ctx,
                "find_by_product_id",
                self.repository.find_by_product_id(&input.product_id),
            )
            .await?;
        if existing.is_some() {
            return Err(DomainError::duplicate_product(input.product_id.clone()));
        }

        let ledger = StockLedger::new(
            input.product_id.clone(),
            input.sku.clone(),
            input.initial_quantity,
            input.low_stock_threshold,
            input.warehouse_id.clone(),
        )?
        .with_shelf_location(input.shelf_location.clone());

        debug!(attempt, ledger_id = %ledger.id_typed(), "saving new stock ledger");
        self.guarded(ctx, "save", self.repository.save(&ledger))
            .await?;
        Ok(ledger)
    }

    async fn delete_cycle(&self, ctx: &OpContext, product_id: &str, attempt: u32) -> DomainResult<StockLedger> {
        let _guard = self.lock_product(ctx, product_id).await?;

        let mut ledger = self.load(ctx, product_id).await?;
        let expected = ExpectedVersion::Exact(ledger.version());
        ledger.mark_deleted(Utc::now())?;

        debug!(attempt, ledger_id = %ledger.id_typed(), "soft deleting stock ledger");
        let version = self
            .guarded(
                ctx,
                "soft_delete",
                self.repository.soft_delete(ledger.id_typed(), expected),
            )
            .await?;
        ledger.mark_committed(version);
        Ok(ledger)
    }

    // ---- helpers ------------------------------------------------------

    /// Apply the default timeout unless the caller's deadline is earlier.
    fn scoped(&self, ctx: &OpContext) -> OpContext {
        ctx.child_with_timeout(self.operation_timeout)
    }

    async fn lock_product(&self, ctx: &OpContext, product_id: &str) -> DomainResult<Option<OwnedMutexGuard<()>>> {
        let Some(locks) = &self.locks else {
            return Ok(None);
        };
        match ctx.run(locks.lock(product_id)).await {
            Ok(guard) => Ok(Some(guard)),
            Err(why) => Err(DomainError::admission_timeout(format!(
                "waiting for product {product_id}: {why}"
            ))),
        }
    }

    async fn load(&self, ctx: &OpContext, product_id: &str) -> DomainResult<StockLedger> {
        self.guarded(
            ctx,
            "find_by_product_id",
            self.repository.find_by_product_id(product_id),
        )
        .await?
        .ok_or_else(|| DomainError::not_found(format!("stock ledger for product {product_id}")))
    }

    /// Run one repository call under an admission permit and the deadline.
    ///
    /// Admission failures surface as `AdmissionTimeout`; an interrupted call
    /// surfaces as `IoTimeout` or `Cancelled`.
    async fn guarded<T, Fut>(&self, ctx: &OpContext, operation: &'static str, call: Fut) -> DomainResult<T>
    where
        Fut: Future<Output = DomainResult<T>>,
    {
        self.limiter
            .run_with_limit(ctx, || async move {
                match ctx.run(call).await {
                    Ok(result) => result,
                    Err(Interrupted::DeadlineExceeded) => Err(DomainError::io_timeout(format!(
                        "{operation} did not complete before the deadline"
                    ))),
                    Err(Interrupted::Cancelled) => Err(DomainError::cancelled(operation)),
                }
            })
            .await
    }

    fn publish(&self, ledger: &StockLedger, events: Vec<StockEvent>) {
        for event in events {
            let envelope = EventEnvelope::wrap(ledger.id_typed(), AGGREGATE_TYPE, ledger.version(), event);
            let event_type = envelope.event_type().to_string();
            if let Err(err) = self.publisher.publish(envelope) {
                warn!(
                    ledger_id = %ledger.id_typed(),
                    event_type,
                    error = %err,
                    "event publish failed; change stays committed"
                );
            }
        }
    }
}

impl<R, P> std::fmt::Debug for StockDomainService<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockDomainService")
            .field("limiter", &self.limiter)
            .field("keyed_mutex", &self.locks.is_some())
            .field("retry", &self.retry)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}
