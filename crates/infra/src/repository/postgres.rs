//! Postgres-backed ledger repository.
//!
//! ## Conditional write
//!
//! Every update is
//! `UPDATE stock_ledgers SET ..., version = version + 1 WHERE id = $1 AND version = $2 AND deleted_at IS NULL`.
//! When no row matches, a follow-up read decides between `NotFound` (row gone
//! or soft-deleted) and `VersionConflict` (another writer committed first).
//! `commit` runs the update and the entry inserts in one transaction; dropping
//! the transaction on an early return rolls it back.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | DomainError |
//! |------------|------|-------------|
//! | unique violation on `product_id` during `save` | `23505` | `DuplicateProduct` |
//! | pool acquire timed out | n/a | `IoTimeout` |
//! | row not found | n/a | `NotFound` |
//! | anything else | any | `Storage` |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;

use stockledger_core::{
    AggregateRoot, DomainError, DomainResult, ExpectedVersion, LedgerId, OperationId,
};
use stockledger_inventory::{LedgerState, StockLedger, StockOperation, StockStatus};

use super::query::{Page, Pagination};
use super::r#trait::StockLedgerRepository;

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledgers.sql");

/// First statement of a single-ledger read transaction.
const SNAPSHOT_READ: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY";

const LEDGER_COLUMNS: &str = "id, product_id, sku, warehouse_id, shelf_location, \
    available_quantity, reserved_quantity, low_stock_threshold, locked, \
    last_stock_check_at, created_at, updated_at, deleted_at, version";

const OPERATION_COLUMNS: &str = "id, ledger_id, product_id, op_type, quantity, before_stock, \
    after_stock, reason, related_order_id, operator_id, created_at";

/// Postgres-backed ledger repository.
///
/// `Send + Sync`; all statements go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresStockLedgerRepository {
    pool: Arc<PgPool>,
}

impl PostgresStockLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> DomainResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> DomainResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn find_one(&self, operation: &'static str, condition: &str, arg: &str) -> DomainResult<Option<StockLedger>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers \
             WHERE deleted_at IS NULL AND {condition} \
             ORDER BY created_at DESC LIMIT 1"
        );
        // State and history must come from one snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query(SNAPSHOT_READ)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let row = sqlx::query(&sql)
            .bind(arg)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state = ledger_state_from_row(&row)?;
        let history = load_history(&mut tx, state.id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(StockLedger::restore(state, history)))
    }

    /// Count + page over live ledgers. `condition` may reference `$1` when
    /// `arg` is given.
    async fn fetch_page(
        &self,
        operation: &'static str,
        condition: &str,
        arg: Option<String>,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        let count_sql =
            format!("SELECT COUNT(*) AS total FROM stock_ledgers WHERE deleted_at IS NULL AND {condition}");
        let mut count = sqlx::query(&count_sql);
        if let Some(arg) = &arg {
            count = count.bind(arg.as_str());
        }
        let total: i64 = count
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .try_get("total")
            .map_err(decode_error)?;

        let (limit_param, offset_param) = if arg.is_some() { (2, 3) } else { (1, 2) };
        let page_sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers \
             WHERE deleted_at IS NULL AND {condition} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${limit_param} OFFSET ${offset_param}"
        );
        let mut query = sqlx::query(&page_sql);
        if let Some(arg) = &arg {
            query = query.bind(arg.as_str());
        }
        let rows = query
            .bind(pagination.limit() as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let items = rows
            .iter()
            .map(|row| ledger_state_from_row(row).map(|s| StockLedger::restore(s, Vec::new())))
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(Page::new(items, total as u64, pagination))
    }
}

#[async_trait::async_trait]
impl StockLedgerRepository for PostgresStockLedgerRepository {
    #[instrument(skip(self, ledger), fields(ledger_id = %ledger.id_typed(), product_id = %ledger.product_id()), err)]
    async fn save(&self, ledger: &StockLedger) -> DomainResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(&format!(
            "INSERT INTO stock_ledgers ({LEDGER_COLUMNS}, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(ledger.id_typed().as_uuid())
        .bind(ledger.product_id())
        .bind(ledger.sku())
        .bind(ledger.warehouse_id())
        .bind(ledger.shelf_location())
        .bind(ledger.available_quantity())
        .bind(ledger.reserved_quantity())
        .bind(ledger.low_stock_threshold())
        .bind(ledger.is_locked())
        .bind(ledger.last_stock_check_at())
        .bind(ledger.created_at())
        .bind(ledger.updated_at())
        .bind(ledger.deleted_at())
        .bind(ledger.version() as i64)
        .bind(ledger.status().as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DomainError::duplicate_product(ledger.product_id())
            } else {
                map_sqlx_error("insert_ledger", e)
            }
        })?;

        for entry in ledger.operations() {
            insert_operation(&mut tx, entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(ledger_id = %id), err)]
    async fn find_by_id(&self, id: LedgerId) -> DomainResult<Option<StockLedger>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query(SNAPSHOT_READ)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state = ledger_state_from_row(&row)?;
        let history = load_history(&mut tx, id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(StockLedger::restore(state, history)))
    }

    #[instrument(skip(self), err)]
    async fn find_by_product_id(&self, product_id: &str) -> DomainResult<Option<StockLedger>> {
        self.find_one("find_by_product_id", "product_id = $1", product_id).await
    }

    #[instrument(skip(self), err)]
    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<StockLedger>> {
        self.find_one("find_by_sku", "sku = $1", sku).await
    }

    async fn find_by_warehouse_id(
        &self,
        warehouse_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        self.fetch_page(
            "find_by_warehouse_id",
            "warehouse_id = $1",
            Some(warehouse_id.to_string()),
            pagination,
        )
        .await
    }

    async fn find_by_status(
        &self,
        status: StockStatus,
        pagination: Pagination,
    ) -> DomainResult<Page<StockLedger>> {
        self.fetch_page(
            "find_by_status",
            "status = $1",
            Some(status.as_str().to_string()),
            pagination,
        )
        .await
    }

    async fn find_low_stock(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        self.fetch_page(
            "find_low_stock",
            "available_quantity <= low_stock_threshold",
            None,
            pagination,
        )
        .await
    }

    async fn find_all(&self, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        self.fetch_page("find_all", "TRUE", None, pagination).await
    }

    async fn search(&self, keyword: &str, pagination: Pagination) -> DomainResult<Page<StockLedger>> {
        self.fetch_page(
            "search",
            "(product_id ILIKE $1 OR sku ILIKE $1 OR shelf_location ILIKE $1)",
            Some(format!("%{}%", escape_like(keyword))),
            pagination,
        )
        .await
    }

    #[instrument(skip(self, ledger), fields(ledger_id = %ledger.id_typed(), expected = ledger.version()), err)]
    async fn update(&self, ledger: &StockLedger) -> DomainResult<u64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        conditional_update(&mut conn, ledger).await
    }

    #[instrument(skip(self), fields(ledger_id = %id), err)]
    async fn soft_delete(&self, id: LedgerId, expected: ExpectedVersion) -> DomainResult<u64> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("soft_delete", e))?;

        let row = sqlx::query(
            r#"
            UPDATE stock_ledgers
            SET deleted_at = NOW(), updated_at = NOW(), version = version + 1
            WHERE id = $1 AND deleted_at IS NULL AND ($2::BIGINT IS NULL OR version = $2)
            RETURNING version
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("soft_delete", e))?;

        match row {
            Some(row) => read_version(&row),
            None => Err(explain_missed_write(&mut conn, id, expected_version.unwrap_or(0) as u64).await),
        }
    }

    async fn save_operation(&self, entry: &StockOperation) -> DomainResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("save_operation", e))?;
        insert_operation(&mut conn, entry).await
    }

    async fn find_operations_by_product_id(
        &self,
        product_id: &str,
        pagination: Pagination,
    ) -> DomainResult<Page<StockOperation>> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM stock_operations WHERE product_id = $1")
            .bind(product_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_operations", e))?
            .try_get("total")
            .map_err(decode_error)?;

        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM stock_operations \
             WHERE product_id = $1 ORDER BY seq DESC LIMIT $2 OFFSET $3"
        ))
        .bind(product_id)
        .bind(pagination.limit() as i64)
        .bind(pagination.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_operations_by_product_id", e))?;

        let items = rows
            .iter()
            .map(operation_from_row)
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(Page::new(items, total as u64, pagination))
    }

    async fn find_operations_by_order_id(&self, order_id: &str) -> DomainResult<Vec<StockOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM stock_operations \
             WHERE related_order_id = $1 ORDER BY seq ASC"
        ))
        .bind(order_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_operations_by_order_id", e))?;

        rows.iter().map(operation_from_row).collect()
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<StockStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM stock_ledgers WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            counts.insert(status.parse::<StockStatus>()?, total as u64);
        }
        Ok(counts)
    }

    #[instrument(
        skip(self, ledger, new_entries),
        fields(ledger_id = %ledger.id_typed(), expected = ledger.version(), entries = new_entries.len()),
        err
    )]
    async fn commit(&self, ledger: &StockLedger, new_entries: &[StockOperation]) -> DomainResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let version = conditional_update(&mut tx, ledger).await?;
        for entry in new_entries {
            insert_operation(&mut tx, entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(version)
    }
}

async fn conditional_update(conn: &mut PgConnection, ledger: &StockLedger) -> DomainResult<u64> {
    let expected = ledger.version();
    let row = sqlx::query(
        r#"
        UPDATE stock_ledgers
        SET sku = $3,
            warehouse_id = $4,
            shelf_location = $5,
            available_quantity = $6,
            reserved_quantity = $7,
            low_stock_threshold = $8,
            locked = $9,
            status = $10,
            last_stock_check_at = $11,
            updated_at = $12,
            deleted_at = $13,
            version = version + 1
        WHERE id = $1 AND version = $2 AND deleted_at IS NULL
        RETURNING version
        "#,
    )
    .bind(ledger.id_typed().as_uuid())
    .bind(expected as i64)
    .bind(ledger.sku())
    .bind(ledger.warehouse_id())
    .bind(ledger.shelf_location())
    .bind(ledger.available_quantity())
    .bind(ledger.reserved_quantity())
    .bind(ledger.low_stock_threshold())
    .bind(ledger.is_locked())
    .bind(ledger.status().as_str())
    .bind(ledger.last_stock_check_at())
    .bind(ledger.updated_at())
    .bind(ledger.deleted_at())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_ledger", e))?;

    match row {
        Some(row) => read_version(&row),
        None => Err(explain_missed_write(conn, ledger.id_typed(), expected).await),
    }
}

/// A conditional write matched no row: the ledger is gone or moved on.
async fn explain_missed_write(conn: &mut PgConnection, id: LedgerId, expected: u64) -> DomainError {
    let current = sqlx::query("SELECT version FROM stock_ledgers WHERE id = $1 AND deleted_at IS NULL")
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await;

    match current {
        Ok(None) => DomainError::not_found(format!("stock ledger {id}")),
        Ok(Some(row)) => match read_version(&row) {
            Ok(actual) => DomainError::version_conflict(expected, Some(actual)),
            Err(err) => err,
        },
        Err(e) => map_sqlx_error("read_version", e),
    }
}

async fn insert_operation(conn: &mut PgConnection, entry: &StockOperation) -> DomainResult<()> {
    sqlx::query(&format!(
        "INSERT INTO stock_operations ({OPERATION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
    ))
    .bind(entry.id.as_uuid())
    .bind(entry.ledger_id.as_uuid())
    .bind(&entry.product_id)
    .bind(entry.op_type.as_str())
    .bind(entry.quantity)
    .bind(entry.before_stock)
    .bind(entry.after_stock)
    .bind(&entry.reason)
    .bind(entry.related_order_id.as_deref())
    .bind(entry.operator_id.as_deref())
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_operation", e))?;
    Ok(())
}

async fn load_history(conn: &mut PgConnection, ledger_id: LedgerId) -> DomainResult<Vec<StockOperation>> {
    let rows = sqlx::query(&format!(
        "SELECT {OPERATION_COLUMNS} FROM stock_operations WHERE ledger_id = $1 ORDER BY seq ASC"
    ))
    .bind(ledger_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_history", e))?;

    rows.iter().map(operation_from_row).collect()
}

fn read_version(row: &PgRow) -> DomainResult<u64> {
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(version as u64)
}

fn ledger_state_from_row(row: &PgRow) -> DomainResult<LedgerState> {
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let deleted_at: Option<DateTime<Utc>> = row.try_get("deleted_at").map_err(decode_error)?;

    Ok(LedgerState {
        id: LedgerId::from_uuid(id),
        product_id: row.try_get("product_id").map_err(decode_error)?,
        sku: row.try_get("sku").map_err(decode_error)?,
        warehouse_id: row.try_get("warehouse_id").map_err(decode_error)?,
        shelf_location: row.try_get("shelf_location").map_err(decode_error)?,
        available_quantity: row.try_get("available_quantity").map_err(decode_error)?,
        reserved_quantity: row.try_get("reserved_quantity").map_err(decode_error)?,
        low_stock_threshold: row.try_get("low_stock_threshold").map_err(decode_error)?,
        locked: row.try_get("locked").map_err(decode_error)?,
        last_stock_check_at: row.try_get("last_stock_check_at").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        deleted_at,
        version: version as u64,
    })
}

fn operation_from_row(row: &PgRow) -> DomainResult<StockOperation> {
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let ledger_id: uuid::Uuid = row.try_get("ledger_id").map_err(decode_error)?;
    let op_type: String = row.try_get("op_type").map_err(decode_error)?;

    Ok(StockOperation {
        id: OperationId::from_uuid(id),
        ledger_id: LedgerId::from_uuid(ledger_id),
        product_id: row.try_get("product_id").map_err(decode_error)?,
        op_type: op_type.parse()?,
        quantity: row.try_get("quantity").map_err(decode_error)?,
        before_stock: row.try_get("before_stock").map_err(decode_error)?,
        after_stock: row.try_get("after_stock").map_err(decode_error)?,
        reason: row.try_get("reason").map_err(decode_error)?,
        related_order_id: row.try_get("related_order_id").map_err(decode_error)?,
        operator_id: row.try_get("operator_id").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

/// Escape LIKE metacharacters so keywords match literally.
fn escape_like(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn decode_error(err: sqlx::Error) -> DomainError {
    DomainError::storage(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to DomainError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            DomainError::storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolTimedOut => {
            DomainError::io_timeout(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            DomainError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => DomainError::not_found(format!("row not found in {operation}")),
        other => DomainError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::ErrorKind;

    #[test]
    fn pool_errors_map_to_distinct_kinds() {
        assert_eq!(
            map_sqlx_error("update", sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::IoTimeout
        );
        assert_eq!(
            map_sqlx_error("update", sqlx::Error::PoolClosed).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            map_sqlx_error("find", sqlx::Error::RowNotFound).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("shelf-A"), "shelf-A");
    }

    #[test]
    fn single_ledger_reads_use_one_snapshot() {
        assert!(SNAPSHOT_READ.starts_with("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"));
        assert!(SNAPSHOT_READ.ends_with("READ ONLY"));
    }

    #[test]
    fn schema_declares_the_live_product_index() {
        assert!(SCHEMA.contains("stock_ledgers_live_product_idx"));
        assert!(SCHEMA.contains("WHERE deleted_at IS NULL"));
    }
}
