//! Stock ledger persistence.
//!
//! The service only sees [`StockLedgerRepository`]; the in-memory backend
//! serves tests and single-process use, the Postgres backend is the durable one.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

use std::sync::Arc;

use tracing::info;

use stockledger_core::DomainResult;

use crate::config::ServiceConfig;

pub use in_memory::InMemoryStockLedgerRepository;
pub use postgres::PostgresStockLedgerRepository;
pub use query::{Page, Pagination};
pub use r#trait::StockLedgerRepository;

/// Backend chosen at composition time.
pub type SharedRepository = Arc<dyn StockLedgerRepository>;

/// Open the backend named by `config.database_url`.
///
/// A URL connects to Postgres (pool sized to the admission limit) and applies
/// the schema; no URL keeps ledgers in memory.
pub async fn open_repository(config: &ServiceConfig) -> DomainResult<SharedRepository> {
    match config.database_url.as_deref() {
        Some(url) => {
            let repository = PostgresStockLedgerRepository::connect(url, config.max_concurrent).await?;
            repository.migrate().await?;
            info!(max_connections = config.max_concurrent, "using postgres stock ledger repository");
            Ok(Arc::new(repository))
        }
        None => {
            info!("using in-memory stock ledger repository");
            Ok(Arc::new(InMemoryStockLedgerRepository::new()))
        }
    }
}
