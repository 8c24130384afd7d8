//! Infrastructure layer: persistence backends, configuration and the stock
//! domain service that composes them with the concurrency primitives.

pub mod config;
pub mod repository;
pub mod service;

pub use config::ServiceConfig;
pub use repository::{
    open_repository, InMemoryStockLedgerRepository, Page, Pagination,
    PostgresStockLedgerRepository, SharedRepository, StockLedgerRepository,
};
pub use service::{NewLedger, StockDomainService, StockEnvelope};
