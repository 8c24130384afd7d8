//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse error classification.
///
/// Transport layers map on this (e.g. to HTTP status codes) instead of matching
/// individual variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    DuplicateProduct,
    InsufficientStock,
    InvalidState,
    Locked,
    VersionConflict,
    AdmissionTimeout,
    IoTimeout,
    Cancelled,
    Storage,
}

/// Domain-level error.
///
/// Ledger methods return the most specific variant; the service layer passes
/// them through unchanged and only adds repository failures (`NotFound`,
/// `VersionConflict`, `Storage`, `IoTimeout`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (non-positive quantity, empty identifier, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A ledger or operation record does not exist (or was soft-deleted).
    #[error("not found: {0}")]
    NotFound(String),

    /// A ledger already exists for the product.
    #[error("stock ledger already exists for product {0}")]
    DuplicateProduct(String),

    /// Requested outbound/reserve quantity exceeds the available bucket.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    /// The ledger is not in a state that permits the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A mutation was attempted while the ledger is locked.
    #[error("stock ledger is locked: {0}")]
    Locked(String),

    /// Optimistic concurrency check failed.
    #[error("version conflict (expected {expected}, actual {actual:?})")]
    VersionConflict { expected: u64, actual: Option<u64> },

    /// The admission limiter could not grant a permit before the deadline.
    #[error("too many concurrent requests: {0}")]
    AdmissionTimeout(String),

    /// A persistence call did not complete before the caller's deadline.
    #[error("i/o timeout: {0}")]
    IoTimeout(String),

    /// The caller cancelled the operation while it was waiting on I/O.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Any other persistence failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate_product(product_id: impl Into<String>) -> Self {
        Self::DuplicateProduct(product_id.into())
    }

    pub fn insufficient_stock(requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            requested,
            available,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        Self::Locked(msg.into())
    }

    pub fn version_conflict(expected: u64, actual: Option<u64>) -> Self {
        Self::VersionConflict { expected, actual }
    }

    pub fn admission_timeout(msg: impl Into<String>) -> Self {
        Self::AdmissionTimeout(msg.into())
    }

    pub fn io_timeout(msg: impl Into<String>) -> Self {
        Self::IoTimeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateProduct(_) => ErrorKind::DuplicateProduct,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Locked(_) => ErrorKind::Locked,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::AdmissionTimeout(_) => ErrorKind::AdmissionTimeout,
            Self::IoTimeout(_) => ErrorKind::IoTimeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether a caller may re-run the whole load/mutate/persist cycle.
    ///
    /// Everything else is terminal for the current request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::VersionConflict | ErrorKind::AdmissionTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_and_admission_timeouts_are_retryable() {
        assert!(DomainError::version_conflict(7, Some(8)).is_retryable());
        assert!(DomainError::admission_timeout("deadline").is_retryable());

        assert!(!DomainError::io_timeout("save").is_retryable());
        assert!(!DomainError::locked("audit").is_retryable());
        assert!(!DomainError::insufficient_stock(5, 1).is_retryable());
        assert!(!DomainError::storage("disk").is_retryable());
        assert!(!DomainError::not_found("ledger").is_retryable());
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientStock).unwrap();
        assert_eq!(json, "\"insufficient_stock\"");
    }

    #[test]
    fn insufficient_stock_message_carries_quantities() {
        let err = DomainError::insufficient_stock(3, 1);
        assert_eq!(err.to_string(), "insufficient stock: requested 3, available 1");
        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    }
}
