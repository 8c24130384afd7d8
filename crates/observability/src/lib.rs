//! Tracing/logging setup shared by binaries and tests.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide logging, format taken from `STOCKLEDGER_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::from_env());
}

/// Initialize process-wide logging with an explicit format.
pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}
