//! Concurrency-control primitives for stock mutations.
//!
//! - [`VersionedCounter`]: optimistic compare-and-advance on a monotonic version
//! - [`KeyedMutexRegistry`]: one lazily-created async mutex per key (in-process only)
//! - [`AdmissionLimiter`]: weighted semaphore bounding work sent to persistence
//! - [`OpContext`]: deadline + cancellation token carried by every external call
//! - [`RetryPolicy`] / [`retry_on_conflict`]: bounded, jittered re-runs of a whole cycle
//!
//! None of these hold state about stock; they are composed around the domain
//! service by the infrastructure layer.

pub mod context;
pub mod keyed_mutex;
pub mod limiter;
pub mod retry;
pub mod version;

pub use context::{CancelHandle, Interrupted, OpContext};
pub use keyed_mutex::KeyedMutexRegistry;
pub use limiter::{AdmissionLimiter, AdmissionPermit};
pub use retry::{retry_on_conflict, BackoffStrategy, RetryPolicy};
pub use version::VersionedCounter;
