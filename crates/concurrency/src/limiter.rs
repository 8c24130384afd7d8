//! Bulkhead-style admission limiter.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use stockledger_core::{DomainError, DomainResult};

use crate::context::OpContext;

/// Weighted semaphore bounding how many operations may be inside the
/// persistence layer at once.
///
/// Waiting honours the caller's [`OpContext`]; giving up surfaces as
/// `AdmissionTimeout`, which is distinct from an I/O timeout.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// A granted admission. Returned to the limiter on [`release`](Self::release) or drop.
#[derive(Debug)]
#[must_use = "dropping the permit releases it immediately"]
pub struct AdmissionPermit {
    permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn weight(&self) -> u32 {
        self.permit.num_permits() as u32
    }

    pub fn release(self) {
        drop(self.permit);
    }
}

impl AdmissionLimiter {
    /// A limiter admitting up to `max_concurrent` units of work (at least one).
    pub fn new(max_concurrent: u32) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Block until one permit is free or `ctx` is cancelled / expires.
    pub async fn acquire(&self, ctx: &OpContext) -> DomainResult<AdmissionPermit> {
        self.acquire_many(ctx, 1).await
    }

    /// Weighted acquire. A weight above capacity could never be granted and is
    /// rejected up front.
    pub async fn acquire_many(&self, ctx: &OpContext, weight: u32) -> DomainResult<AdmissionPermit> {
        if weight == 0 || weight > self.capacity {
            return Err(DomainError::validation(format!(
                "admission weight must be within 1..={} (got {weight})",
                self.capacity
            )));
        }

        let waiting = self.semaphore.clone().acquire_many_owned(weight);
        match ctx.run(waiting).await {
            Ok(Ok(permit)) => Ok(AdmissionPermit { permit }),
            Ok(Err(_closed)) => Err(DomainError::admission_timeout("admission limiter closed")),
            Err(why) => {
                warn!(
                    weight,
                    available = self.semaphore.available_permits(),
                    reason = %why,
                    "admission rejected"
                );
                Err(DomainError::admission_timeout(why.to_string()))
            }
        }
    }

    /// Acquire, run `f`, release; `f`'s result is returned unchanged.
    ///
    /// If admission fails, `f` is never invoked.
    pub async fn run_with_limit<F, Fut, T>(&self, ctx: &OpContext, f: F) -> DomainResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let permit = self.acquire(ctx).await?;
        let out = f().await;
        permit.release();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use stockledger_core::ErrorKind;

    #[tokio::test]
    async fn permits_are_returned_on_release_and_drop() {
        let limiter = AdmissionLimiter::new(2);
        let ctx = OpContext::background();

        let a = limiter.acquire(&ctx).await.unwrap();
        let b = limiter.acquire(&ctx).await.unwrap();
        assert_eq!(limiter.available_permits(), 0);

        a.release();
        assert_eq!(limiter.available_permits(), 1);
        drop(b);
        assert_eq!(limiter.available_permits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_saturated() {
        let limiter = AdmissionLimiter::new(1);
        let _held = limiter.acquire(&OpContext::background()).await.unwrap();

        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let err = limiter.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdmissionTimeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected_even_with_free_permits() {
        let limiter = AdmissionLimiter::new(4);
        let (ctx, handle) = OpContext::background().cancellable();
        handle.cancel();

        let err = limiter.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdmissionTimeout);
        assert_eq!(limiter.available_permits(), 4);
    }

    #[tokio::test]
    async fn run_with_limit_skips_fn_when_admission_fails() {
        let limiter = AdmissionLimiter::new(1);
        let _held = limiter.acquire(&OpContext::background()).await.unwrap();
        let invoked = AtomicBool::new(false);

        let ctx = OpContext::with_timeout(Duration::from_millis(10));
        let out = limiter
            .run_with_limit(&ctx, || async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(out.is_err());
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test]
    async fn run_with_limit_propagates_fn_error_and_releases() {
        let limiter = AdmissionLimiter::new(1);
        let out: DomainResult<()> = limiter
            .run_with_limit(&OpContext::background(), || async {
                Err(DomainError::storage("boom"))
            })
            .await;

        assert_eq!(out, Err(DomainError::storage("boom")));
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn oversized_weight_is_a_validation_error() {
        let limiter = AdmissionLimiter::new(3);
        let err = limiter
            .acquire_many(&OpContext::background(), 4)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let permit = limiter
            .acquire_many(&OpContext::background(), 3)
            .await
            .unwrap();
        assert_eq!(permit.weight(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_capacity() {
        let limiter = AdmissionLimiter::new(3);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let limiter = limiter.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    limiter
                        .run_with_limit(&OpContext::background(), || async {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.available_permits(), 3);
    }
}
