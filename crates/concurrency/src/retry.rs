//! Bounded retry with backoff for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use stockledger_core::DomainResult;

use crate::context::OpContext;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy for whole load → mutate → persist cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (1 = no retries).
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay varies uniformly by ±factor.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails terminally, or the policy is exhausted.
///
/// Only retryable errors (`VersionConflict`, `AdmissionTimeout`) trigger another
/// attempt; the last error is returned unchanged. `op` receives the 1-indexed
/// attempt number. Backoff sleeps honour `ctx`.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &OpContext,
    mut op: F,
) -> DomainResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying cycle");
                if ctx.run(tokio::time::sleep(delay)).await.is_err() {
                    return Err(err);
                }
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(attempt, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
