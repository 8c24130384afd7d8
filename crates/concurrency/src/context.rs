//! Deadline and cancellation token for externally-facing operations.

use std::future::{pending, Future};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context stopped waiting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled by caller")]
    Cancelled,
}

/// Per-call deadline + cancellation signal.
///
/// Cheap to clone; clones observe the same cancellation signal. A context with
/// neither a deadline nor a cancel handle never interrupts anything.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Sender side of a cancellable [`OpContext`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl OpContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Attach a cancellation signal to this context.
    pub fn cancellable(self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: self.deadline,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context whose deadline is the earlier of ours and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Interrupted {
        let cancelled = async {
            if let Some(rx) = &self.cancel {
                let mut rx = rx.clone();
                // A dropped handle can no longer cancel.
                let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
                if fired {
                    return;
                }
            }
            pending::<()>().await
        };
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => Interrupted::Cancelled,
            _ = expired => Interrupted::DeadlineExceeded,
        }
    }

    /// Drive `fut` to completion unless the context interrupts it first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            out = fut => Ok(out),
            why = self.done() => Err(why),
        }
    }
}
