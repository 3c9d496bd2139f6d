//! Per-request execution context.
//!
//! A single [`RequestContext`] is created by the façade for every inbound
//! chat completion and threaded through dispatcher, agents, and provider
//! calls. It carries the request id for log correlation, the global
//! deadline, and a cancellation flag flipped when the client disconnects.
//! Every suspension point races its IO against both.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation state for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: String,
    deadline: Instant,
    cancel_rx: watch::Receiver<bool>,
}

/// Owns the cancellation flag. Dropping the guard cancels the context,
/// so a handler future dropped on client disconnect cancels downstream work.
#[derive(Debug)]
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        tenant_id: impl Into<String>,
        timeout: Duration,
    ) -> (Self, CancelGuard) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                request_id: request_id.into(),
                tenant_id: tenant_id.into(),
                deadline: Instant::now() + timeout,
                cancel_rx: rx,
            },
            CancelGuard { tx },
        )
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the global deadline, zero when past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero() || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when the client disconnects. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            // Sender dropped means the guard is gone: treat as cancelled.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A sub-deadline capped at `limit` from now, never past the global one.
    pub fn sub_deadline(&self, limit: Duration) -> Instant {
        self.deadline.min(Instant::now() + limit)
    }

    /// Races `fut` against the global deadline and cancellation.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run_until(self.deadline, fut).await
    }

    /// Races `fut` against an explicit deadline (usually a sub-deadline)
    /// and cancellation.
    pub async fn run_until<F, T>(&self, at: Instant, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::timeout("request cancelled by client")),
            _ = tokio::time::sleep_until(at) => Err(Error::timeout("request deadline exceeded")),
            out = fut => out,
        }
    }
}
