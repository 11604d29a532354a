//! Per-operation context threaded through every blocking call
//!
//! Carries the deadline, a cancellation token and request-scoped data.
//! Blocking work is wrapped with [`OperationContext::run`], which races it
//! against both the deadline and the token.

use crate::common::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cloneable cancellation handle. Cancelling is sticky.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every operation holding this token
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once the token is cancelled, yielding the reason
    pub async fn cancelled(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self, unreachable in practice
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation context
#[derive(Debug, Clone)]
pub struct OperationContext {
    op_id: u64,
    client_id: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    txn_number: Option<u64>,
}

impl OperationContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            op_id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.into(),
            deadline: None,
            cancel: CancellationToken::new(),
            txn_number: None,
        }
    }

    /// Context for internal background work (range deleter, cache priming)
    pub fn internal(name: &str) -> Self {
        Self::new(format!("internal:{}", name))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_txn_number(mut self, txn_number: u64) -> Self {
        self.txn_number = Some(txn_number);
        self
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn txn_number(&self) -> Option<u64> {
        self.txn_number
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the operation was cancelled or ran out of time
    pub fn check_for_interrupt(&self) -> Result<()> {
        if let Some(reason) = self.cancel.reason() {
            return Err(Error::Interrupted(reason));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::ExceededTimeLimit);
            }
        }
        Ok(())
    }

    /// Run a blocking step, unwinding it on deadline or cancellation
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_for_interrupt()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            res = fut => res,
            reason = self.cancel.cancelled() => Err(Error::Interrupted(reason)),
            _ = deadline => Err(Error::ExceededTimeLimit),
        }
    }
}
