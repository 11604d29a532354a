//! Distributed lock manager interface and a process-local implementation
//!
//! Metadata-mutating commands (split, migration commit) serialize on a
//! per-collection lock. The returned [`DistLockHandle`] releases the lock
//! when dropped, on every exit path.

use crate::common::{Error, OperationContext, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Scoped distributed lock; released on drop
pub struct DistLockHandle {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl DistLockHandle {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DistLockHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(lock = %self.name, "Released distributed lock");
        }
    }
}

impl std::fmt::Debug for DistLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistLockHandle").field("name", &self.name).finish()
    }
}

#[async_trait]
pub trait DistLockManager: Send + Sync {
    /// Acquire `name`, waiting at most `timeout`. Fails with `LockBusy`.
    async fn lock(
        &self,
        ctx: &OperationContext,
        name: &str,
        why: &str,
        timeout: Duration,
    ) -> Result<DistLockHandle>;
}

#[derive(Debug, Default)]
struct LockTable {
    /// lock name -> reason given by the holder
    held: Mutex<HashMap<String, String>>,
    released: Notify,
}

/// Lock manager for a single process (tests, single-node deployments)
#[derive(Debug, Clone, Default)]
pub struct LocalDistLockManager {
    table: Arc<LockTable>,
}

impl LocalDistLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table.held.lock().contains_key(name)
    }

    fn try_acquire(&self, name: &str, why: &str) -> std::result::Result<DistLockHandle, String> {
        let mut held = self.table.held.lock();
        if let Some(holder) = held.get(name) {
            return Err(holder.clone());
        }
        held.insert(name.to_string(), why.to_string());

        let table = self.table.clone();
        let key = name.to_string();
        Ok(DistLockHandle::new(name, move || {
            table.held.lock().remove(&key);
            table.released.notify_waiters();
        }))
    }
}

#[async_trait]
impl DistLockManager for LocalDistLockManager {
    async fn lock(
        &self,
        ctx: &OperationContext,
        name: &str,
        why: &str,
        timeout: Duration,
    ) -> Result<DistLockHandle> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register before checking so a release in between is not missed
            let released = self.table.released.notified();

            let holder = match self.try_acquire(name, why) {
                Ok(handle) => {
                    tracing::debug!(lock = name, why, "Acquired distributed lock");
                    return Ok(handle);
                }
                Err(holder) => holder,
            };

            let waited = ctx
                .run(async {
                    Ok(tokio::time::timeout_at(deadline, released).await.is_ok())
                })
                .await?;
            if !waited {
                return Err(Error::LockBusy {
                    name: name.to_string(),
                    reason: format!(
                        "could not acquire lock for '{}' within {:?}, held for '{}'",
                        why, timeout, holder
                    ),
                });
            }
        }
    }
}
