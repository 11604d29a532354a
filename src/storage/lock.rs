//! Collection-level locks and scoped collection acquisition

use crate::common::{Error, OperationContext, Result};
use crate::storage::{Collection, Storage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Collection lock modes
///
/// Intent modes are compatible with each other and only conflict with `X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Intent shared: readers
    IS,
    /// Intent exclusive: document writers, range deletion
    IX,
    /// Exclusive: create, drop, index builds
    X,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::IS => write!(f, "IS"),
            LockMode::IX => write!(f, "IX"),
            LockMode::X => write!(f, "X"),
        }
    }
}

#[derive(Debug)]
enum LockGuard {
    Intent(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Held collection lock; released on drop
#[derive(Debug)]
pub struct CollectionLock {
    ns: String,
    mode: LockMode,
    _guard: LockGuard,
}

impl CollectionLock {
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

/// Per-namespace lock table
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn resource(&self, ns: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Remove the lock entry of `ns` unless someone holds or waits on it
    pub fn release_unused(&self, ns: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(ns) {
            Some(resource) if Arc::strong_count(resource) == 1 => {
                locks.remove(ns);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Lock `ns` in `mode`, waiting until the context deadline at most
    pub async fn lock(
        &self,
        ctx: &OperationContext,
        ns: &str,
        mode: LockMode,
    ) -> Result<CollectionLock> {
        let resource = self.resource(ns);
        let acquire = async {
            Ok(match mode {
                LockMode::IS | LockMode::IX => LockGuard::Intent(resource.read_owned().await),
                LockMode::X => LockGuard::Exclusive(resource.write_owned().await),
            })
        };

        let guard = ctx.run(acquire).await.map_err(|e| match e {
            Error::ExceededTimeLimit => Error::LockTimeout {
                ns: ns.to_string(),
                mode: mode.to_string(),
            },
            other => other,
        })?;

        Ok(CollectionLock {
            ns: ns.to_string(),
            mode,
            _guard: guard,
        })
    }
}

/// Scoped acquisition of a collection handle under a lock mode.
///
/// The collection is resolved after the lock is granted, so a concurrent
/// drop is observed as `collection() == None`.
#[derive(Debug)]
pub struct AutoGetCollection {
    lock: CollectionLock,
    collection: Option<Arc<Collection>>,
}

impl AutoGetCollection {
    pub async fn acquire(
        ctx: &OperationContext,
        storage: &Storage,
        ns: &str,
        mode: LockMode,
    ) -> Result<Self> {
        let lock = storage.lock_manager().lock(ctx, ns, mode).await?;
        let collection = storage.get_collection(ns);
        Ok(Self { lock, collection })
    }

    pub fn collection(&self) -> Option<&Arc<Collection>> {
        self.collection.as_ref()
    }

    pub fn ns(&self) -> &str {
        self.lock.ns()
    }

    pub fn mode(&self) -> LockMode {
        self.lock.mode()
    }
}
