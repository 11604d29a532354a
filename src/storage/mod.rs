//! In-memory document storage used by the shard
//!
//! Stands in for the storage engine: collections of JSON documents, ordered
//! indexes, bounded index scans, write units of work and IS/IX/X collection
//! locks.

pub mod collection;
pub mod lock;

pub use collection::{BoundInclusion, Collection, IndexScan, IndexSpec, RecordId, ID_INDEX_NAME};
pub use lock::{AutoGetCollection, CollectionLock, LockManager, LockMode};

use crate::catalog::{ChunkRange, KeyPattern};
use crate::common::{Error, OperationContext, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Collection catalog plus lock table
#[derive(Debug, Default)]
pub struct Storage {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    locks: LockManager,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Unlocked lookup; callers that read or write documents should go
    /// through [`AutoGetCollection`] instead.
    pub fn get_collection(&self, ns: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(ns).cloned()
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn create_collection(&self, ctx: &OperationContext, ns: &str) -> Result<Arc<Collection>> {
        let _lock = self.locks.lock(ctx, ns, LockMode::X).await?;
        let mut collections = self.collections.write();
        if collections.contains_key(ns) {
            return Err(Error::InvalidOptions(format!("collection {} already exists", ns)));
        }
        let coll = Arc::new(Collection::new(ns));
        collections.insert(ns.to_string(), coll.clone());
        tracing::info!(ns, "Created collection");
        Ok(coll)
    }

    pub async fn drop_collection(&self, ctx: &OperationContext, ns: &str) -> Result<bool> {
        let lock = self.locks.lock(ctx, ns, LockMode::X).await?;
        let dropped = self.collections.write().remove(ns).is_some();
        drop(lock);
        if dropped {
            self.locks.release_unused(ns);
            tracing::info!(ns, "Dropped collection");
        }
        Ok(dropped)
    }

    pub async fn create_index(
        &self,
        ctx: &OperationContext,
        ns: &str,
        spec: IndexSpec,
    ) -> Result<()> {
        let auto = AutoGetCollection::acquire(ctx, self, ns, LockMode::X).await?;
        let coll = auto
            .collection()
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        coll.create_index(spec)
    }

    /// Insert a document, creating the collection implicitly.
    ///
    /// Every indexed field, `_id` included, must hold a null, number,
    /// string or boolean; arrays and embedded objects are rejected with
    /// `InvalidOptions`.
    pub async fn insert(&self, ctx: &OperationContext, ns: &str, doc: Value) -> Result<RecordId> {
        if self.get_collection(ns).is_none() {
            match self.create_collection(ctx, ns).await {
                Ok(_) | Err(Error::InvalidOptions(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let auto = AutoGetCollection::acquire(ctx, self, ns, LockMode::IX).await?;
        let coll = auto
            .collection()
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        coll.insert(doc)
    }

    /// Number of documents whose shard key falls in `range`
    pub async fn count_in_range(
        &self,
        ctx: &OperationContext,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<u64> {
        let auto = AutoGetCollection::acquire(ctx, self, ns, LockMode::IS).await?;
        let Some(coll) = auto.collection() else {
            return Ok(0);
        };
        let index = coll.find_shard_key_index(key_pattern).ok_or_else(|| {
            Error::Storage(format!("no index on {} for shard key {}", ns, key_pattern))
        })?;

        let len = index.fields.len();
        let mut scan = coll.open_index_scan(
            &index.name,
            range.min().extend_with_min(len),
            range.max().extend_with_min(len),
            BoundInclusion::IncludeStartKeyOnly,
        )?;

        let mut count = 0;
        while scan.next_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

/// Buffered deletes applied atomically on commit; dropped uncommitted
/// units roll back.
#[derive(Debug)]
pub struct WriteUnitOfWork {
    collection: Arc<Collection>,
    deletes: Vec<RecordId>,
    committed: bool,
}

impl WriteUnitOfWork {
    pub fn new(collection: Arc<Collection>) -> Self {
        Self {
            collection,
            deletes: Vec::new(),
            committed: false,
        }
    }

    pub fn delete(&mut self, rid: RecordId) {
        self.deletes.push(rid);
    }

    pub fn len(&self) -> usize {
        self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
    }

    /// Apply buffered deletes; returns how many documents were removed
    pub fn commit(mut self) -> usize {
        self.committed = true;
        let deletes = std::mem::take(&mut self.deletes);
        deletes
            .into_iter()
            .filter(|rid| self.collection.delete(*rid).is_some())
            .count()
    }
}

impl Drop for WriteUnitOfWork {
    fn drop(&mut self) {
        if !self.committed && !self.deletes.is_empty() {
            tracing::debug!(
                ns = self.collection.ns(),
                pending = self.deletes.len(),
                "Rolled back write unit of work"
            );
        }
    }
}
