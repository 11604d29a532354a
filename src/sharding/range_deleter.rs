//! Range deleter: per-collection queues of orphaned ranges
//!
//! Each queue is drained one bounded step at a time by
//! [`CollectionRangeDeleter::clean_up_next_range`]. A step deletes at most
//! `max_docs` documents from the head range and pops the range once a scan
//! comes back short. Before touching any document the step re-validates the
//! range against the metadata snapshot: a range that overlaps an owned chunk
//! again, or that was orphaned in an older epoch, is dropped without deleting
//! anything. The verdict to drop is only taken on a snapshot refreshed from
//! the config service; a failed refresh leaves the range at the head.

use crate::catalog::{ChunkRange, CollectionMetadata, Epoch, KeyPattern};
use crate::common::{timestamp_now_millis, Error, OperationContext, Result};
use crate::sharding::local_store::LocalMetadataStore;
use crate::sharding::metadata_cache::MetadataCache;
use crate::storage::{AutoGetCollection, BoundInclusion, LockMode, Storage, WriteUnitOfWork};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A range of one collection awaiting physical deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub id: u64,
    pub ns: String,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    /// Epoch the range was orphaned in, when known
    pub epoch: Option<Epoch>,
    pub enqueued_at: u64,
}

/// Collaborators shared by every queue of a registry
#[derive(Debug)]
struct Shared {
    storage: Arc<Storage>,
    metadata: Arc<MetadataCache>,
    store: Option<Arc<LocalMetadataStore>>,
    next_task_id: AtomicU64,
}

/// FIFO of ranges to delete for a single collection
#[derive(Debug)]
pub struct CollectionRangeDeleter {
    ns: String,
    key_pattern: KeyPattern,
    queue: Mutex<VecDeque<RangeDeletionTask>>,
    shared: Arc<Shared>,
}

impl CollectionRangeDeleter {
    /// Standalone, non-persistent queue
    pub fn new(
        ns: impl Into<String>,
        key_pattern: KeyPattern,
        storage: Arc<Storage>,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        let shared = Arc::new(Shared {
            storage,
            metadata,
            store: None,
            next_task_id: AtomicU64::new(1),
        });
        Self::with_shared(ns.into(), key_pattern, shared)
    }

    fn with_shared(ns: String, key_pattern: KeyPattern, shared: Arc<Shared>) -> Self {
        Self {
            ns,
            key_pattern,
            queue: Mutex::new(VecDeque::new()),
            shared,
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn key_pattern(&self) -> &KeyPattern {
        &self.key_pattern
    }

    /// Append `range` to the tail. No overlap check is made.
    pub fn add(&self, range: ChunkRange) -> Result<u64> {
        self.push(self.key_pattern.clone(), range, None)
    }

    /// Append a range orphaned in `epoch`; it is dropped unexecuted once the
    /// collection moves to another epoch
    pub fn add_with_epoch(&self, range: ChunkRange, epoch: Epoch) -> Result<u64> {
        self.push(self.key_pattern.clone(), range, Some(epoch))
    }

    fn push(&self, key_pattern: KeyPattern, range: ChunkRange, epoch: Option<Epoch>) -> Result<u64> {
        if range.min().len() != key_pattern.len() {
            return Err(Error::InvalidOptions(format!(
                "range {} does not match shard key {}",
                range, key_pattern
            )));
        }

        let task = RangeDeletionTask {
            id: self.shared.next_task_id.fetch_add(1, Ordering::SeqCst),
            ns: self.ns.clone(),
            key_pattern,
            range,
            epoch,
            enqueued_at: timestamp_now_millis(),
        };
        if let Some(store) = &self.shared.store {
            store.put_range_deletion(&task)?;
        }

        tracing::info!(ns = %self.ns, range = %task.range, task_id = task.id, "Scheduled range for deletion");
        let id = task.id;
        self.queue.lock().push_back(task);
        Ok(id)
    }

    fn restore(&self, task: RangeDeletionTask) {
        self.queue.lock().push_back(task);
    }

    /// Pending tasks, head first
    pub fn pending(&self) -> Vec<RangeDeletionTask> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn front(&self) -> Option<RangeDeletionTask> {
        self.queue.lock().front().cloned()
    }

    fn pop(&self, task: &RangeDeletionTask) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if let Some(pos) = queue.iter().position(|t| t.id == task.id) {
                queue.remove(pos);
            }
        }
        if let Some(store) = &self.shared.store {
            store.delete_range_deletion(task.id)?;
        }
        Ok(())
    }

    /// Run one deletion step against the head range.
    ///
    /// Returns `false` only when the queue was empty on entry; `true` does
    /// not imply anything was deleted. `max_docs` must be positive.
    pub async fn clean_up_next_range(&self, ctx: &OperationContext, max_docs: usize) -> Result<bool> {
        if max_docs == 0 {
            return Err(Error::InvalidOptions(
                "maxDocs for range deletion must be positive".into(),
            ));
        }

        let Some(task) = self.front() else {
            return Ok(false);
        };

        let mut refreshed = false;
        let (auto, coll) = loop {
            let auto = AutoGetCollection::acquire(ctx, &self.shared.storage, &self.ns, LockMode::IX).await?;
            let Some(coll) = auto.collection().cloned() else {
                tracing::info!(ns = %self.ns, range = %task.range, "Collection no longer exists, abandoning range deletion");
                self.pop(&task)?;
                return Ok(true);
            };

            let metadata = self.shared.metadata.get_metadata(&self.ns);
            match reclaim_reason(&task, &metadata) {
                None => break (auto, coll),
                Some(reason) if refreshed => {
                    tracing::warn!(ns = %self.ns, range = %task.range, "Abandoning range deletion: {}", reason);
                    self.pop(&task)?;
                    return Ok(true);
                }
                Some(reason) => {
                    // A namespace that was never loaded reads as unsharded,
                    // so only a freshly fetched snapshot may drop the task.
                    drop(auto);
                    tracing::debug!(ns = %self.ns, range = %task.range, "Refreshing metadata before abandoning range deletion: {}", reason);
                    self.shared.metadata.refresh_metadata_now(ctx, &self.ns).await?;
                    refreshed = true;
                }
            }
        };

        let index = coll.find_shard_key_index(&task.key_pattern).ok_or_else(|| {
            Error::Storage(format!(
                "no index on {} with shard key prefix {}",
                self.ns, task.key_pattern
            ))
        })?;

        let len = index.fields.len();
        let mut scan = coll.open_index_scan(
            &index.name,
            task.range.min().extend_with_min(len),
            task.range.max().extend_with_min(len),
            BoundInclusion::IncludeStartKeyOnly,
        )?;

        let mut wuow = WriteUnitOfWork::new(coll.clone());
        while wuow.len() < max_docs {
            ctx.check_for_interrupt()?;
            match scan.next_entry()? {
                Some((_, rid)) => wuow.delete(rid),
                None => break,
            }
        }
        let scanned = wuow.len();
        let deleted = wuow.commit();
        drop(auto);

        tracing::debug!(ns = %self.ns, range = %task.range, deleted, "Deleted documents in orphaned range");

        if scanned < max_docs {
            tracing::info!(ns = %self.ns, range = %task.range, "Finished deleting orphaned range");
            self.pop(&task)?;
        }
        Ok(true)
    }
}

/// Why a task must be dropped without deleting, if it must
fn reclaim_reason(task: &RangeDeletionTask, metadata: &CollectionMetadata) -> Option<String> {
    if let Some(epoch) = task.epoch {
        if metadata.epoch() != epoch {
            return Some(format!(
                "collection epoch changed from {} to {}",
                epoch,
                metadata.epoch()
            ));
        }
    }
    if let Some(pattern) = metadata.key_pattern() {
        if *pattern != task.key_pattern {
            return Some(format!(
                "shard key changed from {} to {}",
                task.key_pattern, pattern
            ));
        }
    }
    if metadata.range_overlaps_owned(&task.range) {
        return Some(format!(
            "range {} overlaps a chunk owned at shard version {}",
            task.range,
            metadata.shard_version()
        ));
    }
    None
}

/// Range deleter queues of every collection on this shard
#[derive(Debug)]
pub struct RangeDeleterRegistry {
    shared: Arc<Shared>,
    deleters: RwLock<HashMap<String, Arc<CollectionRangeDeleter>>>,
}

impl RangeDeleterRegistry {
    pub fn new(storage: Arc<Storage>, metadata: Arc<MetadataCache>) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage,
                metadata,
                store: None,
                next_task_id: AtomicU64::new(1),
            }),
            deleters: RwLock::new(HashMap::new()),
        }
    }

    /// Persistent registry; pending tasks in `store` are restored in their
    /// original order
    pub fn with_store(
        storage: Arc<Storage>,
        metadata: Arc<MetadataCache>,
        store: Arc<LocalMetadataStore>,
    ) -> Result<Self> {
        let tasks = store.list_range_deletions()?;
        let next_task_id = tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        let registry = Self {
            shared: Arc::new(Shared {
                storage,
                metadata,
                store: Some(store),
                next_task_id: AtomicU64::new(next_task_id),
            }),
            deleters: RwLock::new(HashMap::new()),
        };

        let restored = tasks.len();
        for task in tasks {
            registry
                .get_or_create(&task.ns, &task.key_pattern)
                .restore(task);
        }
        if restored > 0 {
            tracing::info!(restored, "Restored pending range deletions");
        }
        Ok(registry)
    }

    pub fn get(&self, ns: &str) -> Option<Arc<CollectionRangeDeleter>> {
        self.deleters.read().get(ns).cloned()
    }

    pub fn get_or_create(&self, ns: &str, key_pattern: &KeyPattern) -> Arc<CollectionRangeDeleter> {
        if let Some(deleter) = self.get(ns) {
            return deleter;
        }
        self.deleters
            .write()
            .entry(ns.to_string())
            .or_insert_with(|| {
                Arc::new(CollectionRangeDeleter::with_shared(
                    ns.to_string(),
                    key_pattern.clone(),
                    self.shared.clone(),
                ))
            })
            .clone()
    }

    pub fn add(&self, ns: &str, key_pattern: &KeyPattern, range: ChunkRange) -> Result<u64> {
        self.get_or_create(ns, key_pattern)
            .push(key_pattern.clone(), range, None)
    }

    pub fn add_with_epoch(
        &self,
        ns: &str,
        key_pattern: &KeyPattern,
        range: ChunkRange,
        epoch: Epoch,
    ) -> Result<u64> {
        self.get_or_create(ns, key_pattern)
            .push(key_pattern.clone(), range, Some(epoch))
    }

    /// One deletion step on the queue of `ns`; an unknown namespace has an
    /// empty queue
    pub async fn clean_up_next_range(
        &self,
        ctx: &OperationContext,
        ns: &str,
        max_docs: usize,
    ) -> Result<bool> {
        match self.get(ns) {
            Some(deleter) => deleter.clean_up_next_range(ctx, max_docs).await,
            None if max_docs == 0 => Err(Error::InvalidOptions(
                "maxDocs for range deletion must be positive".into(),
            )),
            None => Ok(false),
        }
    }

    pub fn pending(&self, ns: &str) -> Vec<RangeDeletionTask> {
        self.get(ns).map(|d| d.pending()).unwrap_or_default()
    }

    /// Namespaces with at least one pending range, sorted
    pub fn namespaces_with_pending(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .deleters
            .read()
            .iter()
            .filter(|(_, d)| !d.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect();
        names.sort();
        names
    }

    pub fn total_pending(&self) -> usize {
        self.deleters.read().values().map(|d| d.len()).sum()
    }
}
