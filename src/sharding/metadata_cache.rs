//! Shard metadata view: cached routing snapshots per collection
//!
//! Readers clone an `Arc<CollectionMetadata>` under a short read lock and
//! release it immediately. Refreshes of one collection are serialized and
//! coalesced: every caller takes a ticket on entry, and a refresh covers all
//! tickets issued before it started fetching. A caller whose ticket is
//! already covered returns without another round-trip, while a caller that
//! arrives after a fetch started always waits for a newer one. That keeps
//! refreshes linearizable with respect to commits on the config service.

use crate::catalog::{
    ChunkVersion, CollectionMetadata, ConfigClient, OwnedChunk, ReadPreference,
};
use crate::common::{Error, OperationContext, Result};
use crate::sharding::state::ShardingState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CacheEntry {
    snapshot: RwLock<Arc<CollectionMetadata>>,
    refresh: tokio::sync::Mutex<()>,
    /// Last ticket handed out
    requested: AtomicU64,
    /// Highest ticket whose caller is satisfied by the current snapshot
    served: AtomicU64,
}

impl CacheEntry {
    fn new(ns: &str) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CollectionMetadata::unsharded(ns))),
            refresh: tokio::sync::Mutex::new(()),
            requested: AtomicU64::new(0),
            served: AtomicU64::new(0),
        }
    }
}

pub struct MetadataCache {
    sharding: Arc<ShardingState>,
    config: Arc<dyn ConfigClient>,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    /// Round-trips to the config service, for observability and tests
    fetches: AtomicU64,
}

impl MetadataCache {
    pub fn new(sharding: Arc<ShardingState>, config: Arc<dyn ConfigClient>) -> Self {
        Self {
            sharding,
            config,
            entries: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Current snapshot; unsharded when nothing is cached for `ns`
    pub fn get_metadata(&self, ns: &str) -> Arc<CollectionMetadata> {
        match self.entries.read().get(ns) {
            Some(entry) => entry.snapshot.read().clone(),
            None => Arc::new(CollectionMetadata::unsharded(ns)),
        }
    }

    fn entry(&self, ns: &str) -> Arc<CacheEntry> {
        if let Some(entry) = self.entries.read().get(ns) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new(ns)))
            .clone()
    }

    /// Refresh `ns` from the config service and return the shard version
    pub async fn refresh_metadata_now(
        &self,
        ctx: &OperationContext,
        ns: &str,
    ) -> Result<ChunkVersion> {
        let shard = self.sharding.shard_name()?;
        let entry = self.entry(ns);
        let ticket = entry.requested.fetch_add(1, Ordering::SeqCst) + 1;

        let _guard = ctx.run(async { Ok(entry.refresh.lock().await) }).await?;

        if entry.served.load(Ordering::SeqCst) >= ticket {
            let version = entry.snapshot.read().shard_version();
            tracing::debug!(ns, %version, "Joined concurrent metadata refresh");
            return Ok(version);
        }

        let covers = entry.requested.load(Ordering::SeqCst);
        let fetched = self.fetch(ctx, ns, &shard).await?;

        let installed = {
            let mut current = entry.snapshot.write();
            let stale = current.epoch() == fetched.epoch()
                && fetched
                    .collection_version()
                    .is_older_than(&current.collection_version());
            if stale {
                tracing::warn!(
                    ns,
                    cached = %current.collection_version(),
                    fetched = %fetched.collection_version(),
                    "Ignoring refresh older than cached metadata"
                );
            } else {
                if current.epoch() != fetched.epoch() {
                    tracing::info!(
                        ns,
                        old_epoch = %current.epoch(),
                        new_epoch = %fetched.epoch(),
                        "Collection epoch changed"
                    );
                }
                *current = Arc::new(fetched);
            }
            current.clone()
        };
        entry.served.store(covers, Ordering::SeqCst);

        tracing::debug!(
            ns,
            shard_version = %installed.shard_version(),
            collection_version = %installed.collection_version(),
            chunks = installed.num_chunks(),
            "Refreshed metadata"
        );
        Ok(installed.shard_version())
    }

    async fn fetch(
        &self,
        ctx: &OperationContext,
        ns: &str,
        shard: &str,
    ) -> Result<CollectionMetadata> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let listed = ctx
            .run(self.config.list_chunks(ns, shard, ReadPreference::PrimaryOnly))
            .await;

        let table = match listed {
            Ok(table) => table,
            Err(Error::NamespaceNotFound(_)) => return Ok(CollectionMetadata::unsharded(ns)),
            Err(e) => return Err(e),
        };

        let chunks = table
            .chunks
            .into_iter()
            .map(|c| OwnedChunk {
                range: c.range,
                version: c.version,
            })
            .collect();
        CollectionMetadata::sharded(ns, table.key_pattern, table.collection_version, chunks)
    }

    /// Sharded collections the config service places on this shard
    pub async fn list_shard_collections(&self, ctx: &OperationContext) -> Result<Vec<String>> {
        let shard = self.sharding.shard_name()?;
        ctx.run(self.config.list_collections(&shard)).await
    }

    /// Drop the cached entry for `ns`
    pub fn forget(&self, ns: &str) -> bool {
        self.entries.write().remove(ns).is_some()
    }

    /// Namespaces with a cache entry
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}
