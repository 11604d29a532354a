//! Service container handed to every sharded command handler

use crate::catalog::{ConfigClient, DistLockManager};
use crate::common::{Config, Error, OperationContext, Result};
use crate::sharding::local_store::LocalMetadataStore;
use crate::sharding::metadata_cache::MetadataCache;
use crate::sharding::range_deleter::RangeDeleterRegistry;
use crate::sharding::state::ShardingState;
use crate::storage::{RecordId, Storage};
use serde_json::Value;
use std::sync::Arc;

pub struct ShardService {
    config: Config,
    sharding: Arc<ShardingState>,
    metadata: Arc<MetadataCache>,
    range_deleters: Arc<RangeDeleterRegistry>,
    storage: Arc<Storage>,
    config_client: Arc<dyn ConfigClient>,
    dist_lock: Arc<dyn DistLockManager>,
}

impl ShardService {
    /// Wire up the shard services. With a `store`, pending range deletions
    /// are restored from and persisted to it.
    pub fn new(
        config: Config,
        sharding: Arc<ShardingState>,
        storage: Arc<Storage>,
        config_client: Arc<dyn ConfigClient>,
        dist_lock: Arc<dyn DistLockManager>,
        store: Option<Arc<LocalMetadataStore>>,
    ) -> Result<Self> {
        let metadata = Arc::new(MetadataCache::new(sharding.clone(), config_client.clone()));
        let range_deleters = Arc::new(match store {
            Some(store) => RangeDeleterRegistry::with_store(storage.clone(), metadata.clone(), store)?,
            None => RangeDeleterRegistry::new(storage.clone(), metadata.clone()),
        });

        Ok(Self {
            config,
            sharding,
            metadata,
            range_deleters,
            storage,
            config_client,
            dist_lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sharding(&self) -> &Arc<ShardingState> {
        &self.sharding
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn range_deleters(&self) -> &Arc<RangeDeleterRegistry> {
        &self.range_deleters
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config_client(&self) -> &Arc<dyn ConfigClient> {
        &self.config_client
    }

    pub fn dist_lock(&self) -> &Arc<dyn DistLockManager> {
        &self.dist_lock
    }

    /// Insert a user document after checking that this shard owns its
    /// shard key. A failed check refreshes metadata and retries once.
    pub async fn insert_document(
        &self,
        ctx: &OperationContext,
        ns: &str,
        doc: Value,
    ) -> Result<RecordId> {
        self.sharding.can_accept_sharded_commands()?;

        let mut refreshed = false;
        loop {
            let metadata = self.metadata.get_metadata(ns);
            let Some(key_pattern) = metadata.key_pattern() else {
                return self.storage.insert(ctx, ns, doc).await;
            };

            let key = key_pattern.extract(&doc)?;
            if metadata.key_belongs_to_me(&key) {
                return self.storage.insert(ctx, ns, doc).await;
            }

            if refreshed {
                return Err(Error::StaleConfig {
                    ns: ns.to_string(),
                    reason: format!(
                        "shard key {} is not owned at shard version {}",
                        key,
                        metadata.shard_version()
                    ),
                });
            }

            tracing::debug!(ns, %key, "Shard key not owned, refreshing metadata");
            self.metadata.refresh_metadata_now(ctx, ns).await?;
            refreshed = true;
        }
    }

    /// Drop the local copy of `ns` along with its cached routing metadata.
    /// Queued range deletions are abandoned by their next step.
    pub async fn drop_collection(&self, ctx: &OperationContext, ns: &str) -> Result<bool> {
        let dropped = self.storage.drop_collection(ctx, ns).await?;
        self.metadata.forget(ns);
        Ok(dropped)
    }
}

impl std::fmt::Debug for ShardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardService")
            .field("node_id", &self.config.node_id)
            .field("state", &self.sharding.state().name())
            .finish()
    }
}
