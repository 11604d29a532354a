//! Config service interface and the in-process authoritative chunk catalog
//!
//! Shards talk to the config service only through [`ConfigClient`]. The
//! [`ConfigServer`] implementation keeps the authoritative chunk placement
//! in memory and applies split and migration commits atomically.

use crate::catalog::chunk::{ChunkRange, ChunkType, ChunkVersion, Epoch};
use crate::catalog::key::{KeyPattern, ShardKey};
use crate::common::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    PrimaryOnly,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    Majority,
    Local,
}

/// Routing information for one collection, restricted to one shard's chunks
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub ns: String,
    pub key_pattern: KeyPattern,
    pub epoch: Epoch,
    /// Highest version across all chunks of the collection, cluster-wide
    pub collection_version: ChunkVersion,
    /// Chunks owned by the requested shard
    pub chunks: Vec<ChunkType>,
}

/// `_configsvrCommitChunkSplit`
#[derive(Debug, Clone)]
pub struct CommitSplitRequest {
    pub ns: String,
    pub shard: String,
    pub epoch: Epoch,
    pub range: ChunkRange,
    pub split_keys: Vec<ShardKey>,
    pub write_concern: WriteConcern,
}

/// `_configsvrCommitChunkMigration`
#[derive(Debug, Clone)]
pub struct CommitMigrationRequest {
    pub ns: String,
    pub epoch: Epoch,
    pub range: ChunkRange,
    pub from_shard: String,
    pub to_shard: String,
    pub write_concern: WriteConcern,
}

/// Client side of the config (metadata) service
#[async_trait]
pub trait ConfigClient: Send + Sync {
    /// Chunks `shard` owns in `ns`; `NamespaceNotFound` when `ns` is not sharded
    async fn list_chunks(
        &self,
        ns: &str,
        shard: &str,
        read_preference: ReadPreference,
    ) -> Result<RoutingTable>;

    /// Sharded collections with at least one chunk on `shard`
    async fn list_collections(&self, shard: &str) -> Result<Vec<String>>;

    async fn commit_chunk_split(&self, request: &CommitSplitRequest) -> Result<()>;

    /// Returns the donor's shard version after the commit
    async fn commit_chunk_migration(&self, request: &CommitMigrationRequest)
        -> Result<ChunkVersion>;
}

#[derive(Debug, Clone)]
struct CollectionEntry {
    key_pattern: KeyPattern,
    epoch: Epoch,
    chunks: BTreeMap<ShardKey, ChunkType>,
}

impl CollectionEntry {
    fn collection_version(&self) -> ChunkVersion {
        self.chunks
            .values()
            .map(|c| c.version)
            .fold(ChunkVersion::new(0, 0, self.epoch), |acc, v| {
                if acc.is_older_than(&v) {
                    v
                } else {
                    acc
                }
            })
    }

    fn owned_chunk(&self, ns: &str, range: &ChunkRange, shard: &str) -> Result<&ChunkType> {
        match self.chunks.get(range.min()) {
            Some(chunk) if chunk.range == *range && chunk.shard == shard => Ok(chunk),
            _ => Err(Error::StaleConfig {
                ns: ns.to_string(),
                reason: format!("chunk {} is not owned by shard {}", range, shard),
            }),
        }
    }
}

/// In-process authoritative catalog
#[derive(Debug, Default)]
pub struct ConfigServer {
    collections: Mutex<HashMap<String, CollectionEntry>>,
}

impl ConfigServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard a collection: the key space is cut at `split_points` and every
    /// initial chunk is placed on `shard`. Returns the new epoch.
    pub fn shard_collection(
        &self,
        ns: &str,
        key_pattern: KeyPattern,
        shard: &str,
        split_points: &[ShardKey],
    ) -> Result<Epoch> {
        let mut collections = self.collections.lock();
        if collections.contains_key(ns) {
            return Err(Error::InvalidOptions(format!("{} is already sharded", ns)));
        }

        let epoch = Epoch::generate();
        let whole = ChunkRange::new(key_pattern.global_min(), key_pattern.global_max())?;
        let ranges = if split_points.is_empty() {
            vec![whole]
        } else {
            whole.split_at(split_points)?
        };

        let mut version = ChunkVersion::new(1, 0, epoch);
        let mut chunks = BTreeMap::new();
        for range in ranges {
            chunks.insert(
                range.min().clone(),
                ChunkType {
                    range,
                    version,
                    shard: shard.to_string(),
                },
            );
            version = version.inc_minor();
        }

        tracing::info!(ns, %epoch, chunks = chunks.len(), "Sharded collection");
        collections.insert(
            ns.to_string(),
            CollectionEntry {
                key_pattern,
                epoch,
                chunks,
            },
        );
        Ok(epoch)
    }

    /// Forget a collection; a later `shard_collection` starts a new epoch
    pub fn drop_collection(&self, ns: &str) -> bool {
        self.collections.lock().remove(ns).is_some()
    }

    /// Every chunk of `ns` in key order, regardless of owner
    pub fn all_chunks(&self, ns: &str) -> Vec<ChunkType> {
        self.collections
            .lock()
            .get(ns)
            .map(|entry| entry.chunks.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_epoch(ns: &str, entry: &CollectionEntry, expected: Epoch) -> Result<()> {
        if entry.epoch != expected {
            return Err(Error::StaleEpoch {
                ns: ns.to_string(),
                expected: expected.to_string(),
                actual: entry.epoch.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigClient for ConfigServer {
    async fn list_chunks(
        &self,
        ns: &str,
        shard: &str,
        _read_preference: ReadPreference,
    ) -> Result<RoutingTable> {
        let collections = self.collections.lock();
        let entry = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;

        Ok(RoutingTable {
            ns: ns.to_string(),
            key_pattern: entry.key_pattern.clone(),
            epoch: entry.epoch,
            collection_version: entry.collection_version(),
            chunks: entry
                .chunks
                .values()
                .filter(|c| c.shard == shard)
                .cloned()
                .collect(),
        })
    }

    async fn list_collections(&self, shard: &str) -> Result<Vec<String>> {
        let collections = self.collections.lock();
        let mut names: Vec<String> = collections
            .iter()
            .filter(|(_, entry)| entry.chunks.values().any(|c| c.shard == shard))
            .map(|(ns, _)| ns.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn commit_chunk_split(&self, request: &CommitSplitRequest) -> Result<()> {
        let mut collections = self.collections.lock();
        let ns = request.ns.as_str();
        let entry = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;

        Self::check_epoch(ns, entry, request.epoch)?;
        entry.owned_chunk(ns, &request.range, &request.shard)?;
        let ranges = request.range.split_at(&request.split_keys)?;

        let mut version = entry.collection_version();
        for range in ranges {
            version = version.inc_minor();
            entry.chunks.insert(
                range.min().clone(),
                ChunkType {
                    range,
                    version,
                    shard: request.shard.clone(),
                },
            );
        }

        tracing::info!(
            ns,
            range = %request.range,
            splits = request.split_keys.len(),
            version = %version,
            "Committed chunk split"
        );
        Ok(())
    }

    async fn commit_chunk_migration(
        &self,
        request: &CommitMigrationRequest,
    ) -> Result<ChunkVersion> {
        let mut collections = self.collections.lock();
        let ns = request.ns.as_str();
        let entry = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;

        Self::check_epoch(ns, entry, request.epoch)?;
        if request.from_shard == request.to_shard {
            return Err(Error::InvalidOptions(format!(
                "cannot migrate {} to its current owner {}",
                request.range, request.to_shard
            )));
        }
        entry.owned_chunk(ns, &request.range, &request.from_shard)?;

        let migrated_version = entry.collection_version().inc_major();
        if let Some(chunk) = entry.chunks.get_mut(request.range.min()) {
            chunk.shard = request.to_shard.clone();
            chunk.version = migrated_version;
        }

        // The donor's remaining chunk with the lowest key carries the bumped
        // version so the donor's shard version moves too.
        let mut donor_version = ChunkVersion::new(0, 0, entry.epoch);
        if let Some(control) = entry
            .chunks
            .values_mut()
            .find(|c| c.shard == request.from_shard)
        {
            control.version = migrated_version.inc_minor();
            donor_version = control.version;
        }

        tracing::info!(
            ns,
            range = %request.range,
            from = %request.from_shard,
            to = %request.to_shard,
            version = %migrated_version,
            "Committed chunk migration"
        );
        Ok(donor_version)
    }
}
