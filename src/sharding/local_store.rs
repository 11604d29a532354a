//! Shard-local durable metadata using RocksDB
//!
//! Stores:
//! - Shard identity (shard name, cluster id, config server address)
//! - Pending range deletions, keyed by task id so iteration order is
//!   enqueue order

use crate::common::{Error, Result};
use crate::sharding::range_deleter::RangeDeletionTask;
use rocksdb::{ColumnFamily, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

const CF_IDENTITY: &str = "identity";
const CF_RANGE_DELETIONS: &str = "range_deletions";

const IDENTITY_KEY: &[u8] = b"shardIdentity";

/// Identity of this shard within the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIdentity {
    pub shard_name: String,
    pub cluster_id: Uuid,
    /// Config service connection string
    pub config_server: String,
}

/// Local metadata store
pub struct LocalMetadataStore {
    db: DB,
}

impl LocalMetadataStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_IDENTITY, CF_RANGE_DELETIONS])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    // === Identity ===

    pub fn put_identity(&self, identity: &ShardIdentity) -> Result<()> {
        let cf = self.cf(CF_IDENTITY)?;
        let value = bincode::serialize(identity)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(cf, IDENTITY_KEY, value)?;
        Ok(())
    }

    pub fn get_identity(&self) -> Result<Option<ShardIdentity>> {
        let cf = self.cf(CF_IDENTITY)?;
        match self.db.get_cf(cf, IDENTITY_KEY)? {
            Some(bytes) => {
                let identity: ShardIdentity = bincode::deserialize(&bytes)
                    .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    // === Range deletions ===

    /// Persist a pending range deletion
    pub fn put_range_deletion(&self, task: &RangeDeletionTask) -> Result<()> {
        let cf = self.cf(CF_RANGE_DELETIONS)?;
        let value = bincode::serialize(task)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(cf, task.id.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn delete_range_deletion(&self, task_id: u64) -> Result<()> {
        let cf = self.cf(CF_RANGE_DELETIONS)?;
        self.db.delete_cf(cf, task_id.to_be_bytes())?;
        Ok(())
    }

    /// All pending range deletions in enqueue order
    pub fn list_range_deletions(&self) -> Result<Vec<RangeDeletionTask>> {
        let cf = self.cf(CF_RANGE_DELETIONS)?;
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut tasks = Vec::new();
        for item in iter {
            let (_, value_bytes) = item?;
            let task: RangeDeletionTask = bincode::deserialize(&value_bytes)
                .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
            tasks.push(task);
        }

        Ok(tasks)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMetadataStore")
            .field("path", &self.db.path())
            .finish()
    }
}
