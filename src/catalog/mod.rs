//! Cluster catalog: shard keys, chunks, routing snapshots and the
//! config-service side collaborators (authoritative catalog, distributed lock)

pub mod chunk;
pub mod config_server;
pub mod dist_lock;
pub mod key;
pub mod metadata;

pub use chunk::{validate_split_keys, ChunkRange, ChunkType, ChunkVersion, Epoch};
pub use config_server::{
    CommitMigrationRequest, CommitSplitRequest, ConfigClient, ConfigServer, ReadPreference,
    RoutingTable, WriteConcern,
};
pub use dist_lock::{DistLockHandle, DistLockManager, LocalDistLockManager};
pub use key::{KeyPattern, KeyValue, ShardKey};
pub use metadata::{CollectionMetadata, OwnedChunk};
