//! Shard-side sharding control plane
//!
//! - `state`: initialization gate and shard identity
//! - `metadata_cache`: cached routing snapshots with coalesced refresh
//! - `range_deleter` / `driver`: orphaned range cleanup
//! - `split` / `migration`: metadata-mutating chunk commands
//! - `service`: container passed to command handlers

pub mod driver;
pub mod local_store;
pub mod metadata_cache;
pub mod migration;
pub mod range_deleter;
pub mod service;
pub mod split;
pub mod state;

pub use driver::start_range_deleter_task;
pub use local_store::{LocalMetadataStore, ShardIdentity};
pub use metadata_cache::MetadataCache;
pub use migration::{donate_chunk, MoveChunkRequest, MoveChunkResponse};
pub use range_deleter::{CollectionRangeDeleter, RangeDeleterRegistry, RangeDeletionTask};
pub use service::ShardService;
pub use split::{split_chunk, SplitChunkRequest, SplitChunkResponse, TOP_CHUNK_DOC_THRESHOLD};
pub use state::{InitState, ShardingState};
