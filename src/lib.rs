//! # minishard
//!
//! The shard side of a sharded document store:
//! - Orphaned range cleanup with bounded, re-validated deletion steps
//! - Chunk splits under a distributed lock with post-commit reconciliation
//! - Migration donor commits feeding the range deleter
//! - Cached routing metadata with coalesced refreshes
//! - A sharding state gate in front of every sharded command
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   Config service (catalog)   │
//! │  authoritative chunk owners  │
//! └───────┬──────────────────────┘
//!         │ list_chunks / commit_*
//! ┌───────▼──────────────────────────────────────┐
//! │ Shard node                                    │
//! │  ShardingState ─ MetadataCache ─ split/move   │
//! │        │               │            │         │
//! │        │         RangeDeleter ◄─────┘         │
//! │        │               │ bounded steps        │
//! │        └────────── Storage (IS/IX/X locks)    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Initialize a shard
//! ```bash
//! minishard init \
//!   --shard-name shard0000 \
//!   --config-server config/localhost:27019 \
//!   --data ./shard-data
//! ```
//!
//! ### Start it
//! ```bash
//! minishard serve \
//!   --id shard-node-1 \
//!   --bind 0.0.0.0:7000 \
//!   --data ./shard-data
//! ```
//!
//! ### Drive it over HTTP
//! ```bash
//! curl -XPOST localhost:7000/config/collections/foo.bar/shard \
//!   -d '{"key_pattern": ["_id"], "split_points": [{"_id": 100}]}'
//! curl -XPOST localhost:7000/collections/foo.bar/refresh
//! curl localhost:7000/status
//! ```

#![allow(clippy::result_large_err)]

pub mod catalog;
pub mod common;
pub mod node;
pub mod sharding;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, OperationContext, Result};
pub use node::ShardNode;
pub use sharding::ShardService;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
