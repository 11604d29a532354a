//! Shard node: admin HTTP API and server bootstrap

pub mod http;
pub mod server;

pub use http::{create_router, NodeState};
pub use server::ShardNode;
