//! Common utilities and types shared across minishard

pub mod config;
pub mod context;
pub mod error;
pub mod utils;

pub use config::{Config, RangeDeleterConfig, ServerConfig, SplitConfig};
pub use context::{CancellationToken, OperationContext};
pub use error::{Error, Result};
pub use utils::{backoff_delay, retry_idempotent, timestamp_now_millis};
