//! Error types for minishard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Stale view Errors ===
    #[error("Stale config for {ns}: {reason}")]
    StaleConfig { ns: String, reason: String },

    #[error("Stale epoch for {ns}: expected {expected}, found {actual}")]
    StaleEpoch {
        ns: String,
        expected: String,
        actual: String,
    },

    // === Validation Errors ===
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Duplicate key in {ns}: {key}")]
    DuplicateKey { ns: String, key: String },

    #[error("Operation not supported in a transaction: {0}")]
    OperationNotSupportedInTransaction(String),

    // === Authorization / topology Errors ===
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    // === Sharding state Errors ===
    #[error("Sharding state is not yet initialized")]
    ShardingNotInitialized,

    #[error("Sharding state initialization failed: {0}")]
    ShardingInitFailed(String),

    // === Lock Errors ===
    #[error("Lock busy on {name}: {reason}")]
    LockBusy { name: String, reason: String },

    #[error("Timed out acquiring {mode} lock on {ns}")]
    LockTimeout { ns: String, mode: String },

    // === Operation context Errors ===
    #[error("Operation exceeded time limit")]
    ExceededTimeLimit,

    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Invariant violations ===
    #[error("Fatal invariant violation: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionFailed(_) | Error::NotPrimary(_))
    }

    /// Does the caller's cached routing information disagree with the config service?
    pub fn is_stale_view(&self) -> bool {
        matches!(self, Error::StaleConfig { .. } | Error::StaleEpoch { .. })
    }

    /// Stable error code exposed at the command boundary
    pub fn code(&self) -> &'static str {
        match self {
            Error::StaleConfig { .. } => "StaleConfig",
            Error::StaleEpoch { .. } => "StaleEpoch",
            Error::InvalidOptions(_) => "InvalidOptions",
            Error::NamespaceNotFound(_) => "NamespaceNotFound",
            Error::DuplicateKey { .. } => "DuplicateKey",
            Error::OperationNotSupportedInTransaction(_) => "OperationNotSupportedInTransaction",
            Error::Unauthorized(_) => "Unauthorized",
            Error::NotPrimary(_) => "NotPrimary",
            Error::ShardingNotInitialized => "ShardingStateNotInitialized",
            Error::ShardingInitFailed(_) => "ShardingStateInitFailed",
            Error::LockBusy { .. } => "LockBusy",
            Error::LockTimeout { .. } => "LockTimeout",
            Error::ExceededTimeLimit => "ExceededTimeLimit",
            Error::Interrupted(_) => "Interrupted",
            Error::ConnectionFailed(_) => "HostUnreachable",
            Error::Storage(_) | Error::Io(_) | Error::RocksDb(_) => "StorageError",
            Error::MetadataCorrupted(_) => "MetadataCorrupted",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::Fatal(_) => "Fatal",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NamespaceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidOptions(_)
            | Error::InvalidConfig(_)
            | Error::OperationNotSupportedInTransaction(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::StaleConfig { .. }
            | Error::StaleEpoch { .. }
            | Error::DuplicateKey { .. }
            | Error::LockBusy { .. } => StatusCode::CONFLICT,
            Error::ExceededTimeLimit | Error::LockTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::ShardingNotInitialized
            | Error::ShardingInitFailed(_)
            | Error::NotPrimary(_)
            | Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
