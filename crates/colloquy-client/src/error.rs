//! Error types for the client module.

use thiserror::Error;

use colloquy_sync::SyncError;

/// Failures of the client's durable cache tier.
///
/// Quota failures are handled internally by eviction and downgrade and
/// never reach the caller of the cache API.
#[derive(Debug, Error)]
pub enum CacheStorageError {
    /// The durable tier is out of space.
    #[error("cache storage quota exceeded")]
    QuotaExceeded,

    /// A stored record could not be decoded.
    #[error("corrupt cache record: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the client stack.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Protocol or transport failure.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Cache storage could not be set up.
    #[error("cache storage error: {0}")]
    CacheStorage(#[from] CacheStorageError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
