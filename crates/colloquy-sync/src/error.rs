//! Error types for the sync module.

use thiserror::Error;

use colloquy_store::StoreError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Frame could not be decoded or violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame exceeded the size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel was closed.
    #[error("channel closed")]
    Closed,

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the frame itself was at fault (logged and ignored by the
    /// gateway; the connection stays open).
    pub fn is_protocol(&self) -> bool {
        matches!(self, SyncError::Protocol(_) | SyncError::FrameTooLarge { .. })
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
