//! Error types for the store module.

use thiserror::Error;

use colloquy_core::ValidationError;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The storage backend is unreachable or refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Input rejected at the boundary. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this failure is a backend outage (transient from the
    /// client's perspective) rather than a rejected request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
