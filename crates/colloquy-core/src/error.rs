//! Error types for Colloquy core.

use thiserror::Error;

/// Validation failures at the system boundary.
///
/// These are rejected immediately and never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed session id: {0:?}")]
    MalformedSessionId(String),

    #[error("malformed message id: {0:?}")]
    MalformedMessageId(String),

    #[error("invalid role: {0:?} (expected user, assistant, or system)")]
    InvalidRole(String),

    #[error("message content must be text")]
    NonTextContent,
}
