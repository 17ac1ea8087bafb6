//! # Colloquy Core
//!
//! Core domain types for the Colloquy session synchronization system:
//! sessions, messages, and boundary validation.
//!
//! This crate is deliberately small and dependency-light. It knows
//! nothing about storage, transports, or async; those live in
//! `colloquy-store`, `colloquy-sync`, and `colloquy-client`.

pub mod error;
pub mod message;
pub mod session;
pub mod types;

pub use error::ValidationError;
pub use message::{Message, MessageDraft, CLIENT_ID_KEY};
pub use session::{default_label, preview_of, SessionMeta, PREVIEW_MAX_CHARS};
pub use types::{MessageId, Role, SessionId};
