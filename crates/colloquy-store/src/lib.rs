//! # Colloquy Store
//!
//! Durable conversation storage for Colloquy. Provides a trait-based
//! interface for session and message persistence with SQLite and
//! in-memory implementations.
//!
//! ## Overview
//!
//! The store module abstracts persistence behind the [`Store`] trait so
//! the gateway is storage-agnostic. The primary implementation is
//! [`SqliteStore`], with [`MemoryStore`] for tests.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`MessagePage`] / [`PageQuery`] - pagination surface
//!
//! ## Design Notes
//!
//! - **Atomic appends**: message insert and session-metadata update
//!   commit or roll back together
//! - **Monotonic timestamps**: persisted timestamps never decrease
//!   within a session
//! - **Soft delete**: sessions are deactivated, never removed

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{limits, MessagePage, PageQuery, Store};
