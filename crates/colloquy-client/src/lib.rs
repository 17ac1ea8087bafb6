//! # Colloquy Client
//!
//! The client half of Colloquy session synchronization: a bounded,
//! debounced local cache, a pure merge/reconciliation function, a
//! liveness monitor, and the connection lifecycle state machine with its
//! async driver.
//!
//! ## Overview
//!
//! A reloadable client stays coherent across page reloads, network
//! drops, and multi-device access by treating its cache as a hint and
//! the gateway as the source of truth:
//!
//! 1. [`ConnectionManager`] opens a channel and, once connected, issues
//!    exactly one reconciliation request: `sync_request` anchored at
//!    the cache's latest confirmed message, or a default-limit
//!    `history_request` when there is no anchor.
//! 2. The response runs through [`merge`] and atomically replaces the
//!    session's [`LocalCache`] contents.
//! 3. Ongoing sends become pending cache entries immediately and are
//!    confirmed when the server echoes them back durably.
//! 4. [`LivenessMonitor`] turns silent channel death into the same
//!    backoff/reconnect path as an explicit close.
//!
//! Only exhausting the reconnect budget is surfaced; every other
//! failure recovers internally.

pub mod cache;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod merge;

pub use cache::{
    CacheConfig, CacheStorage, CachedMessage, DirCacheStorage, LocalCache, MemoryCacheStorage,
    SyncState,
};
pub use connection::{
    backoff_base, backoff_delay, Action, Command, ConnectionConfig, ConnectionDriver,
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, TimerKind,
};
pub use error::{CacheStorageError, ClientError, Result};
pub use liveness::{LivenessConfig, LivenessMonitor, LivenessVerdict};
pub use merge::merge;
