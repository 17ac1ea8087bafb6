//! # Colloquy Sync
//!
//! Wire protocol and server gateway for Colloquy session
//! synchronization.
//!
//! ## Overview
//!
//! The sync module defines the envelope types exchanged over a duplex
//! channel, a transport abstraction with an in-memory implementation for
//! tests, and the [`SyncGateway`] serve loop that binds one channel to
//! one session and keeps the durable store authoritative.
//!
//! ## Key Properties
//!
//! - **At-least-once**: a message without a confirmation is retried by
//!   the client; the merge layer deduplicates
//! - **Fail-open parsing**: malformed frames are logged and ignored, the
//!   connection stays up
//! - **Full-reconciliation fallback**: a sync anchor the server cannot
//!   locate is answered with recent history, never an empty set
//!
//! ## Message Flow
//!
//! ```text
//! Client                                Gateway
//!   |-------- message ------------------->| persist
//!   |<------- message {id, timestamp} ----| confirm (+ fan-out to peers)
//!   |-------- sync_request {last id} ---->|
//!   |<------- sync_response {messages} ---|
//!   |-------- heartbeat ----------------->|
//!   |<------- heartbeat ------------------|
//! ```

pub mod envelope;
pub mod error;
pub mod gateway;
pub mod transport;

pub use envelope::{Envelope, MessagePayload, DEFAULT_HISTORY_LIMIT, MAX_FRAME_BYTES};
pub use error::{Result, SyncError};
pub use gateway::{ChannelReport, CloseReason, GatewayConfig, SyncGateway};
pub use transport::{memory::MemoryChannel, Channel, Connector};
