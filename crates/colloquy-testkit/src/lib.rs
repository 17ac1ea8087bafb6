//! # Colloquy Testkit
//!
//! Testing utilities for Colloquy.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a wired in-memory store + gateway, channel and
//!   connector helpers, and failure injection for reconnect paths
//! - **Generators**: proptest strategies for sessions, messages, and
//!   cached messages
//!
//! The cross-crate protocol scenarios (reconnect reconciliation, empty
//! cache bootstrap, fallback on unknown sync anchors, multi-device
//! fan-out) live in this crate's `tests/` directory, where every
//! workspace member is available.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use colloquy_core::SessionId;
//! use colloquy_testkit::fixtures::TestFixture;
//!
//! # async fn example() {
//! let fixture = TestFixture::new();
//! let session = SessionId::new();
//! let seeded = fixture.seed_messages(&session, 10).await;
//! let channel = fixture.open_channel(session);
//! # let _ = (seeded, channel);
//! # }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, GatewayConnector, TestFixture};
