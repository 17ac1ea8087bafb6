//! Transport abstraction for the sync protocol.
//!
//! The transport layer moves opaque text frames over a duplex channel.
//! Implementations may use WebSockets, TCP, or any other carrier; frame
//! encoding/decoding stays in the protocol layer so malformed input is a
//! protocol concern, not a transport one.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// One end of a duplex channel carrying text frames.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a frame to the peer.
    async fn send(&self, frame: String) -> Result<()>;

    /// Receive the next frame.
    ///
    /// Returns `None` when the peer has closed the channel.
    async fn recv(&self) -> Result<Option<String>>;

    /// Close this end. Idempotent.
    async fn close(&self);
}

/// Client-side factory for opening fresh channels; each reconnect
/// attempt calls `connect` once.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Channel>>;
}

/// A simple in-memory transport for testing.
///
/// Uses tokio channels to simulate a duplex connection between a client
/// and a gateway within one process.
pub mod memory {
    use super::*;

    /// Create a connected pair of channel ends.
    ///
    /// Frames sent on one end arrive on the other. Dropping or closing
    /// either end makes the peer's `recv` return `None`.
    pub fn duplex(capacity: usize) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);

        (
            MemoryChannel::new(a_tx, b_rx),
            MemoryChannel::new(b_tx, a_rx),
        )
    }

    /// In-memory channel end.
    pub struct MemoryChannel {
        tx: std::sync::Mutex<Option<mpsc::Sender<String>>>,
        rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    }

    impl MemoryChannel {
        fn new(tx: mpsc::Sender<String>, rx: mpsc::Receiver<String>) -> Self {
            Self {
                tx: std::sync::Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
            }
        }

        fn sender(&self) -> Option<mpsc::Sender<String>> {
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Channel for MemoryChannel {
        async fn send(&self, frame: String) -> Result<()> {
            let Some(tx) = self.sender() else {
                return Err(SyncError::Closed);
            };
            tx.send(frame)
                .await
                .map_err(|_| SyncError::Transport("peer disconnected".to_string()))
        }

        async fn recv(&self) -> Result<Option<String>> {
            let mut rx = self.rx.lock().await;
            Ok(rx.recv().await)
        }

        async fn close(&self) {
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            self.rx.lock().await.close();
        }
    }
}
