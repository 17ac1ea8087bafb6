//! Test fixtures: a wired store + gateway with helpers for opening
//! channels and connectors against it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use colloquy_core::{Message, MessageDraft, Role, SessionId};
use colloquy_store::{MemoryStore, Store};
use colloquy_sync::transport::memory::{duplex, MemoryChannel};
use colloquy_sync::{Channel, Connector, GatewayConfig, SyncError, SyncGateway};

/// Install a default tracing subscriber for test output. Safe to call
/// repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// An in-memory store plus a gateway over it.
pub struct TestFixture {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<SyncGateway<MemoryStore>>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(SyncGateway::new(Arc::clone(&store), config));
        Self { store, gateway }
    }

    /// Persist `count` user messages into a session, returning them in
    /// order.
    pub async fn seed_messages(&self, session_id: &SessionId, count: usize) -> Vec<Message> {
        let mut seeded = Vec::with_capacity(count);
        for i in 0..count {
            let message = self
                .store
                .append_message(session_id, MessageDraft::new(Role::User, format!("seed-{i}")))
                .await
                .expect("seeding append failed");
            seeded.push(message);
        }
        seeded
    }

    /// Open a channel bound to the session, with a serve loop already
    /// running on the gateway side. Returns the client end.
    pub fn open_channel(&self, session_id: SessionId) -> MemoryChannel {
        let (client, server) = duplex(64);
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            let _ = gateway.serve(session_id, Box::new(server)).await;
        });
        client
    }

    /// A connector that opens gateway-backed channels, optionally
    /// failing the next few attempts to exercise backoff paths.
    pub fn connector(&self, session_id: SessionId) -> GatewayConnector {
        GatewayConnector {
            gateway: Arc::clone(&self.gateway),
            session_id,
            failures_remaining: AtomicU32::new(0),
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector producing in-process channels served by a gateway.
pub struct GatewayConnector {
    gateway: Arc<SyncGateway<MemoryStore>>,
    session_id: SessionId,
    failures_remaining: AtomicU32,
}

impl GatewayConnector {
    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for GatewayConnector {
    async fn connect(&self) -> colloquy_sync::Result<Box<dyn Channel>> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Transport("injected connect failure".to_string()));
        }

        let (client, server) = duplex(64);
        let gateway = Arc::clone(&self.gateway);
        let session_id = self.session_id;
        tokio::spawn(async move {
            let _ = gateway.serve(session_id, Box::new(server)).await;
        });
        Ok(Box::new(client))
    }
}
