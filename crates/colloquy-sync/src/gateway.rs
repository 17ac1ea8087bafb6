//! Sync gateway: the server side of the session protocol.
//!
//! One serve loop per accepted channel, bound to exactly one session for
//! the channel's lifetime. Persisted messages are confirmed back on the
//! originating channel and fanned out to every other live channel bound
//! to the same session (multi-device).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use colloquy_core::{Message, SessionId};
use colloquy_store::{Store, StoreError};

use crate::envelope::{Envelope, MessagePayload, DEFAULT_HISTORY_LIMIT};
use crate::error::{Result, SyncError};
use crate::transport::Channel;

/// Configuration for gateway behavior.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Page size for `history_request` without a limit, and for the
    /// unknown-id sync fallback.
    pub default_history_limit: u32,
    /// Channels with no inbound traffic for this long are closed.
    /// Heartbeats count as traffic.
    pub idle_timeout: Duration,
    /// Buffer depth of the per-session fan-out channel.
    pub fanout_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_history_limit: DEFAULT_HISTORY_LIMIT,
            idle_timeout: Duration::from_secs(90),
            fanout_buffer: 64,
        }
    }
}

/// Why a serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseReason {
    /// The peer closed the channel.
    #[default]
    PeerClosed,
    /// No inbound traffic within the idle window.
    IdleTimeout,
    /// The transport failed mid-conversation.
    TransportError,
}

/// Summary of one channel's lifetime.
#[derive(Debug, Default)]
pub struct ChannelReport {
    /// Messages persisted through this channel.
    pub persisted: usize,
    /// Confirmations forwarded from other channels of the same session.
    pub fanout_delivered: usize,
    /// Heartbeats echoed.
    pub heartbeats: usize,
    /// Frames that were malformed or misdirected and ignored.
    pub protocol_errors: usize,
    /// How the channel ended.
    pub closed: CloseReason,
}

/// Confirmation traveling between channels of one session.
#[derive(Debug, Clone)]
struct Fanout {
    origin: u64,
    message: Message,
}

/// The gateway. Shared across serve loops via `Arc`.
pub struct SyncGateway<S> {
    store: Arc<S>,
    config: GatewayConfig,
    sessions: RwLock<HashMap<SessionId, broadcast::Sender<Fanout>>>,
    next_channel: AtomicU64,
}

impl<S: Store> SyncGateway<S> {
    /// Create a gateway over the given store.
    pub fn new(store: Arc<S>, config: GatewayConfig) -> Self {
        Self {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn fanout_sender(&self, session_id: &SessionId) -> broadcast::Sender<Fanout> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(*session_id)
            .or_insert_with(|| broadcast::channel(self.config.fanout_buffer).0)
            .clone()
    }

    async fn release_fanout(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(sender) = sessions.get(session_id) {
            if sender.receiver_count() == 0 {
                sessions.remove(session_id);
            }
        }
    }

    /// Serve one channel until it closes.
    ///
    /// The channel is bound to `session_id` for its whole lifetime.
    /// Malformed frames are logged and ignored; a persistence outage
    /// produces no confirmation and no error envelope.
    pub async fn serve(
        &self,
        session_id: SessionId,
        channel: Box<dyn Channel>,
    ) -> Result<ChannelReport> {
        let channel_id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let fan_tx = self.fanout_sender(&session_id).await;
        let mut fan_rx = fan_tx.subscribe();
        let mut report = ChannelReport::default();

        tracing::info!(session = %session_id.short(), channel = channel_id, "channel open");

        loop {
            tokio::select! {
                inbound = tokio::time::timeout(self.config.idle_timeout, channel.recv()) => {
                    match inbound {
                        Err(_) => {
                            tracing::info!(session = %session_id.short(), channel = channel_id, "idle timeout");
                            channel.close().await;
                            report.closed = CloseReason::IdleTimeout;
                            break;
                        }
                        Ok(Ok(None)) => {
                            report.closed = CloseReason::PeerClosed;
                            break;
                        }
                        Ok(Ok(Some(frame))) => {
                            if let Err(e) = self
                                .handle_frame(&session_id, channel_id, &*channel, &fan_tx, &frame, &mut report)
                                .await
                            {
                                tracing::warn!(session = %session_id.short(), channel = channel_id, error = %e, "channel send failed");
                                report.closed = CloseReason::TransportError;
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(session = %session_id.short(), channel = channel_id, error = %e, "channel recv failed");
                            report.closed = CloseReason::TransportError;
                            break;
                        }
                    }
                }
                fan = fan_rx.recv() => {
                    match fan {
                        Ok(item) if item.origin != channel_id => {
                            let env = Envelope::Message(MessagePayload::confirmed(&item.message));
                            if channel.send(env.encode()?).await.is_err() {
                                report.closed = CloseReason::TransportError;
                                break;
                            }
                            report.fanout_delivered += 1;
                        }
                        Ok(_) => {} // our own append; already echoed inline
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // The client recovers on its next reconciliation.
                            tracing::warn!(session = %session_id.short(), channel = channel_id, skipped, "fan-out lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            report.closed = CloseReason::TransportError;
                            break;
                        }
                    }
                }
            }
        }

        drop(fan_rx);
        self.release_fanout(&session_id).await;

        tracing::info!(
            session = %session_id.short(),
            channel = channel_id,
            persisted = report.persisted,
            reason = ?report.closed,
            "channel closed"
        );

        Ok(report)
    }

    /// Handle one inbound frame. Only a failed reply send propagates an
    /// error; everything else is absorbed here.
    async fn handle_frame(
        &self,
        session_id: &SessionId,
        channel_id: u64,
        channel: &dyn Channel,
        fan_tx: &broadcast::Sender<Fanout>,
        frame: &str,
        report: &mut ChannelReport,
    ) -> Result<()> {
        let envelope = match Envelope::decode(frame) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(session = %session_id.short(), channel = channel_id, error = %e, "malformed frame ignored");
                report.protocol_errors += 1;
                return Ok(());
            }
        };

        match envelope {
            Envelope::Message(payload) => {
                match self.store.append_message(session_id, payload.into_draft()).await {
                    Ok(message) => {
                        let echo = Envelope::Message(MessagePayload::confirmed(&message));
                        channel.send(echo.encode()?).await?;
                        // Other channels of the same session, if any.
                        let _ = fan_tx.send(Fanout {
                            origin: channel_id,
                            message,
                        });
                        report.persisted += 1;
                    }
                    Err(e) if e.is_unavailable() => {
                        // No confirmation and no error envelope; the
                        // client's retry policy owns recovery.
                        tracing::warn!(session = %session_id.short(), error = %e, "append failed, no confirmation sent");
                    }
                    Err(StoreError::Validation(e)) => {
                        tracing::warn!(session = %session_id.short(), error = %e, "message rejected");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Envelope::HistoryRequest { limit } => {
                let limit = limit.unwrap_or(self.config.default_history_limit);
                let messages = self.store.recent_messages(session_id, limit).await?;
                channel
                    .send(Envelope::History { messages }.encode()?)
                    .await?;
            }
            Envelope::SyncRequest {
                last_message_id, ..
            } => {
                let messages = match self
                    .store
                    .messages_after(session_id, &last_message_id)
                    .await?
                {
                    Some(messages) => messages,
                    None => {
                        // The anchor was never durably confirmed; answer
                        // with recent history so the client runs a full
                        // reconciliation instead of losing messages.
                        tracing::debug!(
                            session = %session_id.short(),
                            anchor = %last_message_id.short(),
                            "sync anchor unknown, falling back to history"
                        );
                        self.store
                            .recent_messages(session_id, self.config.default_history_limit)
                            .await?
                    }
                };
                channel
                    .send(Envelope::SyncResponse { messages }.encode()?)
                    .await?;
            }
            Envelope::Heartbeat => {
                channel.send(Envelope::Heartbeat.encode()?).await?;
                report.heartbeats += 1;
            }
            // Server-bound only; a client must never receive these here.
            Envelope::History { .. } | Envelope::SyncResponse { .. } => {
                tracing::warn!(
                    session = %session_id.short(),
                    kind = envelope.kind(),
                    "misdirected envelope ignored"
                );
                report.protocol_errors += 1;
            }
        }

        Ok(())
    }
}
