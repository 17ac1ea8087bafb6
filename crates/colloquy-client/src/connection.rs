//! Connection lifecycle state machine and its async driver.
//!
//! The manager is an explicit state machine: one
//! [`ConnectionManager::handle_event`] entry point, pure of I/O, so
//! every transition is unit testable without a live transport. The
//! [`ConnectionDriver`] owns the transport and timers and executes the
//! actions the machine emits.
//!
//! The reconnect timer and the heartbeat timers are one slot: starting
//! any timer replaces the previous one, so the two can never run
//! concurrently.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use colloquy_core::{Message, MessageDraft, MessageId, SessionId};
use colloquy_sync::{Channel, Connector, Envelope, MessagePayload, DEFAULT_HISTORY_LIMIT};

use crate::cache::{CachedMessage, LocalCache};
use crate::liveness::{LivenessConfig, LivenessMonitor, LivenessVerdict};
use crate::merge::merge;

/// Configuration for connection behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// First reconnect delay; doubles each failed attempt.
    pub initial_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
    /// Failed/closed attempts tolerated before the terminal Failed
    /// state.
    pub max_attempts: u32,
    /// Upper bound of the uniform jitter, as a fraction of the base
    /// delay.
    pub jitter_fraction: f64,
    /// Liveness probing parameters.
    pub liveness: LivenessConfig,
    /// Page size of the reconciliation history request when the cache
    /// has no confirmed anchor.
    pub default_history_limit: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_fraction: 0.3,
            liveness: LivenessConfig::default(),
            default_history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectWait,
    /// Reconnect attempts exhausted. Terminal; requires manual
    /// intervention.
    Failed,
    /// User-initiated close. Terminal.
    Closed,
}

/// The single timer slot the driver maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Reconnect,
    HeartbeatProbe,
    HeartbeatDeadline,
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Kick off the first connection attempt.
    ConnectRequested,
    /// The connector produced a live channel.
    ChannelOpened,
    /// The connector failed to produce a channel.
    OpenFailed,
    /// The channel closed without a user request.
    ChannelClosed,
    /// User-initiated close.
    CloseRequested,
    /// A decoded envelope arrived.
    Inbound(Envelope),
    /// The timer slot fired.
    TimerFired(TimerKind),
}

/// Outputs of the state machine, executed by the driver.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Ask the connector for a fresh channel.
    OpenChannel,
    /// Encode and send an envelope on the current channel.
    Send(Envelope),
    /// Close the current channel.
    CloseChannel,
    /// Arm the timer slot, replacing whatever was armed.
    StartTimer(TimerKind, Duration),
    /// Disarm the timer slot.
    CancelTimer,
    /// Reconnect attempts are exhausted; surface to the user.
    NotifyFailed,
}

/// Exponential backoff base for the n-th reconnect attempt:
/// `min(max_delay, initial_delay * 2^attempt)`.
pub fn backoff_base(config: &ConnectionConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    Duration::from_secs_f64((initial * 2f64.powi(attempt.min(63) as i32)).min(max))
}

/// Backoff with jitter drawn uniformly from `[0, jitter_fraction]` of
/// the base.
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = backoff_base(config, attempt);
    let jitter = rng.gen_range(0.0..=config.jitter_fraction);
    base.mul_f64(1.0 + jitter)
}

/// Duplex-channel lifecycle state machine for one session.
pub struct ConnectionManager {
    config: ConnectionConfig,
    session_id: SessionId,
    cache: LocalCache,
    state: ConnectionState,
    attempt: u32,
    liveness: LivenessMonitor,
    /// Drafts queued while no channel is up, flushed FIFO on connect.
    outbox: VecDeque<MessageDraft>,
    rng: StdRng,
}

impl ConnectionManager {
    pub fn new(session_id: SessionId, cache: LocalCache, config: ConnectionConfig) -> Self {
        let liveness = LivenessMonitor::new(config.liveness.clone());
        Self {
            config,
            session_id,
            cache,
            state: ConnectionState::Disconnected,
            attempt: 0,
            liveness,
            outbox: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the machine can never leave its current state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Failed | ConnectionState::Closed
        )
    }

    /// Number of drafts waiting for a channel.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Record a user message: it lands in the cache as pending
    /// immediately, and is either sent now or queued until the next
    /// connect.
    pub fn send_message(&mut self, draft: MessageDraft) -> Vec<Action> {
        if self.is_terminal() {
            tracing::warn!(session = %self.session_id.short(), "message dropped, connection is terminal");
            return Vec::new();
        }

        let provisional = MessageId::new();
        let draft = draft.client_id(provisional);
        let pending = CachedMessage::pending(draft.clone().into_message(
            provisional,
            self.session_id,
            now_millis(),
        ));
        self.cache.append(&self.session_id, pending);

        if self.state == ConnectionState::Connected {
            vec![Action::Send(Envelope::Message(MessagePayload::outbound(
                &draft,
            )))]
        } else {
            self.outbox.push_back(draft);
            Vec::new()
        }
    }

    /// The single state-machine entry point.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> Vec<Action> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        if self.is_terminal() {
            return Vec::new();
        }

        match (self.state, event) {
            (Disconnected, ConnectRequested) => {
                self.state = Connecting;
                vec![Action::OpenChannel]
            }

            (Connecting, ChannelOpened) => self.on_connected(),
            (Connecting, OpenFailed) => self.on_attempt_failed(),

            (ReconnectWait, TimerFired(TimerKind::Reconnect)) => {
                self.state = Connecting;
                vec![Action::OpenChannel]
            }

            (Connected, Inbound(envelope)) => self.on_inbound(envelope),

            (Connected, TimerFired(TimerKind::HeartbeatProbe)) => {
                self.liveness.on_probe_sent();
                vec![
                    Action::Send(Envelope::Heartbeat),
                    Action::StartTimer(
                        TimerKind::HeartbeatDeadline,
                        self.config.liveness.probe_timeout,
                    ),
                ]
            }

            (Connected, TimerFired(TimerKind::HeartbeatDeadline)) => {
                match self.liveness.on_probe_deadline() {
                    LivenessVerdict::Dead => {
                        tracing::warn!(
                            session = %self.session_id.short(),
                            "heartbeats exhausted, treating channel as dead"
                        );
                        let mut actions = vec![Action::CloseChannel];
                        actions.extend(self.on_attempt_failed());
                        actions
                    }
                    LivenessVerdict::Alive => {
                        let interval = self.config.liveness.probe_interval;
                        let until_next =
                            interval.saturating_sub(self.config.liveness.probe_timeout);
                        vec![Action::StartTimer(TimerKind::HeartbeatProbe, until_next)]
                    }
                }
            }

            (Connected, ChannelClosed) => self.on_attempt_failed(),

            (_, CloseRequested) => {
                self.liveness.stop();
                self.state = Closed;
                vec![Action::CancelTimer, Action::CloseChannel]
            }

            (state, Inbound(envelope)) => {
                // A response for a request issued on a previous channel;
                // applying it partially would corrupt the cache.
                tracing::debug!(
                    session = %self.session_id.short(),
                    ?state,
                    kind = envelope.kind(),
                    "discarding out-of-state envelope"
                );
                Vec::new()
            }

            (state, event) => {
                tracing::debug!(session = %self.session_id.short(), ?state, ?event, "event ignored");
                Vec::new()
            }
        }
    }

    /// Entering Connected: reset the attempt counter, start liveness,
    /// flush the queue FIFO, then issue exactly one reconciliation
    /// request.
    fn on_connected(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.liveness.start();

        let mut actions = Vec::new();
        while let Some(draft) = self.outbox.pop_front() {
            actions.push(Action::Send(Envelope::Message(MessagePayload::outbound(
                &draft,
            ))));
        }

        actions.push(Action::Send(
            match self.cache.last_confirmed_id(&self.session_id) {
                Some(anchor) => Envelope::SyncRequest {
                    last_message_id: anchor,
                    timestamp: Some(now_millis()),
                },
                None => Envelope::HistoryRequest {
                    limit: Some(self.config.default_history_limit),
                },
            },
        ));

        actions.push(Action::StartTimer(
            TimerKind::HeartbeatProbe,
            self.config.liveness.probe_interval,
        ));
        actions
    }

    /// A connection attempt failed or a live channel died: back off and
    /// retry, or give up after the configured attempt budget.
    fn on_attempt_failed(&mut self) -> Vec<Action> {
        self.liveness.stop();
        self.attempt += 1;

        if self.attempt > self.config.max_attempts {
            tracing::error!(
                session = %self.session_id.short(),
                attempts = self.attempt - 1,
                "reconnect attempts exhausted"
            );
            self.state = ConnectionState::Failed;
            return vec![Action::CancelTimer, Action::NotifyFailed];
        }

        let delay = backoff_delay(&self.config, self.attempt - 1, &mut self.rng);
        tracing::info!(
            session = %self.session_id.short(),
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.state = ConnectionState::ReconnectWait;
        vec![Action::StartTimer(TimerKind::Reconnect, delay)]
    }

    fn on_inbound(&mut self, envelope: Envelope) -> Vec<Action> {
        self.liveness.on_inbound();

        match envelope {
            Envelope::Message(payload) => match self.confirmed_message(payload) {
                Some(message) => self.cache.confirm(&self.session_id, &message),
                None => {
                    tracing::debug!(
                        session = %self.session_id.short(),
                        "ignoring unconfirmed message from server"
                    );
                }
            },
            Envelope::History { messages } | Envelope::SyncResponse { messages } => {
                let merged = merge(&self.cache.messages(&self.session_id), &messages);
                self.cache.replace(&self.session_id, merged);
            }
            Envelope::Heartbeat => {}
            Envelope::HistoryRequest { .. } | Envelope::SyncRequest { .. } => {
                tracing::debug!(
                    session = %self.session_id.short(),
                    "ignoring client-bound request envelope"
                );
            }
        }

        Vec::new()
    }

    /// Rebuild a [`Message`] from a confirmed server payload.
    fn confirmed_message(&self, payload: MessagePayload) -> Option<Message> {
        let (Some(id), Some(timestamp)) = (payload.id, payload.timestamp) else {
            return None;
        };
        Some(Message {
            id,
            session_id: self.session_id,
            role: payload.role,
            content: payload.content,
            agent_name: payload.agent_name,
            user_id: None,
            timestamp,
            metadata: payload.metadata,
        })
    }
}

/// Commands accepted by a running driver.
#[derive(Debug)]
pub enum Command {
    Send(MessageDraft),
    Close,
}

/// Handle for talking to a running [`ConnectionDriver`].
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    /// Queue a message for sending. Returns false when the driver has
    /// shut down.
    pub async fn send_message(&self, draft: MessageDraft) -> bool {
        self.tx.send(Command::Send(draft)).await.is_ok()
    }

    /// Request a user-initiated (terminal) close.
    pub async fn close(&self) -> bool {
        self.tx.send(Command::Close).await.is_ok()
    }
}

/// Async driver: owns the connector, the channel, and the timer slot;
/// feeds events into the state machine and executes its actions.
pub struct ConnectionDriver {
    manager: ConnectionManager,
    connector: Box<dyn Connector>,
    commands: mpsc::Receiver<Command>,
}

impl ConnectionDriver {
    pub fn new(
        manager: ConnectionManager,
        connector: Box<dyn Connector>,
    ) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                manager,
                connector,
                commands: rx,
            },
            ConnectionHandle { tx },
        )
    }

    /// Run until the connection reaches a terminal state. Returns the
    /// manager (and with it the cache) for inspection; the cache gets a
    /// final flush on the way out.
    pub async fn run(self) -> ConnectionManager {
        let ConnectionDriver {
            mut manager,
            connector,
            mut commands,
        } = self;

        let mut channel: Option<Box<dyn Channel>> = None;
        let mut timer: Option<(TimerKind, tokio::time::Instant)> = None;
        let mut events: VecDeque<ConnectionEvent> = VecDeque::new();
        events.push_back(ConnectionEvent::ConnectRequested);

        loop {
            while let Some(event) = events.pop_front() {
                let actions = manager.handle_event(event);
                apply_actions(&*connector, actions, &mut channel, &mut timer, &mut events)
                    .await;
            }

            if manager.is_terminal() {
                break;
            }

            let flush_at = manager.cache().next_flush_deadline();

            tokio::select! {
                inbound = recv_or_pending(&channel) => {
                    match inbound {
                        Ok(Some(frame)) => match Envelope::decode(&frame) {
                            Ok(envelope) => events.push_back(ConnectionEvent::Inbound(envelope)),
                            Err(e) => tracing::warn!(error = %e, "malformed frame ignored"),
                        },
                        Ok(None) | Err(_) => {
                            channel = None;
                            events.push_back(ConnectionEvent::ChannelClosed);
                        }
                    }
                }
                _ = sleep_opt(timer.as_ref().map(|(_, at)| *at)) => {
                    if let Some((kind, _)) = timer.take() {
                        events.push_back(ConnectionEvent::TimerFired(kind));
                    }
                }
                _ = sleep_opt(flush_at.map(into_tokio_instant)) => {
                    manager.cache().flush_due(std::time::Instant::now());
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Send(draft)) => {
                            let actions = manager.send_message(draft);
                            apply_actions(
                                &*connector,
                                actions,
                                &mut channel,
                                &mut timer,
                                &mut events,
                            )
                            .await;
                        }
                        Some(Command::Close) | None => {
                            events.push_back(ConnectionEvent::CloseRequested);
                        }
                    }
                }
            }
        }

        if let Some(ch) = channel.take() {
            ch.close().await;
        }
        manager.cache().flush_all();
        manager
    }
}

async fn apply_actions(
    connector: &dyn Connector,
    actions: Vec<Action>,
    channel: &mut Option<Box<dyn Channel>>,
    timer: &mut Option<(TimerKind, tokio::time::Instant)>,
    events: &mut VecDeque<ConnectionEvent>,
) {
    for action in actions {
        match action {
            Action::OpenChannel => match connector.connect().await {
                Ok(ch) => {
                    *channel = Some(ch);
                    events.push_back(ConnectionEvent::ChannelOpened);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connect failed");
                    events.push_back(ConnectionEvent::OpenFailed);
                }
            },
            Action::Send(envelope) => {
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "envelope encode failed");
                        continue;
                    }
                };
                if let Some(ch) = channel.as_ref() {
                    if let Err(e) = ch.send(frame).await {
                        tracing::warn!(error = %e, "send failed, channel presumed dead");
                        *channel = None;
                        events.push_back(ConnectionEvent::ChannelClosed);
                    }
                }
            }
            Action::CloseChannel => {
                if let Some(ch) = channel.take() {
                    ch.close().await;
                }
            }
            Action::StartTimer(kind, delay) => {
                *timer = Some((kind, tokio::time::Instant::now() + delay));
            }
            Action::CancelTimer => {
                *timer = None;
            }
            Action::NotifyFailed => {
                tracing::error!("connection failed permanently; manual retry required");
            }
        }
    }
}

async fn recv_or_pending(
    channel: &Option<Box<dyn Channel>>,
) -> colloquy_sync::Result<Option<String>> {
    match channel {
        Some(ch) => ch.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn into_tokio_instant(at: std::time::Instant) -> tokio::time::Instant {
    tokio::time::Instant::from_std(at)
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use colloquy_core::{MessageDraft, Role};

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            SessionId::new(),
            LocalCache::in_memory(CacheConfig::default()),
            ConnectionConfig::default(),
        )
    }

    fn confirmed(session: &SessionId, content: &str, ts: i64) -> Message {
        MessageDraft::new(Role::User, content).into_message(MessageId::new(), *session, ts)
    }

    #[test]
    fn test_connect_flow_empty_cache_requests_history() {
        let mut m = manager();

        let actions = m.handle_event(ConnectionEvent::ConnectRequested);
        assert_eq!(actions, vec![Action::OpenChannel]);
        assert_eq!(m.state(), ConnectionState::Connecting);

        let actions = m.handle_event(ConnectionEvent::ChannelOpened);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.attempt(), 0);
        assert_eq!(
            actions,
            vec![
                Action::Send(Envelope::HistoryRequest {
                    limit: Some(DEFAULT_HISTORY_LIMIT)
                }),
                Action::StartTimer(
                    TimerKind::HeartbeatProbe,
                    LivenessConfig::default().probe_interval
                ),
            ]
        );
    }

    #[test]
    fn test_connect_flow_with_anchor_requests_sync() {
        let mut m = manager();
        let session = m.session_id();
        let anchor = confirmed(&session, "anchored", 100);
        m.cache()
            .append(&session, CachedMessage::confirmed(anchor.clone()));

        m.handle_event(ConnectionEvent::ConnectRequested);
        let actions = m.handle_event(ConnectionEvent::ChannelOpened);

        assert!(matches!(
            &actions[0],
            Action::Send(Envelope::SyncRequest { last_message_id, .. })
                if *last_message_id == anchor.id
        ));
    }

    #[test]
    fn test_queued_messages_flush_fifo_before_reconciliation() {
        let mut m = manager();

        assert!(m.send_message(MessageDraft::new(Role::User, "first")).is_empty());
        assert!(m.send_message(MessageDraft::new(Role::User, "second")).is_empty());
        assert_eq!(m.queued(), 2);

        m.handle_event(ConnectionEvent::ConnectRequested);
        let actions = m.handle_event(ConnectionEvent::ChannelOpened);
        assert_eq!(m.queued(), 0);

        let sent: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(Envelope::Message(p)) => Some(p.content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec!["first", "second"]);

        // Reconciliation comes after the flush.
        let request_index = actions
            .iter()
            .position(|a| matches!(a, Action::Send(Envelope::HistoryRequest { .. })))
            .unwrap();
        assert_eq!(request_index, 2);
    }

    #[test]
    fn test_send_while_connected_emits_immediately() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let actions = m.send_message(MessageDraft::new(Role::User, "now"));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Send(Envelope::Message(_))));

        // The pending entry is visible right away.
        let cached = m.cache().messages(&m.session_id());
        assert_eq!(cached.len(), 1);
        assert!(!cached[0].is_confirmed());
    }

    #[test]
    fn test_unexpected_close_schedules_backoff() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let actions = m.handle_event(ConnectionEvent::ChannelClosed);
        assert_eq!(m.state(), ConnectionState::ReconnectWait);
        assert_eq!(m.attempt(), 1);

        let Action::StartTimer(TimerKind::Reconnect, delay) = actions[0] else {
            panic!("expected reconnect timer");
        };
        let base = backoff_base(&m.config, 0);
        assert!(delay >= base);
        assert!(delay <= base.mul_f64(1.3001));
    }

    #[test]
    fn test_failed_after_exhausting_attempts() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);

        for _ in 0..ConnectionConfig::default().max_attempts {
            let actions = m.handle_event(ConnectionEvent::OpenFailed);
            assert!(matches!(
                actions[0],
                Action::StartTimer(TimerKind::Reconnect, _)
            ));
            m.handle_event(ConnectionEvent::TimerFired(TimerKind::Reconnect));
        }

        let actions = m.handle_event(ConnectionEvent::OpenFailed);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(actions, vec![Action::CancelTimer, Action::NotifyFailed]);

        // Terminal: nothing moves it anymore.
        assert!(m
            .handle_event(ConnectionEvent::TimerFired(TimerKind::Reconnect))
            .is_empty());
        assert_eq!(m.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_successful_connect_resets_attempts() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::OpenFailed);
        m.handle_event(ConnectionEvent::TimerFired(TimerKind::Reconnect));
        assert_eq!(m.attempt(), 1);

        m.handle_event(ConnectionEvent::ChannelOpened);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_user_close_is_terminal() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let actions = m.handle_event(ConnectionEvent::CloseRequested);
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(actions, vec![Action::CancelTimer, Action::CloseChannel]);

        // No reconnect after a user close.
        assert!(m.handle_event(ConnectionEvent::ChannelClosed).is_empty());
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_heartbeat_probe_and_recovery() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let actions = m.handle_event(ConnectionEvent::TimerFired(TimerKind::HeartbeatProbe));
        assert_eq!(actions[0], Action::Send(Envelope::Heartbeat));
        assert!(matches!(
            actions[1],
            Action::StartTimer(TimerKind::HeartbeatDeadline, _)
        ));

        // Echo arrives in time: deadline lapse is not a miss.
        m.handle_event(ConnectionEvent::Inbound(Envelope::Heartbeat));
        let actions = m.handle_event(ConnectionEvent::TimerFired(TimerKind::HeartbeatDeadline));
        assert!(matches!(
            actions[0],
            Action::StartTimer(TimerKind::HeartbeatProbe, _)
        ));
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_dead_channel_after_missed_heartbeats_exactly_once() {
        let mut m = manager();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let max_missed = LivenessConfig::default().max_missed;
        for i in 1..=max_missed {
            m.handle_event(ConnectionEvent::TimerFired(TimerKind::HeartbeatProbe));
            let actions =
                m.handle_event(ConnectionEvent::TimerFired(TimerKind::HeartbeatDeadline));

            if i < max_missed {
                assert_eq!(m.state(), ConnectionState::Connected);
            } else {
                // Exactly one close-and-reconnect transition.
                assert_eq!(actions[0], Action::CloseChannel);
                assert!(matches!(
                    actions[1],
                    Action::StartTimer(TimerKind::Reconnect, _)
                ));
                assert_eq!(m.state(), ConnectionState::ReconnectWait);
            }
        }

        // A straggling deadline cannot re-trigger the dead path.
        let actions = m.handle_event(ConnectionEvent::TimerFired(TimerKind::HeartbeatDeadline));
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConnectionState::ReconnectWait);
    }

    #[test]
    fn test_sync_response_merges_into_cache() {
        let mut m = manager();
        let session = m.session_id();
        let local = confirmed(&session, "local", 100);
        m.cache()
            .append(&session, CachedMessage::confirmed(local.clone()));

        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let remote = confirmed(&session, "remote", 200);
        m.handle_event(ConnectionEvent::Inbound(Envelope::SyncResponse {
            messages: vec![remote.clone()],
        }));

        let cached = m.cache().messages(&session);
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].message.id, local.id);
        assert_eq!(cached[1].message.id, remote.id);
    }

    #[test]
    fn test_stale_response_discarded_outside_connected() {
        let mut m = manager();
        let session = m.session_id();

        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);
        m.handle_event(ConnectionEvent::ChannelClosed);
        assert_eq!(m.state(), ConnectionState::ReconnectWait);

        // A response raced the close: it must not touch the cache.
        m.handle_event(ConnectionEvent::Inbound(Envelope::History {
            messages: vec![confirmed(&session, "stale", 100)],
        }));
        assert!(m.cache().messages(&session).is_empty());
    }

    #[test]
    fn test_confirmation_resolves_pending_entry() {
        let mut m = manager();
        let session = m.session_id();
        m.handle_event(ConnectionEvent::ConnectRequested);
        m.handle_event(ConnectionEvent::ChannelOpened);

        let actions = m.send_message(MessageDraft::new(Role::User, "hello"));
        let Action::Send(Envelope::Message(sent)) = &actions[0] else {
            panic!("expected send");
        };

        // Server echo carries the client id back in metadata.
        let echo = MessagePayload {
            id: Some(MessageId::new()),
            timestamp: Some(500),
            ..sent.clone()
        };
        m.handle_event(ConnectionEvent::Inbound(Envelope::Message(echo.clone())));

        let cached = m.cache().messages(&session);
        assert_eq!(cached.len(), 1);
        assert!(cached[0].is_confirmed());
        assert_eq!(Some(cached[0].message.id), echo.id);
    }

    #[test]
    fn test_backoff_bounds_and_saturation() {
        let config = ConnectionConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut previous_base = Duration::ZERO;
        for attempt in 0..16 {
            let base = backoff_base(&config, attempt);
            assert!(base >= previous_base, "base must be non-decreasing");
            assert!(base <= config.max_delay);
            previous_base = base;

            for _ in 0..50 {
                let delay = backoff_delay(&config, attempt, &mut rng);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.3001));
            }
        }

        // Saturated at the ceiling.
        assert_eq!(backoff_base(&config, 15), config.max_delay);
    }
}
