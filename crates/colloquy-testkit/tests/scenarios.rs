//! End-to-end protocol scenarios: client state machine against a real
//! gateway over the in-memory duplex transport.

use std::time::Duration;

use colloquy_client::{
    Action, CacheConfig, CachedMessage, ConnectionConfig, ConnectionDriver, ConnectionEvent,
    ConnectionManager, ConnectionState, LocalCache,
};
use colloquy_core::{MessageDraft, MessageId, Role, SessionId};
use colloquy_store::{PageQuery, Store};
use colloquy_sync::transport::memory::MemoryChannel;
use colloquy_sync::{Channel, Envelope, MessagePayload};
use colloquy_testkit::{init_tracing, TestFixture};

/// Execute the send actions a state machine emitted against a live
/// channel.
async fn apply_sends(actions: Vec<Action>, channel: &MemoryChannel) {
    for action in actions {
        if let Action::Send(envelope) = action {
            channel
                .send(envelope.encode().expect("encode failed"))
                .await
                .expect("send failed");
        }
    }
}

async fn next_envelope(channel: &MemoryChannel) -> Envelope {
    let frame = channel
        .recv()
        .await
        .expect("recv failed")
        .expect("channel closed");
    Envelope::decode(&frame).expect("decode failed")
}

fn manager_with_cache(session: SessionId, cache: LocalCache) -> ConnectionManager {
    ConnectionManager::new(session, cache, ConnectionConfig::default())
}

/// Scenario A: a populated cache reconnects and receives only the tail
/// it is missing.
#[tokio::test]
async fn reconnect_sync_appends_missing_tail() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();
    let seeded = fixture.seed_messages(&session, 3).await;

    let cache = LocalCache::in_memory(CacheConfig::default());
    cache.replace(
        &session,
        vec![
            CachedMessage::confirmed(seeded[0].clone()),
            CachedMessage::confirmed(seeded[1].clone()),
        ],
    );

    let mut manager = manager_with_cache(session, cache);
    let channel = fixture.open_channel(session);

    manager.handle_event(ConnectionEvent::ConnectRequested);
    let actions = manager.handle_event(ConnectionEvent::ChannelOpened);
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Send(Envelope::SyncRequest { last_message_id, .. })
            if *last_message_id == seeded[1].id
    )));
    apply_sends(actions, &channel).await;

    let response = next_envelope(&channel).await;
    let Envelope::SyncResponse { messages } = &response else {
        panic!("expected sync response, got {response:?}");
    };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, seeded[2].id);

    manager.handle_event(ConnectionEvent::Inbound(response));

    let cached = manager.cache().messages(&session);
    let ids: Vec<MessageId> = cached.iter().map(|m| m.message.id).collect();
    assert_eq!(ids, vec![seeded[0].id, seeded[1].id, seeded[2].id]);
    assert!(cached
        .windows(2)
        .all(|w| w[0].message.timestamp <= w[1].message.timestamp));
}

/// Scenario B: an empty cache bootstraps from the default-limit recent
/// history and becomes exactly that list.
#[tokio::test]
async fn empty_cache_bootstraps_from_history() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();
    let seeded = fixture.seed_messages(&session, 60).await;

    let mut manager =
        manager_with_cache(session, LocalCache::in_memory(CacheConfig::default()));
    let channel = fixture.open_channel(session);

    manager.handle_event(ConnectionEvent::ConnectRequested);
    let actions = manager.handle_event(ConnectionEvent::ChannelOpened);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::Send(Envelope::HistoryRequest { limit: Some(50) }))));
    apply_sends(actions, &channel).await;

    let response = next_envelope(&channel).await;
    let Envelope::History { messages } = &response else {
        panic!("expected history, got {response:?}");
    };
    assert_eq!(messages.len(), 50);

    manager.handle_event(ConnectionEvent::Inbound(response));

    let cached = manager.cache().messages(&session);
    assert_eq!(cached.len(), 50);
    // The 50 most recent, ascending.
    let expected: Vec<MessageId> = seeded[10..].iter().map(|m| m.id).collect();
    let actual: Vec<MessageId> = cached.iter().map(|m| m.message.id).collect();
    assert_eq!(actual, expected);
    assert!(cached.iter().all(|m| m.is_confirmed()));
}

/// Scenario C: appending over the wire persists the message and updates
/// the session metadata.
#[tokio::test]
async fn wire_append_updates_store_and_session_meta() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();
    let channel = fixture.open_channel(session);

    let draft = MessageDraft::new(Role::User, "hi");
    channel
        .send(
            Envelope::Message(MessagePayload::outbound(&draft))
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();

    let Envelope::Message(confirmed) = next_envelope(&channel).await else {
        panic!("expected confirmation");
    };
    assert!(confirmed.is_confirmed());

    let page = fixture
        .store
        .list_messages(&session, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.messages[0].role, Role::User);
    assert_eq!(page.messages[0].content, "hi");

    let meta = fixture.store.get_session(&session).await.unwrap().unwrap();
    assert_eq!(meta.preview.as_deref(), Some("hi"));
    assert_eq!(meta.last_message_at, confirmed.timestamp);
}

/// Scenario D: a sync anchor the server cannot locate falls back to
/// recent history; the unknown local message is retained by the merge.
#[tokio::test]
async fn unknown_sync_anchor_forces_full_reconciliation() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();
    let seeded = fixture.seed_messages(&session, 3).await;

    // A confirmed entry the server has no record of (e.g. confirmed
    // against a store that was since reset).
    let orphan = MessageDraft::new(Role::User, "orphan").into_message(
        MessageId::new(),
        session,
        seeded[2].timestamp + 1000,
    );
    let cache = LocalCache::in_memory(CacheConfig::default());
    cache.replace(&session, vec![CachedMessage::confirmed(orphan.clone())]);

    let mut manager = manager_with_cache(session, cache);
    let channel = fixture.open_channel(session);

    manager.handle_event(ConnectionEvent::ConnectRequested);
    let actions = manager.handle_event(ConnectionEvent::ChannelOpened);
    apply_sends(actions, &channel).await;

    let response = next_envelope(&channel).await;
    let Envelope::SyncResponse { messages } = &response else {
        panic!("expected sync response, got {response:?}");
    };
    // Fallback: the full recent history, not an empty set.
    assert_eq!(messages.len(), 3);

    manager.handle_event(ConnectionEvent::Inbound(response));

    let cached = manager.cache().messages(&session);
    assert_eq!(cached.len(), 4);
    let ids: Vec<MessageId> = cached.iter().map(|m| m.message.id).collect();
    assert_eq!(
        ids,
        vec![seeded[0].id, seeded[1].id, seeded[2].id, orphan.id]
    );
}

/// Multi-device: a message sent through one channel reaches the cache
/// of a second connected client via fan-out.
#[tokio::test]
async fn fanout_reaches_second_device_cache() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();

    // Device B connects first and drains its (empty) history.
    let mut device_b =
        manager_with_cache(session, LocalCache::in_memory(CacheConfig::default()));
    let channel_b = fixture.open_channel(session);
    device_b.handle_event(ConnectionEvent::ConnectRequested);
    apply_sends(
        device_b.handle_event(ConnectionEvent::ChannelOpened),
        &channel_b,
    )
    .await;
    let history = next_envelope(&channel_b).await;
    device_b.handle_event(ConnectionEvent::Inbound(history));

    // Device A sends a message on its own channel.
    let channel_a = fixture.open_channel(session);
    let draft = MessageDraft::new(Role::User, "seen everywhere");
    channel_a
        .send(
            Envelope::Message(MessagePayload::outbound(&draft))
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();
    let _echo = next_envelope(&channel_a).await;

    // B receives the fan-out copy and confirms it into its cache.
    let fanned = next_envelope(&channel_b).await;
    assert!(matches!(&fanned, Envelope::Message(p) if p.is_confirmed()));
    device_b.handle_event(ConnectionEvent::Inbound(fanned));

    let cached = device_b.cache().messages(&session);
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].message.content, "seen everywhere");
    assert!(cached[0].is_confirmed());
}

/// Full driver loop: survives injected connect failures, delivers a
/// queued message, and shuts down cleanly on user close.
#[tokio::test]
async fn driver_recovers_from_connect_failures_and_delivers() {
    init_tracing();
    let fixture = TestFixture::new();
    let session = SessionId::new();

    let connector = fixture.connector(session);
    connector.fail_next(2);

    let config = ConnectionConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };
    let manager = ConnectionManager::new(
        session,
        LocalCache::in_memory(CacheConfig::default()),
        config,
    );

    let (driver, handle) = ConnectionDriver::new(manager, Box::new(connector));
    let running = tokio::spawn(driver.run());

    assert!(
        handle
            .send_message(MessageDraft::new(Role::User, "hello through retries"))
            .await
    );

    // Give the driver time to back off twice, connect, flush, and get
    // the confirmation echo.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.close().await);

    let manager = running.await.expect("driver panicked");
    assert_eq!(manager.state(), ConnectionState::Closed);

    let cached = manager.cache().messages(&session);
    assert_eq!(cached.len(), 1);
    assert!(cached[0].is_confirmed(), "message should be confirmed");

    assert_eq!(fixture.store.message_count(&session).await.unwrap(), 1);
}
