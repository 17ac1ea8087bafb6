//! Proptest generators for property-based testing.

use proptest::prelude::*;
use uuid::Uuid;

use colloquy_client::CachedMessage;
use colloquy_core::{Message, MessageDraft, MessageId, Role, SessionId};

/// Generate a random session id.
pub fn session_id() -> impl Strategy<Value = SessionId> {
    any::<u128>().prop_map(|n| SessionId(Uuid::from_u128(n)))
}

/// Generate a random message id.
pub fn message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId(Uuid::from_u128(n)))
}

/// Generate a message id from a small pool, so merge inputs collide.
pub fn pooled_message_id(pool: u128) -> impl Strategy<Value = MessageId> {
    (0..pool).prop_map(|n| MessageId(Uuid::from_u128(n)))
}

/// Generate one of the three roles.
pub fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::User), Just(Role::Assistant), Just(Role::System)]
}

/// Generate short text content.
pub fn content() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{0,24}"
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=i64::MAX / 2
}

/// Generate a message within the given session.
pub fn message(session: SessionId) -> impl Strategy<Value = Message> {
    (message_id(), role(), content(), timestamp())
        .prop_map(move |(id, role, content, ts)| {
            MessageDraft::new(role, content).into_message(id, session, ts)
        })
}

/// Generate a cached message (pending or confirmed).
pub fn cached_message(session: SessionId) -> impl Strategy<Value = CachedMessage> {
    (message(session), any::<bool>()).prop_map(|(m, confirmed)| {
        if confirmed {
            CachedMessage::confirmed(m)
        } else {
            CachedMessage::pending(m)
        }
    })
}

/// Generate an ordered message sequence with non-decreasing timestamps,
/// the shape a session log has once persisted.
pub fn message_sequence(
    session: SessionId,
    max_len: usize,
) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((message_id(), role(), content(), 0i64..1000), 0..=max_len).prop_map(
        move |items| {
            let mut ts = 0i64;
            items
                .into_iter()
                .map(|(id, role, content, step)| {
                    ts += step;
                    MessageDraft::new(role, content).into_message(id, session, ts)
                })
                .collect()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_sequence_is_ordered(
            messages in session_id().prop_flat_map(|s| message_sequence(s, 16)),
        ) {
            prop_assert!(messages
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}
