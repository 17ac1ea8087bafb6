//! Message: the atomic unit of conversation history.
//!
//! Once persisted a message is immutable and never physically deleted.
//! Corrections are represented as new messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{MessageId, Role, SessionId};

/// Metadata key carrying the client-generated provisional id, used to
/// correlate a server confirmation with the pending local entry.
pub const CLIENT_ID_KEY: &str = "client_id";

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned durable id.
    pub id: MessageId,

    /// The owning session.
    pub session_id: SessionId,

    /// Author role.
    pub role: Role,

    /// Text content.
    pub content: String,

    /// Name of the agent that produced the message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    /// The user the message belongs to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Unix milliseconds. Non-decreasing within a session once persisted.
    pub timestamp: i64,

    /// Opaque key/value map. May carry [`CLIENT_ID_KEY`].
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// The client-generated provisional id recorded in metadata, if any.
    pub fn client_id(&self) -> Option<MessageId> {
        self.metadata
            .get(CLIENT_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| MessageId::parse(s).ok())
    }
}

/// Parameters for appending a message.
///
/// A draft has no id and no timestamp; both are assigned by the store at
/// persistence time.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub agent_name: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl MessageDraft {
    /// Start a draft with the required fields.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            agent_name: None,
            user_id: None,
            metadata: Map::new(),
        }
    }

    /// Set the producing agent's name.
    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Set the owning user.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Record the client-generated provisional id for confirmation
    /// correlation.
    pub fn client_id(self, id: MessageId) -> Self {
        self.metadata_entry(CLIENT_ID_KEY, Value::String(id.to_string()))
    }

    /// Materialize into a [`Message`] with a server-assigned id and
    /// timestamp. Store implementations call this inside their append
    /// transaction.
    pub fn into_message(self, id: MessageId, session_id: SessionId, timestamp: i64) -> Message {
        Message {
            id,
            session_id,
            role: self.role,
            content: self.content,
            agent_name: self.agent_name,
            user_id: self.user_id,
            timestamp,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_draft_into_message() {
        let session = SessionId::new();
        let id = MessageId::new();
        let msg = MessageDraft::new(Role::User, "hello")
            .agent_name("helper")
            .user_id("u-1")
            .into_message(id, session, 1234);

        assert_eq!(msg.id, id);
        assert_eq!(msg.session_id, session);
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.agent_name.as_deref(), Some("helper"));
        assert_eq!(msg.user_id.as_deref(), Some("u-1"));
        assert_eq!(msg.timestamp, 1234);
    }

    #[test]
    fn test_client_id_correlation() {
        let provisional = MessageId::new();
        let msg = MessageDraft::new(Role::User, "hi")
            .client_id(provisional)
            .into_message(MessageId::new(), SessionId::new(), 1);

        assert_eq!(msg.client_id(), Some(provisional));
    }

    #[test]
    fn test_client_id_absent_or_malformed() {
        let msg = MessageDraft::new(Role::User, "hi").into_message(
            MessageId::new(),
            SessionId::new(),
            1,
        );
        assert_eq!(msg.client_id(), None);

        let msg = MessageDraft::new(Role::User, "hi")
            .metadata_entry(CLIENT_ID_KEY, json!(42))
            .into_message(MessageId::new(), SessionId::new(), 1);
        assert_eq!(msg.client_id(), None);
    }

    #[test]
    fn test_message_json_roundtrip() {
        let msg = MessageDraft::new(Role::Assistant, "réponse")
            .metadata_entry("source", json!("unit-test"))
            .into_message(MessageId::new(), SessionId::new(), 99);

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_empty_metadata_is_omitted() {
        let msg = MessageDraft::new(Role::User, "hi").into_message(
            MessageId::new(),
            SessionId::new(),
            1,
        );
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("metadata"));
    }
}
