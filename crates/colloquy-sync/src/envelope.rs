//! Sync protocol envelope types.
//!
//! Every frame on the duplex channel is one JSON object tagged by a
//! `type` field. A channel is bound to exactly one session for its
//! lifetime, so envelopes never carry a session id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use colloquy_core::{Message, MessageDraft, MessageId, Role};

use crate::error::SyncError;

/// Default number of messages returned for a history request that does
/// not name a limit, and for the full-reconciliation fallback.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Frame size limit. Oversized frames are rejected at decode and the
/// connection stays open.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Sync protocol envelopes.
///
/// Direction notes:
/// - `Message` travels both ways: the client sends it without `id` and
///   `timestamp`; the gateway persists it and sends the same envelope
///   type back with both filled in. That echo is the durable
///   confirmation, and is also fanned out to other channels bound to the
///   same session.
/// - `HistoryRequest`/`SyncRequest` are client→server; `History`/
///   `SyncResponse` are the answers. A `SyncRequest` whose
///   `last_message_id` cannot be located is answered with the most
///   recent [`DEFAULT_HISTORY_LIMIT`] messages instead of an empty set,
///   forcing a full reconciliation.
/// - `Heartbeat` travels both ways and is echoed immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A conversation message, provisional or confirmed.
    Message(MessagePayload),

    /// Request for the most recent persisted messages.
    HistoryRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Answer to `HistoryRequest`: ascending by timestamp.
    History { messages: Vec<Message> },

    /// Request for everything after a known message.
    SyncRequest {
        last_message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Answer to `SyncRequest`: ascending by timestamp.
    SyncResponse { messages: Vec<Message> },

    /// Liveness probe, echoed with no other state change.
    Heartbeat,
}

impl Envelope {
    /// Encode to a wire frame.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Decode a wire frame, enforcing the size limit.
    pub fn decode(frame: &str) -> Result<Self, SyncError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(SyncError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        serde_json::from_str(frame).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Message(_) => "message",
            Envelope::HistoryRequest { .. } => "history_request",
            Envelope::History { .. } => "history",
            Envelope::SyncRequest { .. } => "sync_request",
            Envelope::SyncResponse { .. } => "sync_response",
            Envelope::Heartbeat => "heartbeat",
        }
    }
}

/// Body of a `message` envelope.
///
/// `id` and `timestamp` are absent on the client→server leg and present
/// on every server→client leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    pub role: Role,

    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl MessagePayload {
    /// The client→server form of a draft.
    pub fn outbound(draft: &MessageDraft) -> Self {
        Self {
            id: None,
            role: draft.role,
            content: draft.content.clone(),
            agent_name: draft.agent_name.clone(),
            timestamp: None,
            metadata: draft.metadata.clone(),
        }
    }

    /// The server→client confirmation of a persisted message.
    pub fn confirmed(message: &Message) -> Self {
        Self {
            id: Some(message.id),
            role: message.role,
            content: message.content.clone(),
            agent_name: message.agent_name.clone(),
            timestamp: Some(message.timestamp),
            metadata: message.metadata.clone(),
        }
    }

    /// Whether this payload carries a durable confirmation.
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some() && self.timestamp.is_some()
    }

    /// Convert into append parameters, dropping any id/timestamp the
    /// peer may have speculated.
    pub fn into_draft(self) -> MessageDraft {
        MessageDraft {
            role: self.role,
            content: self.content,
            agent_name: self.agent_name,
            user_id: None,
            metadata: self.metadata,
        }
    }
}
