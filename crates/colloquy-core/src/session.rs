//! Session metadata: the listable surface of a conversation.

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Maximum preview length in characters, before the ellipsis marker.
pub const PREVIEW_MAX_CHARS: usize = 100;

/// Metadata row for a session.
///
/// `last_message_at` and `preview` change only as a side effect of a
/// successful user/assistant append. Soft delete flips `is_active` and
/// nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,

    /// Display name. Defaults to a label derived from the id.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Unix milliseconds.
    pub created_at: i64,

    /// Unix milliseconds of the latest user/assistant append, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,

    /// Truncated content of the latest user/assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,

    pub is_active: bool,
}

impl SessionMeta {
    /// A fresh, active session with the default label.
    pub fn new(session_id: SessionId, created_at: i64) -> Self {
        Self {
            session_id,
            name: default_label(&session_id),
            user_id: None,
            created_at,
            last_message_at: None,
            preview: None,
            is_active: true,
        }
    }

    /// The sort key for session listings: latest activity, else creation.
    pub fn activity_key(&self) -> i64 {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// The generated label used when a session is created without a name.
pub fn default_label(session_id: &SessionId) -> String {
    format!("Conversation {}", session_id.short())
}

/// Derive the preview text for a message content: the first
/// [`PREVIEW_MAX_CHARS`] characters, with an ellipsis marker when
/// truncated. Operates on characters, not bytes, so multibyte content
/// never splits mid-codepoint.
pub fn preview_of(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
