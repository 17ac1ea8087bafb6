//! Store trait: the abstract interface for durable conversation history.
//!
//! This trait keeps the gateway storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;

use colloquy_core::{Message, MessageDraft, MessageId, SessionId, SessionMeta};

use crate::error::Result;

/// Page size limits for listing operations.
pub mod limits {
    /// Max messages per page.
    pub const MAX_MESSAGE_PAGE: u32 = 500;
    /// Default messages per page.
    pub const DEFAULT_MESSAGE_PAGE: u32 = 200;
    /// Max sessions per page.
    pub const MAX_SESSION_PAGE: u32 = 100;
    /// Default sessions per page.
    pub const DEFAULT_SESSION_PAGE: u32 = 20;
}

/// Pagination parameters for listing operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageQuery {
    /// Requested page size. Clamped to the operation's maximum;
    /// `None` means the operation's default.
    pub limit: Option<u32>,
    /// Number of leading entries to skip.
    pub offset: u64,
}

impl PageQuery {
    /// A query for the first `limit` entries.
    pub fn limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            offset: 0,
        }
    }

    /// Resolve the effective page size against a default and a cap.
    pub fn effective_limit(&self, default: u32, max: u32) -> u32 {
        self.limit.unwrap_or(default).min(max)
    }
}

/// One page of messages plus pagination bookkeeping.
#[derive(Debug, Clone)]
pub struct MessagePage {
    /// The page contents, ascending by timestamp.
    pub messages: Vec<Message>,
    /// Total persisted messages for the session.
    pub total: u64,
    /// Whether entries exist beyond this page.
    pub has_more: bool,
}

/// The Store trait: async interface for conversation persistence.
///
/// All methods are async to support both blocking (SQLite via
/// `spawn_blocking`) and natively async backends.
///
/// # Design Notes
///
/// - **Atomic appends**: a message insert and its session-metadata update
///   commit or roll back together.
/// - **Monotonic timestamps**: persisted timestamps never decrease within
///   a session; concurrent appends to one session serialize.
/// - **Soft delete**: sessions are deactivated, never removed; messages
///   are immutable except for the explicit reset operation.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a session or update an existing one.
    ///
    /// Non-null arguments overwrite stored fields; `is_active` is forced
    /// back to true. A missing name on create falls back to the
    /// generated label.
    async fn create_or_update_session(
        &self,
        session_id: &SessionId,
        name: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<()>;

    /// Rename a session (creates it when absent).
    async fn rename_session(&self, session_id: &SessionId, name: &str) -> Result<()>;

    /// Fetch a single session's metadata.
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionMeta>>;

    /// List active sessions, most recently active first, optionally
    /// filtered by user.
    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        page: PageQuery,
    ) -> Result<Vec<SessionMeta>>;

    /// Deactivate a session. Its messages are kept.
    async fn soft_delete_session(&self, session_id: &SessionId) -> Result<()>;

    /// Purge all message rows for a session and clear its preview and
    /// last-activity marker. The one deliberate exception to message
    /// immutability.
    async fn reset_session_messages(&self, session_id: &SessionId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Message Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist one message.
    ///
    /// Assigns the durable id and a timestamp no earlier than the
    /// session's current maximum, creates the session row when absent,
    /// and updates `last_message_at`/`preview` for user/assistant roles,
    /// all in one atomic unit. Returns the persisted message.
    async fn append_message(&self, session_id: &SessionId, draft: MessageDraft)
        -> Result<Message>;

    /// Persist an ordered batch of messages.
    ///
    /// Best-effort per item: returns the ids that were persisted, and
    /// fails only when zero items succeeded.
    async fn append_messages(
        &self,
        session_id: &SessionId,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<MessageId>>;

    /// One page of a session's messages, ascending by timestamp.
    async fn list_messages(&self, session_id: &SessionId, page: PageQuery) -> Result<MessagePage>;

    /// The most recent `limit` messages, ascending by timestamp.
    async fn recent_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Message>>;

    /// All messages strictly after the given id, in persisted order.
    ///
    /// Returns `None` when the id is not part of the persisted sequence,
    /// so the caller can fall back to a full history fetch instead of
    /// silently returning nothing.
    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Option<Vec<Message>>>;

    /// Number of persisted messages for a session.
    async fn message_count(&self, session_id: &SessionId) -> Result<u64>;
}
