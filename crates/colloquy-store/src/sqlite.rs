//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for Colloquy. It uses rusqlite
//! with bundled SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! A single connection behind a mutex serializes all writes, which
//! covers the per-session append serialization the protocol relies on:
//! timestamps and preview updates for one session can never commit out
//! of order.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use colloquy_core::{
    default_label, preview_of, Message, MessageDraft, MessageId, SessionId, SessionMeta,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{limits, MessagePage, PageQuery, Store};

/// SQLite-based store implementation.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async
    /// runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection mutex poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }
}

// Helper to convert a row to Message. Column order must match MESSAGE_COLUMNS.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let invalid = |name: &str| {
        rusqlite::Error::InvalidColumnType(0, name.to_string(), rusqlite::types::Type::Text)
    };

    let id_text: String = row.get("message_id")?;
    let session_text: String = row.get("session_id")?;
    let role_text: String = row.get("role")?;
    let metadata_text: String = row.get("metadata")?;

    Ok(Message {
        id: MessageId::parse(&id_text).map_err(|_| invalid("message_id"))?,
        session_id: SessionId::parse(&session_text).map_err(|_| invalid("session_id"))?,
        role: role_text.parse().map_err(|_| invalid("role"))?,
        content: row.get("content")?,
        agent_name: row.get("agent_name")?,
        user_id: row.get("user_id")?,
        timestamp: row.get("timestamp")?,
        metadata: serde_json::from_str(&metadata_text).unwrap_or_default(),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMeta> {
    let invalid = |name: &str| {
        rusqlite::Error::InvalidColumnType(0, name.to_string(), rusqlite::types::Type::Text)
    };

    let id_text: String = row.get("session_id")?;

    Ok(SessionMeta {
        session_id: SessionId::parse(&id_text).map_err(|_| invalid("session_id"))?,
        name: row.get("name")?,
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        last_message_at: row.get("last_message_at")?,
        preview: row.get("preview")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

const MESSAGE_COLUMNS: &str =
    "message_id, session_id, role, content, agent_name, user_id, timestamp, metadata";

const SESSION_COLUMNS: &str =
    "session_id, name, user_id, created_at, last_message_at, preview, is_active";

fn encode_metadata(message: &Message) -> String {
    Value::Object(message.metadata.clone()).to_string()
}

/// Insert one message and apply its session side effects inside an open
/// transaction. Shared by the single and batch append paths.
fn append_in_tx(
    tx: &rusqlite::Transaction<'_>,
    session_id: &SessionId,
    draft: MessageDraft,
) -> Result<Message> {
    // Clamp the timestamp so persisted order is non-decreasing even if
    // the wall clock steps backwards between appends.
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(timestamp) FROM messages WHERE session_id = ?1",
        params![session_id.to_string()],
        |row| row.get(0),
    )?;
    let timestamp = last.map_or_else(now_millis, |t| now_millis().max(t));

    let message = draft.into_message(MessageId::new(), *session_id, timestamp);

    tx.execute(
        "INSERT INTO messages (message_id, session_id, role, content, agent_name,
                               user_id, timestamp, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.id.to_string(),
            message.session_id.to_string(),
            message.role.as_str(),
            &message.content,
            message.agent_name.as_deref(),
            message.user_id.as_deref(),
            message.timestamp,
            encode_metadata(&message),
        ],
    )?;

    // The session row must exist before its metadata can be updated.
    tx.execute(
        "INSERT INTO sessions (session_id, name, user_id, created_at, is_active)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(session_id) DO NOTHING",
        params![
            session_id.to_string(),
            default_label(session_id),
            message.user_id.as_deref(),
            message.timestamp,
        ],
    )?;

    if message.role.updates_preview() {
        tx.execute(
            "UPDATE sessions SET last_message_at = ?2, preview = ?3 WHERE session_id = ?1",
            params![
                session_id.to_string(),
                message.timestamp,
                preview_of(&message.content),
            ],
        )?;
    }

    Ok(message)
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_or_update_session(
        &self,
        session_id: &SessionId,
        name: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<()> {
        let session_id = *session_id;
        let name = name.map(str::to_string);
        let user_id = user_id.map(str::to_string);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, name, user_id, created_at, is_active)
                 VALUES (?1, COALESCE(?2, ?4), ?3, ?5, 1)
                 ON CONFLICT(session_id) DO UPDATE SET
                    name = COALESCE(?2, name),
                    user_id = COALESCE(?3, user_id),
                    is_active = 1",
                params![
                    session_id.to_string(),
                    name.as_deref(),
                    user_id.as_deref(),
                    default_label(&session_id),
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn rename_session(&self, session_id: &SessionId, name: &str) -> Result<()> {
        self.create_or_update_session(session_id, Some(name), None)
            .await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        page: PageQuery,
    ) -> Result<Vec<SessionMeta>> {
        let user_id = user_id.map(str::to_string);
        let limit = page.effective_limit(limits::DEFAULT_SESSION_PAGE, limits::MAX_SESSION_PAGE);
        let offset = page.offset;

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE is_active = 1 AND (?1 IS NULL OR user_id = ?1)
                 ORDER BY COALESCE(last_message_at, created_at) DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;

            let sessions = stmt
                .query_map(
                    params![user_id.as_deref(), limit as i64, offset as i64],
                    row_to_session,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(sessions)
        })
        .await
    }

    async fn soft_delete_session(&self, session_id: &SessionId) -> Result<()> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE session_id = ?1",
                params![session_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn reset_session_messages(&self, session_id: &SessionId) -> Result<()> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id.to_string()],
            )?;
            tx.execute(
                "UPDATE sessions SET preview = NULL, last_message_at = NULL
                 WHERE session_id = ?1",
                params![session_id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        draft: MessageDraft,
    ) -> Result<Message> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let message = append_in_tx(&tx, &session_id, draft)?;
            tx.commit()?;
            Ok(message)
        })
        .await
    }

    async fn append_messages(
        &self,
        session_id: &SessionId,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<MessageId>> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            let mut ids = Vec::with_capacity(drafts.len());
            let mut last_err = None;

            for draft in drafts {
                // Each item commits on its own; the batch fails only when
                // nothing went through.
                let result = conn
                    .transaction()
                    .map_err(StoreError::from)
                    .and_then(|tx| {
                        let message = append_in_tx(&tx, &session_id, draft)?;
                        tx.commit()?;
                        Ok(message)
                    });

                match result {
                    Ok(message) => ids.push(message.id),
                    Err(e) => {
                        tracing::warn!(session = %session_id.short(), error = %e, "batch append item failed");
                        last_err = Some(e);
                    }
                }
            }

            match (ids.is_empty(), last_err) {
                (true, Some(e)) => Err(e),
                _ => Ok(ids),
            }
        })
        .await
    }

    async fn list_messages(&self, session_id: &SessionId, page: PageQuery) -> Result<MessagePage> {
        let session_id = *session_id;
        let limit = page.effective_limit(limits::DEFAULT_MESSAGE_PAGE, limits::MAX_MESSAGE_PAGE);
        let offset = page.offset;

        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                 ORDER BY timestamp, rowid
                 LIMIT ?2 OFFSET ?3"
            ))?;

            let messages = stmt
                .query_map(
                    params![session_id.to_string(), limit as i64, offset as i64],
                    row_to_message,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let has_more = offset + (messages.len() as u64) < total as u64;

            Ok(MessagePage {
                messages,
                total: total as u64,
                has_more,
            })
        })
        .await
    }

    async fn recent_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Message>> {
        let session_id = *session_id;
        let limit = limit.min(limits::MAX_MESSAGE_PAGE);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?2"
            ))?;

            let mut messages = stmt
                .query_map(params![session_id.to_string(), limit as i64], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            // Fetched newest-first; callers get ascending order.
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Option<Vec<Message>>> {
        let session_id = *session_id;
        let after = *after;

        self.with_conn(move |conn| {
            let anchor: Option<i64> = conn
                .query_row(
                    "SELECT rowid FROM messages WHERE message_id = ?1 AND session_id = ?2",
                    params![after.to_string(), session_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(anchor) = anchor else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND rowid > ?2
                 ORDER BY timestamp, rowid"
            ))?;

            let messages = stmt
                .query_map(params![session_id.to_string(), anchor], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(messages))
        })
        .await
    }

    async fn message_count(&self, session_id: &SessionId) -> Result<u64> {
        let session_id = *session_id;

        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}
