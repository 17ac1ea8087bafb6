//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence. It also exposes a
//! failure-injection switch so tests can exercise the append atomicity
//! contract without a real backend outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use colloquy_core::{
    preview_of, Message, MessageDraft, MessageId, SessionId, SessionMeta,
};

use crate::error::{Result, StoreError};
use crate::traits::{limits, MessagePage, PageQuery, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    /// When set, the session-metadata half of an append fails, forcing
    /// the whole append to roll back.
    fail_session_updates: AtomicBool,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Session metadata keyed by id.
    sessions: HashMap<SessionId, SessionMeta>,

    /// Message log per session, in persisted order.
    messages: HashMap<SessionId, Vec<Message>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            fail_session_updates: AtomicBool::new(false),
        }
    }

    /// Force every subsequent session-metadata update to fail. The
    /// paired message insert must roll back with it.
    pub fn fail_session_updates(&self, fail: bool) {
        self.fail_session_updates.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one draft under an already-held write lock. Returns without
/// mutating anything when the injected metadata failure fires.
fn append_locked(
    inner: &mut MemoryStoreInner,
    session_id: &SessionId,
    draft: MessageDraft,
    fail_session_update: bool,
) -> Result<Message> {
    let last = inner
        .messages
        .get(session_id)
        .and_then(|log| log.last())
        .map(|m| m.timestamp);
    let timestamp = last.map_or_else(now_millis, |t| now_millis().max(t));

    let message = draft.into_message(MessageId::new(), *session_id, timestamp);

    if fail_session_update {
        // The metadata update and the insert are one atomic unit; a
        // failed update means no message row either.
        return Err(StoreError::Unavailable(
            "session metadata update failed".to_string(),
        ));
    }

    let meta = inner
        .sessions
        .entry(*session_id)
        .or_insert_with(|| {
            let mut meta = SessionMeta::new(*session_id, timestamp);
            meta.user_id = message.user_id.clone();
            meta
        });

    if message.role.updates_preview() {
        meta.last_message_at = Some(timestamp);
        meta.preview = Some(preview_of(&message.content));
    }

    inner
        .messages
        .entry(*session_id)
        .or_default()
        .push(message.clone());

    Ok(message)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_or_update_session(
        &self,
        session_id: &SessionId,
        name: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.write();

        let meta = inner
            .sessions
            .entry(*session_id)
            .or_insert_with(|| SessionMeta::new(*session_id, now_millis()));

        if let Some(name) = name {
            meta.name = name.to_string();
        }
        if let Some(user_id) = user_id {
            meta.user_id = Some(user_id.to_string());
        }
        meta.is_active = true;

        Ok(())
    }

    async fn rename_session(&self, session_id: &SessionId, name: &str) -> Result<()> {
        self.create_or_update_session(session_id, Some(name), None)
            .await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        Ok(self.read().sessions.get(session_id).cloned())
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        page: PageQuery,
    ) -> Result<Vec<SessionMeta>> {
        let limit = page.effective_limit(limits::DEFAULT_SESSION_PAGE, limits::MAX_SESSION_PAGE);

        let inner = self.read();
        let mut sessions: Vec<SessionMeta> = inner
            .sessions
            .values()
            .filter(|s| s.is_active)
            .filter(|s| user_id.is_none() || s.user_id.as_deref() == user_id)
            .cloned()
            .collect();

        sessions.sort_by_key(|s| std::cmp::Reverse(s.activity_key()));

        Ok(sessions
            .into_iter()
            .skip(page.offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn soft_delete_session(&self, session_id: &SessionId) -> Result<()> {
        if let Some(meta) = self.write().sessions.get_mut(session_id) {
            meta.is_active = false;
        }
        Ok(())
    }

    async fn reset_session_messages(&self, session_id: &SessionId) -> Result<()> {
        let mut inner = self.write();
        inner.messages.remove(session_id);
        if let Some(meta) = inner.sessions.get_mut(session_id) {
            meta.preview = None;
            meta.last_message_at = None;
        }
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        draft: MessageDraft,
    ) -> Result<Message> {
        let fail = self.fail_session_updates.load(Ordering::SeqCst);
        let mut inner = self.write();
        append_locked(&mut inner, session_id, draft, fail)
    }

    async fn append_messages(
        &self,
        session_id: &SessionId,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<MessageId>> {
        let fail = self.fail_session_updates.load(Ordering::SeqCst);
        let mut inner = self.write();

        let mut ids = Vec::with_capacity(drafts.len());
        let mut last_err = None;

        for draft in drafts {
            match append_locked(&mut inner, session_id, draft, fail) {
                Ok(message) => ids.push(message.id),
                Err(e) => last_err = Some(e),
            }
        }

        match (ids.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(ids),
        }
    }

    async fn list_messages(&self, session_id: &SessionId, page: PageQuery) -> Result<MessagePage> {
        let limit = page.effective_limit(limits::DEFAULT_MESSAGE_PAGE, limits::MAX_MESSAGE_PAGE);

        let inner = self.read();
        let log = inner.messages.get(session_id);
        let total = log.map_or(0, |l| l.len()) as u64;

        let messages: Vec<Message> = log
            .map(|l| {
                l.iter()
                    .skip(page.offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let has_more = page.offset + (messages.len() as u64) < total;

        Ok(MessagePage {
            messages,
            total,
            has_more,
        })
    }

    async fn recent_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Message>> {
        let limit = limit.min(limits::MAX_MESSAGE_PAGE) as usize;

        let inner = self.read();
        let log = inner.messages.get(session_id);

        Ok(log
            .map(|l| {
                let start = l.len().saturating_sub(limit);
                l[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Option<Vec<Message>>> {
        let inner = self.read();
        let Some(log) = inner.messages.get(session_id) else {
            return Ok(None);
        };

        let Some(position) = log.iter().position(|m| m.id == *after) else {
            return Ok(None);
        };

        Ok(Some(log[position + 1..].to_vec()))
    }

    async fn message_count(&self, session_id: &SessionId) -> Result<u64> {
        Ok(self
            .read()
            .messages
            .get(session_id)
            .map_or(0, |l| l.len()) as u64)
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

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::Role;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        let session = SessionId::new();

        let appended = store
            .append_message(&session, MessageDraft::new(Role::User, "hello"))
            .await
            .unwrap();

        let page = store
            .list_messages(&session, PageQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, appended.id);
    }

    #[tokio::test]
    async fn test_append_atomicity_on_metadata_failure() {
        let store = MemoryStore::new();
        let session = SessionId::new();

        store.fail_session_updates(true);
        let err = store
            .append_message(&session, MessageDraft::new(Role::User, "lost"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        // Full rollback: no message row, no session row.
        let page = store
            .list_messages(&session, PageQuery::default())
            .await
            .unwrap();
        assert!(page.messages.is_empty());
        assert!(store.get_session(&session).await.unwrap().is_none());

        // Recovery once the backend heals.
        store.fail_session_updates(false);
        store
            .append_message(&session, MessageDraft::new(Role::User, "kept"))
            .await
            .unwrap();
        assert_eq!(store.message_count(&session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_fails_only_when_nothing_succeeds() {
        let store = MemoryStore::new();
        let session = SessionId::new();

        store.fail_session_updates(true);
        let err = store
            .append_messages(
                &session,
                vec![
                    MessageDraft::new(Role::User, "a"),
                    MessageDraft::new(Role::User, "b"),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(store.message_count(&session).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_after_matches_sqlite_contract() {
        let store = MemoryStore::new();
        let session = SessionId::new();

        let first = store
            .append_message(&session, MessageDraft::new(Role::User, "one"))
            .await
            .unwrap();
        let second = store
            .append_message(&session, MessageDraft::new(Role::Assistant, "two"))
            .await
            .unwrap();

        let after = store
            .messages_after(&session, &first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after, vec![second]);

        assert!(store
            .messages_after(&session, &MessageId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_filters_user() {
        let store = MemoryStore::new();
        let mine = SessionId::new();
        let other = SessionId::new();

        store
            .create_or_update_session(&mine, None, Some("u-1"))
            .await
            .unwrap();
        store
            .create_or_update_session(&other, None, Some("u-2"))
            .await
            .unwrap();

        let listed = store
            .list_sessions(Some("u-1"), PageQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, mine);
    }
}
