//! Local cache: the client's bounded, debounced mirror of a session.
//!
//! The cache is a hint, never authoritative: gateway responses win on
//! any conflict. Appends coalesce in memory and flush as one durable
//! write per session once the coalescing window elapses; a deliberate
//! shutdown flushes whatever is still pending.
//!
//! The durable tier sits behind [`CacheStorage`]. When it runs out of
//! space the cache evicts its largest stored sessions and retries, and
//! if that still fails it downgrades to a process-memory tier. Callers
//! never see a fatal error.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use colloquy_core::{Message, MessageId, SessionId};

use crate::error::CacheStorageError;

/// Sync status of a cached message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Sent (or queued) but not yet confirmed durable by the server.
    Pending,
    /// Echoed back by the server with its durable id.
    Confirmed,
}

/// A message as the client caches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub message: Message,
    pub sync_state: SyncState,
}

impl CachedMessage {
    /// A locally-created entry awaiting confirmation.
    pub fn pending(message: Message) -> Self {
        Self {
            message,
            sync_state: SyncState::Pending,
        }
    }

    /// A server-confirmed entry.
    pub fn confirmed(message: Message) -> Self {
        Self {
            message,
            sync_state: SyncState::Confirmed,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.sync_state == SyncState::Confirmed
    }
}

/// Durable tier of the local cache: one opaque record per session.
pub trait CacheStorage: Send {
    /// Write a session's record, replacing any previous one.
    fn write(&mut self, session_id: &SessionId, bytes: &[u8]) -> Result<(), CacheStorageError>;

    /// Read a session's record. `None` when nothing is stored.
    fn read(&mut self, session_id: &SessionId) -> Result<Option<Vec<u8>>, CacheStorageError>;

    /// Remove a session's record. Removing a missing record is fine.
    fn remove(&mut self, session_id: &SessionId) -> Result<(), CacheStorageError>;

    /// Stored sessions with their serialized sizes, for quota eviction.
    fn sizes(&mut self) -> Result<Vec<(SessionId, u64)>, CacheStorageError>;
}

/// Directory-backed storage: one CBOR file per session, with an
/// optional byte budget across all sessions.
pub struct DirCacheStorage {
    dir: PathBuf,
    max_bytes: Option<u64>,
}

impl DirCacheStorage {
    /// Open (creating if needed) a cache directory without a budget.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheStorageError> {
        Self::with_budget(dir, None)
    }

    /// Open a cache directory with a total byte budget.
    pub fn with_budget(
        dir: impl AsRef<Path>,
        max_bytes: Option<u64>,
    ) -> Result<Self, CacheStorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes })
    }

    fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.cbor"))
    }
}

impl CacheStorage for DirCacheStorage {
    fn write(&mut self, session_id: &SessionId, bytes: &[u8]) -> Result<(), CacheStorageError> {
        if let Some(budget) = self.max_bytes {
            let others: u64 = self
                .sizes()?
                .into_iter()
                .filter(|(id, _)| id != session_id)
                .map(|(_, size)| size)
                .sum();
            if others + bytes.len() as u64 > budget {
                return Err(CacheStorageError::QuotaExceeded);
            }
        }
        std::fs::write(self.path_for(session_id), bytes)?;
        Ok(())
    }

    fn read(&mut self, session_id: &SessionId) -> Result<Option<Vec<u8>>, CacheStorageError> {
        match std::fs::read(self.path_for(session_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, session_id: &SessionId) -> Result<(), CacheStorageError> {
        match std::fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sizes(&mut self) -> Result<Vec<(SessionId, u64)>, CacheStorageError> {
        let mut sizes = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(session_id) = SessionId::parse(stem) else {
                continue;
            };
            sizes.push((session_id, entry.metadata()?.len()));
        }
        Ok(sizes)
    }
}

/// Process-memory storage: the non-persistent fallback tier, also used
/// directly in tests.
#[derive(Default)]
pub struct MemoryCacheStorage {
    records: HashMap<SessionId, Vec<u8>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn write(&mut self, session_id: &SessionId, bytes: &[u8]) -> Result<(), CacheStorageError> {
        self.records.insert(*session_id, bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, session_id: &SessionId) -> Result<Option<Vec<u8>>, CacheStorageError> {
        Ok(self.records.get(session_id).cloned())
    }

    fn remove(&mut self, session_id: &SessionId) -> Result<(), CacheStorageError> {
        self.records.remove(session_id);
        Ok(())
    }

    fn sizes(&mut self) -> Result<Vec<(SessionId, u64)>, CacheStorageError> {
        Ok(self
            .records
            .iter()
            .map(|(id, bytes)| (*id, bytes.len() as u64))
            .collect())
    }
}

/// Configuration for cache behavior.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-session message cap; oldest entries are evicted beyond it.
    pub max_messages: usize,
    /// Coalescing window: appends within it collapse into one flush.
    pub flush_window: Duration,
    /// How many of the largest stored sessions to evict when the
    /// durable tier reports a quota failure.
    pub quota_evict_sessions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            flush_window: Duration::from_millis(300),
            quota_evict_sessions: 2,
        }
    }
}

struct CacheInner {
    storage: Box<dyn CacheStorage>,
    /// Whether `storage` is still the durable tier.
    durable: bool,
    sessions: HashMap<SessionId, Vec<CachedMessage>>,
    /// Sessions already read through from storage.
    loaded: HashSet<SessionId>,
    /// Flush deadlines for sessions with unwritten appends.
    dirty: HashMap<SessionId, Instant>,
}

/// Bounded, debounced per-session cache of conversation messages.
pub struct LocalCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl LocalCache {
    /// Create a cache over the given durable tier.
    pub fn new(storage: Box<dyn CacheStorage>, config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                storage,
                durable: true,
                sessions: HashMap::new(),
                loaded: HashSet::new(),
                dirty: HashMap::new(),
            }),
        }
    }

    /// A cache with no durable tier at all. Useful for tests.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Box::new(MemoryCacheStorage::new()), config)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one message, evicting the oldest entries beyond the cap
    /// and scheduling a debounced flush.
    pub fn append(&self, session_id: &SessionId, entry: CachedMessage) {
        let mut inner = self.lock();
        load_session(&mut inner, session_id, self.config.max_messages);

        let list = inner.sessions.entry(*session_id).or_default();
        list.push(entry);
        list.sort_by_key(|m| m.message.timestamp);
        trim_to_cap(list, self.config.max_messages);

        self.mark_dirty(&mut inner, session_id);
    }

    /// Apply a server confirmation. Resolves a pending entry through
    /// the metadata correlation id when present, otherwise upserts by
    /// durable id.
    pub fn confirm(&self, session_id: &SessionId, message: &Message) {
        let mut inner = self.lock();
        load_session(&mut inner, session_id, self.config.max_messages);

        let list = inner.sessions.entry(*session_id).or_default();
        let confirmed = CachedMessage::confirmed(message.clone());

        let slot = match message.client_id() {
            Some(provisional) => list
                .iter()
                .position(|m| !m.is_confirmed() && m.message.id == provisional),
            None => None,
        }
        .or_else(|| list.iter().position(|m| m.message.id == message.id));

        match slot {
            Some(i) => list[i] = confirmed,
            None => list.push(confirmed),
        }
        list.sort_by_key(|m| m.message.timestamp);
        trim_to_cap(list, self.config.max_messages);

        self.mark_dirty(&mut inner, session_id);
    }

    /// Atomically replace a session's contents (merge output).
    pub fn replace(&self, session_id: &SessionId, mut entries: Vec<CachedMessage>) {
        let mut inner = self.lock();
        trim_to_cap(&mut entries, self.config.max_messages);
        inner.sessions.insert(*session_id, entries);
        inner.loaded.insert(*session_id);
        self.mark_dirty(&mut inner, session_id);
    }

    /// The session's current ordered contents.
    pub fn messages(&self, session_id: &SessionId) -> Vec<CachedMessage> {
        let mut inner = self.lock();
        load_session(&mut inner, session_id, self.config.max_messages);
        inner.sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// The most recent confirmed message id, if any. This is the anchor
    /// for `sync_request` reconciliation.
    pub fn last_confirmed_id(&self, session_id: &SessionId) -> Option<MessageId> {
        self.messages(session_id)
            .iter()
            .rev()
            .find(|m| m.is_confirmed())
            .map(|m| m.message.id)
    }

    /// Drafts the session has recorded but the server has not confirmed.
    pub fn pending_messages(&self, session_id: &SessionId) -> Vec<Message> {
        self.messages(session_id)
            .into_iter()
            .filter(|m| !m.is_confirmed())
            .map(|m| m.message)
            .collect()
    }

    /// Drop the session from both tiers.
    pub fn reset(&self, session_id: &SessionId) {
        let mut inner = self.lock();
        inner.sessions.remove(session_id);
        inner.loaded.insert(*session_id);
        inner.dirty.remove(session_id);
        if let Err(e) = inner.storage.remove(session_id) {
            tracing::warn!(session = %session_id.short(), error = %e, "cache reset failed");
        }
    }

    /// Flush every session whose coalescing window has elapsed.
    /// Returns how many sessions were written.
    pub fn flush_due(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let due: Vec<SessionId> = inner
            .dirty
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for session_id in &due {
            flush_session(&mut inner, session_id, &self.config);
        }
        due.len()
    }

    /// Flush everything still pending. Called on deliberate shutdown.
    pub fn flush_all(&self) {
        let mut inner = self.lock();
        let dirty: Vec<SessionId> = inner.dirty.keys().copied().collect();
        for session_id in &dirty {
            flush_session(&mut inner, session_id, &self.config);
        }
    }

    /// Whether the durable tier is still in use (false after a quota
    /// downgrade).
    pub fn is_durable(&self) -> bool {
        self.lock().durable
    }

    /// Next pending flush deadline, if any. The driver uses this for
    /// its flush timer.
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        self.lock().dirty.values().min().copied()
    }

    fn mark_dirty(&self, inner: &mut CacheInner, session_id: &SessionId) {
        // First write in a window sets the deadline; later writes
        // coalesce into it rather than pushing it out.
        inner
            .dirty
            .entry(*session_id)
            .or_insert_with(|| Instant::now() + self.config.flush_window);
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}

fn trim_to_cap(list: &mut Vec<CachedMessage>, cap: usize) {
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

/// Read a session through from storage, dropping records that fail
/// shape validation.
fn load_session(inner: &mut CacheInner, session_id: &SessionId, cap: usize) {
    if inner.loaded.contains(session_id) {
        return;
    }
    inner.loaded.insert(*session_id);

    let bytes = match inner.storage.read(session_id) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(session = %session_id.short(), error = %e, "cache read failed");
            return;
        }
    };

    let raw: Vec<ciborium::Value> = match ciborium::from_reader(bytes.as_slice()) {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!(session = %session_id.short(), error = %e, "cache record unreadable, discarding");
            return;
        }
    };

    let mut list = Vec::with_capacity(raw.len());
    let mut dropped = 0usize;
    for value in raw {
        // Typed decode enforces the shape rules: role must be one of
        // the three allowed values and content must be text.
        match value.deserialized::<CachedMessage>() {
            Ok(entry) => list.push(entry),
            Err(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::warn!(session = %session_id.short(), dropped, "dropped invalid cache records");
    }

    list.sort_by_key(|m| m.message.timestamp);
    trim_to_cap(&mut list, cap);
    inner.sessions.insert(*session_id, list);
}

/// Write one session's full current list, applying the quota policy:
/// evict the largest stored sessions and retry once, then downgrade to
/// the memory tier. Never fails the caller.
fn flush_session(inner: &mut CacheInner, session_id: &SessionId, config: &CacheConfig) {
    inner.dirty.remove(session_id);

    let Some(list) = inner.sessions.get(session_id) else {
        return;
    };

    let mut bytes = Vec::new();
    if let Err(e) = ciborium::into_writer(list, &mut bytes) {
        tracing::warn!(session = %session_id.short(), error = %e, "cache encode failed");
        return;
    }

    match inner.storage.write(session_id, &bytes) {
        Ok(()) => return,
        Err(CacheStorageError::QuotaExceeded) => {}
        Err(e) => {
            tracing::warn!(session = %session_id.short(), error = %e, "cache flush failed");
            return;
        }
    }

    // Quota pressure: free the biggest stored sessions first (not
    // necessarily the current one) and retry once.
    if let Ok(mut sizes) = inner.storage.sizes() {
        sizes.retain(|(id, _)| id != session_id);
        sizes.sort_by_key(|(_, size)| std::cmp::Reverse(*size));
        for (victim, size) in sizes.into_iter().take(config.quota_evict_sessions) {
            tracing::warn!(session = %victim.short(), size, "evicting cached session for quota");
            let _ = inner.storage.remove(&victim);
        }
    }

    match inner.storage.write(session_id, &bytes) {
        Ok(()) => return,
        Err(e) => {
            tracing::warn!(session = %session_id.short(), error = %e, "quota persists, downgrading cache to memory tier");
        }
    }

    // Last resort: session-lifetime storage only.
    let mut memory = MemoryCacheStorage::new();
    let _ = memory.write(session_id, &bytes);
    inner.storage = Box::new(memory);
    inner.durable = false;
}
