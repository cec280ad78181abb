//! Per-user session state with independent per-field TTLs.
//!
//! Storage sits behind [`SessionBackend`] so the in-memory [`TtlCache`] can be
//! swapped for another keyed store. [`SessionStore`] is the typed facade the
//! pipeline talks to. Every read of an absent or expired field returns that
//! field's zero value (`""`, `0`); callers treat it as a fresh session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::SessionTtls;

/// Default display name when none has been set or it has expired.
pub const DEFAULT_DISPLAY_NAME: &str = "chat-gpt";

/// Cap for lifetimes too large to add to the clock.
const MAX_ENTRY_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Which piece of a user's session a key addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionField {
    Mode,
    Context,
    RequestCount,
    DisplayName,
    /// Last answer/thread id for one thread kind (the chat title).
    AnswerId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub field: SessionField,
}

impl SessionKey {
    pub fn new(user_id: &str, field: SessionField) -> Self {
        Self { user_id: user_id.to_string(), field }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionValue {
    Text(String),
    Count(u32),
    ThreadId(u64),
}

/// Keyed store with per-entry expiry.
pub trait SessionBackend: Send + Sync {
    /// `None` when the key is absent or expired.
    fn get(&self, key: &SessionKey) -> Option<SessionValue>;
    fn set(&self, key: SessionKey, value: SessionValue, ttl: Duration);
    fn clear(&self, key: &SessionKey);
    /// Drops expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

struct Entry {
    value: SessionValue,
    expires_at: Instant,
}

/// In-process TTL cache. Expired entries are invisible to reads immediately
/// and reclaimed by [`SessionBackend::purge_expired`].
#[derive(Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<SessionKey, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionBackend for TtlCache {
    fn get(&self, key: &SessionKey) -> Option<SessionValue> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: SessionKey, value: SessionValue, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(MAX_ENTRY_TTL))
            .unwrap_or(now);
        entries.insert(key, Entry { value, expires_at });
    }

    fn clear(&self, key: &SessionKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

/// Typed session accessors over a [`SessionBackend`].
///
/// Constructed once at startup and shared by handle. Each call is one round
/// trip to the backend; nothing here spans a read-modify-write.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    ttls: SessionTtls,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, ttls: SessionTtls) -> Self {
        Self { backend, ttls }
    }

    /// In-memory store with the given TTLs.
    pub fn in_memory(ttls: SessionTtls) -> Self {
        Self::new(Arc::new(TtlCache::new()), ttls)
    }

    fn text(&self, user_id: &str, field: SessionField) -> String {
        match self.backend.get(&SessionKey::new(user_id, field)) {
            Some(SessionValue::Text(s)) => s,
            _ => String::new(),
        }
    }

    // ==================== MODE ====================

    /// Empty string when unset.
    pub fn mode(&self, user_id: &str) -> String {
        self.text(user_id, SessionField::Mode)
    }

    pub fn set_mode(&self, user_id: &str, mode: &str) {
        self.backend.set(
            SessionKey::new(user_id, SessionField::Mode),
            SessionValue::Text(mode.to_string()),
            self.ttls.mode,
        );
    }

    pub fn clear_mode(&self, user_id: &str) {
        self.backend.clear(&SessionKey::new(user_id, SessionField::Mode));
    }

    // ==================== CONTEXT ====================

    /// Empty string when unset.
    pub fn context(&self, user_id: &str) -> String {
        self.text(user_id, SessionField::Context)
    }

    pub fn set_context(&self, user_id: &str, context: &str) {
        self.backend.set(
            SessionKey::new(user_id, SessionField::Context),
            SessionValue::Text(context.to_string()),
            self.ttls.context,
        );
    }

    pub fn clear_context(&self, user_id: &str) {
        self.backend.clear(&SessionKey::new(user_id, SessionField::Context));
    }

    // ==================== REQUEST COUNT ====================

    /// Zero when unset.
    pub fn request_count(&self, user_id: &str) -> u32 {
        match self.backend.get(&SessionKey::new(user_id, SessionField::RequestCount)) {
            Some(SessionValue::Count(n)) => n,
            _ => 0,
        }
    }

    pub fn set_request_count(&self, user_id: &str, count: u32) {
        self.backend.set(
            SessionKey::new(user_id, SessionField::RequestCount),
            SessionValue::Count(count),
            self.ttls.request_count,
        );
    }

    // ==================== ANSWER ID ====================

    /// Zero when unset.
    pub fn answer_id(&self, user_id: &str, thread_kind: &str) -> u64 {
        let key = SessionKey::new(user_id, SessionField::AnswerId(thread_kind.to_string()));
        match self.backend.get(&key) {
            Some(SessionValue::ThreadId(id)) => id,
            _ => 0,
        }
    }

    pub fn set_answer_id(&self, user_id: &str, thread_kind: &str, id: u64) {
        self.backend.set(
            SessionKey::new(user_id, SessionField::AnswerId(thread_kind.to_string())),
            SessionValue::ThreadId(id),
            self.ttls.answer_id,
        );
    }

    pub fn clear_answer_id(&self, user_id: &str, thread_kind: &str) {
        self.backend
            .clear(&SessionKey::new(user_id, SessionField::AnswerId(thread_kind.to_string())));
    }

    // ==================== DISPLAY NAME ====================

    /// [`DEFAULT_DISPLAY_NAME`] when unset.
    pub fn display_name(&self, user_id: &str) -> String {
        let name = self.text(user_id, SessionField::DisplayName);
        if name.is_empty() {
            DEFAULT_DISPLAY_NAME.to_string()
        } else {
            name
        }
    }

    pub fn set_display_name(&self, user_id: &str, name: &str) {
        self.backend.set(
            SessionKey::new(user_id, SessionField::DisplayName),
            SessionValue::Text(name.to_string()),
            self.ttls.display_name,
        );
    }

    pub fn purge_expired(&self) -> usize {
        let removed = self.backend.purge_expired();
        if removed > 0 {
            debug!("🧹 Purged {} expired session entries", removed);
        }
        removed
    }
}
