//! Per-sender dialogue state
//!
//! Each sender owns a small session: the current dialogue mode, the
//! instant of their last message, and the hits of their last search (for
//! numbered selection). Sessions expire back to [`SessionMode::Idle`]
//! after a configured inactivity window.
//!
//! Concurrency contract: the registry hands out one async mutex per
//! sender; the dispatcher holds it for the whole handling of a message,
//! which serializes concurrent deliveries from the same sender without
//! blocking anyone else.

use crate::provider::SearchHit;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Dialogue mode of one sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// No pending interaction
    #[default]
    Idle,
    /// The next plain-text message is a search query
    AwaitingSearchQuery,
    /// The next plain-text message is the drive credential
    AwaitingCookie,
}

/// Mutable session of one sender
#[derive(Debug)]
pub struct SessionEntry {
    /// Current dialogue mode
    pub mode: SessionMode,
    /// Instant of the sender's last handled message
    pub last_activity: Instant,
    /// Hits of the last search, kept for numbered selection
    pub search_hits: Vec<SearchHit>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            mode: SessionMode::Idle,
            last_activity: Instant::now(),
            search_hits: Vec::new(),
        }
    }
}

/// Registry of per-sender sessions.
pub struct SessionStore {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<SessionEntry>>>>,
    timeout: Duration,
}

impl SessionStore {
    /// Create a store whose sessions expire after `timeout_secs` of
    /// inactivity.
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// The session handle for a sender, created on first use.
    ///
    /// The inner registry lock is held only to clone the handle; callers
    /// then lock the per-sender mutex for the duration of their work.
    #[must_use]
    pub fn entry(&self, sender: &str) -> Arc<AsyncMutex<SessionEntry>> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(sender.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(SessionEntry::new())))
            .clone()
    }

    /// Expire a stale session back to [`SessionMode::Idle`].
    ///
    /// Call with the per-sender lock held, before interpreting a message.
    pub fn expire_if_stale(&self, sender: &str, entry: &mut SessionEntry) {
        if entry.last_activity.elapsed() <= self.timeout {
            return;
        }
        if entry.mode != SessionMode::Idle || !entry.search_hits.is_empty() {
            debug!(sender, "session expired; resetting to idle");
        }
        entry.mode = SessionMode::Idle;
        entry.search_hits.clear();
    }
}
