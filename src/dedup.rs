//! Suppression of retried webhook deliveries
//!
//! The platform retries a callback whenever the response is slow, so the
//! same message id can arrive several times. The first delivery claims the
//! id atomically; later deliveries either replay the finished reply or get
//! a neutral "still processing" answer. The record is bounded in size and
//! expires after a configured window.

use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;

/// Processing state remembered for one message id
#[derive(Clone)]
enum Delivery {
    /// The first delivery is still being handled
    InFlight,
    /// Handling finished with this reply
    Replied(Arc<str>),
}

/// Outcome of claiming a message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This delivery is the first one; the caller must process it
    First,
    /// Another delivery of the same id is still being processed
    InFlight,
    /// The id was already processed; replay this reply
    Replied(Arc<str>),
}

/// Bounded, time-windowed record of recently seen message ids.
#[derive(Clone)]
pub struct MessageDedup {
    cache: Cache<String, Delivery>,
}

impl MessageDedup {
    /// Create a deduplicator with the given retention window and capacity.
    #[must_use]
    pub fn new(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(std::time::Duration::from_secs(ttl_secs))
            .build();
        Self { cache }
    }

    /// Atomically claim a message id.
    ///
    /// Exactly one of two concurrent claims of the same id observes
    /// [`Claim::First`]; the other observes [`Claim::InFlight`] (or the
    /// cached reply if processing already finished).
    pub async fn claim(&self, message_id: &str) -> Claim {
        let entry = self
            .cache
            .entry(message_id.to_string())
            .or_insert_with(async { Delivery::InFlight })
            .await;

        if entry.is_fresh() {
            return Claim::First;
        }

        debug!(message_id, "duplicate delivery suppressed");
        match entry.into_value() {
            Delivery::InFlight => Claim::InFlight,
            Delivery::Replied(reply) => Claim::Replied(reply),
        }
    }

    /// Record the finished reply for a message id so retries can replay it.
    pub async fn store_reply(&self, message_id: &str, reply: &str) {
        self.cache
            .insert(message_id.to_string(), Delivery::Replied(Arc::from(reply)))
            .await;
    }

    /// Number of remembered message ids.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
