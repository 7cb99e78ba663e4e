//! State Management Module
//!
//! Durable state owned by the cursor: the last processed event id, the
//! set of pending gap ids and the lease used to elect the active process.
//! Every mutation is a single atomic statement so that two processes racing
//! through a lease hand-off cannot corrupt each other's writes.

mod tracker;
mod memory;
pub mod lease;

pub use tracker::StateTracker;
pub use memory::MemoryStore;
pub use lease::{Lease, LeaseResult};

use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::event::EventId;
use crate::error::Result;

/// An event id skipped by the reader, waiting to become visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
    pub event_id: EventId,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of an atomic lease acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now holds the key
    Acquired,
    /// Someone else holds the key for `remaining`
    Held { remaining: Duration },
}

/// Live holder of a lock key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub token: String,
    pub remaining: Duration,
}

/// Durable high-water mark of processed events
#[async_trait::async_trait]
pub trait CursorStore: Send + Sync {
    /// Last processed id, `None` before the first baseline
    async fn last_processed(&self) -> Result<Option<EventId>>;

    /// Record progress; a lower id than the stored one is ignored
    async fn save_processed(&self, event_id: EventId) -> Result<()>;
}

/// Durable set of pending gaps, ordered by the time they were recorded
#[async_trait::async_trait]
pub trait GapStore: Send + Sync {
    /// Track a gap; re-adding an id keeps its original timestamp
    async fn add(&self, event_id: EventId, recorded_at: DateTime<Utc>) -> Result<()>;

    /// Stop tracking a gap
    async fn remove(&self, event_id: EventId) -> Result<()>;

    /// Gaps recorded at or before `max_recorded_at`, oldest first
    async fn range(&self, max_recorded_at: DateTime<Utc>) -> Result<Vec<GapRecord>>;

    /// Drop gaps recorded at or before `before`, returning how many went
    async fn evict(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Number of tracked gaps
    async fn len(&self) -> Result<u64>;
}

/// Shared store for lease keys with expiry
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` unless another token holds it and it has not expired.
    /// The current holder re-taking its own key refreshes the ttl.
    async fn set_if_not_exists(&self, key: &str, token: &str, ttl: Duration) -> Result<LockAttempt>;

    /// Push the expiry out, only if `token` holds `key`
    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release `key`, only if `token` holds it
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool>;

    /// Current live holder of `key`
    async fn holder(&self, key: &str) -> Result<Option<LockHolder>>;
}

/// Convert a timestamp to the millisecond form stored on disk
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored milliseconds back to a timestamp
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Milliseconds left until `expires_at_ms`, zero if already past
pub(crate) fn remaining_until(expires_at_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(expires_at_ms.saturating_sub(now_ms).max(0) as u64)
}

/// Expiry in stored milliseconds for a ttl starting at `now_ms`
pub(crate) fn expiry_after(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Whole milliseconds of `d`, saturating at `u64::MAX`
pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
