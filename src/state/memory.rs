//! In-memory state store, used for isolated leases and tests

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    expiry_after, remaining_until, to_millis, CursorStore, GapRecord, GapStore, LockAttempt,
    LockHolder, LockStore,
};
use crate::event::EventId;
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    position: Option<EventId>,
    gaps: BTreeMap<EventId, DateTime<Utc>>,
    /// key -> (token, expires_at ms)
    locks: HashMap<String, (String, i64)>,
    failing: bool,
}

/// Cursor, gap and lock store held in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until cleared
    pub async fn set_failing(&self, failing: bool) {
        self.inner.lock().await.failing = failing;
    }

    /// Forget a lease as if its ttl ran out
    pub async fn expire(&self, key: &str) {
        self.inner.lock().await.locks.remove(key);
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock().await;
        if inner.failing {
            return Err(Error::State("memory store unavailable".into()));
        }
        Ok(inner)
    }
}

#[async_trait::async_trait]
impl CursorStore for MemoryStore {
    async fn last_processed(&self) -> Result<Option<EventId>> {
        Ok(self.lock().await?.position)
    }

    async fn save_processed(&self, event_id: EventId) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.position = Some(inner.position.map_or(event_id, |p| p.max(event_id)));
        Ok(())
    }
}

#[async_trait::async_trait]
impl GapStore for MemoryStore {
    async fn add(&self, event_id: EventId, recorded_at: DateTime<Utc>) -> Result<()> {
        self.lock().await?.gaps.entry(event_id).or_insert(recorded_at);
        Ok(())
    }

    async fn remove(&self, event_id: EventId) -> Result<()> {
        self.lock().await?.gaps.remove(&event_id);
        Ok(())
    }

    async fn range(&self, max_recorded_at: DateTime<Utc>) -> Result<Vec<GapRecord>> {
        let inner = self.lock().await?;
        let mut gaps: Vec<GapRecord> = inner
            .gaps
            .iter()
            .filter(|(_, ts)| **ts <= max_recorded_at)
            .map(|(id, ts)| GapRecord {
                event_id: *id,
                recorded_at: *ts,
            })
            .collect();
        gaps.sort_by_key(|g| (g.recorded_at, g.event_id));
        Ok(gaps)
    }

    async fn evict(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock().await?;
        let len = inner.gaps.len();
        inner.gaps.retain(|_, ts| *ts > before);
        Ok((len - inner.gaps.len()) as u64)
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.lock().await?.gaps.len() as u64)
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryStore {
    async fn set_if_not_exists(&self, key: &str, token: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = to_millis(Utc::now());
        let mut inner = self.lock().await?;

        if let Some((holder, expires_at)) = inner.locks.get(key) {
            if *expires_at > now && holder.as_str() != token {
                return Ok(LockAttempt::Held {
                    remaining: remaining_until(*expires_at, now),
                });
            }
        }

        inner
            .locks
            .insert(key.to_string(), (token.to_string(), expiry_after(now, ttl)));
        Ok(LockAttempt::Acquired)
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = to_millis(Utc::now());
        let mut inner = self.lock().await?;
        match inner.locks.get_mut(key) {
            Some((holder, expires_at)) if holder.as_str() == token && *expires_at > now => {
                *expires_at = expiry_after(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut inner = self.lock().await?;
        if inner.locks.get(key).map_or(false, |(holder, _)| holder == token) {
            inner.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockHolder>> {
        let now = to_millis(Utc::now());
        let inner = self.lock().await?;
        Ok(inner
            .locks
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(token, expires_at)| LockHolder {
                token: token.clone(),
                remaining: remaining_until(*expires_at, now),
            }))
    }
}
