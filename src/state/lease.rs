//! Exclusive Lease
//!
//! Cluster-wide mutual exclusion with a time-to-live, used to make sure
//! only one cursor process consumes the event log at a time. A holder
//! that crashes simply stops renewing and the key expires.

use std::sync::Arc;
use std::time::Duration;

use super::{duration_millis, LockAttempt, LockStore};
use crate::error::Result;

/// Default lease key shared by every cursor process of a node
pub const DEFAULT_LEASE_KEY: &str = "geo_log_cursor_processed";

/// Default time-to-live
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Result of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseResult {
    /// Whether this process holds the lease now
    pub owned: bool,
    /// Remaining ttl of the other holder, zero when owned
    pub ttl: Duration,
}

/// Lease over a single key in a shared lock store
pub struct Lease {
    store: Arc<dyn LockStore>,
    key: String,
    /// Identity of this process; stable for the lifetime of the lease object
    token: String,
    ttl: Duration,
}

impl Lease {
    /// Create a lease with a fresh holder token
    pub fn new(store: Arc<dyn LockStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// Holder token of this process
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lease key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to become the holder.
    ///
    /// Succeeds when nobody holds the key, the previous holder expired, or
    /// this process already holds it.
    pub async fn try_acquire(&self) -> Result<LeaseResult> {
        match self.store.set_if_not_exists(&self.key, &self.token, self.ttl).await? {
            LockAttempt::Acquired => {
                tracing::debug!(key = %self.key, "Lease obtained");
                Ok(LeaseResult {
                    owned: true,
                    ttl: Duration::ZERO,
                })
            }
            LockAttempt::Held { remaining } => {
                tracing::debug!(
                    key = %self.key,
                    ttl_ms = duration_millis(remaining),
                    "Cannot obtain an exclusive lease, another process is already running"
                );
                Ok(LeaseResult {
                    owned: false,
                    ttl: remaining,
                })
            }
        }
    }

    /// Extend the ttl; `None` if the lease was lost in the meantime
    pub async fn renew(&self) -> Result<Option<String>> {
        if self.store.extend_if_owner(&self.key, &self.token, self.ttl).await? {
            tracing::debug!(key = %self.key, "Lease renewed");
            Ok(Some(self.token.clone()))
        } else {
            tracing::warn!(key = %self.key, "Lease not renewed, it is no longer held by this process");
            Ok(None)
        }
    }

    /// Release the lease early if `token` is the current holder
    pub async fn cancel(&self, token: &str) -> Result<bool> {
        let released = self.store.delete_if_owner(&self.key, token).await?;
        tracing::debug!(key = %self.key, released, "Lease cancelled");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStore, StateTracker};
    use tempfile::tempdir;

    fn lease(store: &Arc<MemoryStore>, ttl: Duration) -> Lease {
        Lease::new(store.clone() as Arc<dyn LockStore>, DEFAULT_LEASE_KEY, ttl)
    }

    #[tokio::test]
    async fn test_second_process_waits_for_remaining_ttl() {
        let store = Arc::new(MemoryStore::new());
        let a = lease(&store, DEFAULT_LEASE_TTL);
        let b = lease(&store, DEFAULT_LEASE_TTL);

        let first = a.try_acquire().await.unwrap();
        assert!(first.owned);
        assert_eq!(first.ttl, Duration::ZERO);

        let second = b.try_acquire().await.unwrap();
        assert!(!second.owned);
        assert!(second.ttl > Duration::ZERO);
        assert!(second.ttl <= DEFAULT_LEASE_TTL);
    }

    #[tokio::test]
    async fn test_holder_keeps_lease_across_cycles() {
        let store = Arc::new(MemoryStore::new());
        let a = lease(&store, DEFAULT_LEASE_TTL);

        assert!(a.try_acquire().await.unwrap().owned);
        assert_eq!(a.renew().await.unwrap().as_deref(), Some(a.token()));
        assert!(a.try_acquire().await.unwrap().owned);
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let store = Arc::new(MemoryStore::new());
        let a = lease(&store, DEFAULT_LEASE_TTL);
        let b = lease(&store, DEFAULT_LEASE_TTL);

        assert!(a.try_acquire().await.unwrap().owned);
        store.expire(DEFAULT_LEASE_KEY).await;
        assert!(b.try_acquire().await.unwrap().owned);

        assert_eq!(a.renew().await.unwrap(), None);
        assert!(!a.try_acquire().await.unwrap().owned);
    }

    #[tokio::test]
    async fn test_cancel_only_releases_own_lease() {
        let store = Arc::new(MemoryStore::new());
        let a = lease(&store, DEFAULT_LEASE_TTL);
        let b = lease(&store, DEFAULT_LEASE_TTL);

        assert!(a.try_acquire().await.unwrap().owned);
        assert!(!b.cancel(b.token()).await.unwrap());
        assert!(!b.try_acquire().await.unwrap().owned);

        assert!(a.cancel(a.token()).await.unwrap());
        assert!(b.try_acquire().await.unwrap().owned);
    }

    #[tokio::test]
    async fn test_expiry_hands_over() {
        let store = Arc::new(MemoryStore::new());
        let a = lease(&store, Duration::from_millis(20));
        let b = lease(&store, Duration::from_millis(20));

        assert!(a.try_acquire().await.unwrap().owned);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.try_acquire().await.unwrap().owned);
    }

    #[tokio::test]
    async fn test_concurrent_acquisition_has_one_winner() {
        let dir = tempdir().unwrap();
        let tracker: Arc<dyn LockStore> =
            Arc::new(StateTracker::new(dir.path().to_path_buf()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lease = Lease::new(tracker.clone(), DEFAULT_LEASE_KEY, DEFAULT_LEASE_TTL);
            handles.push(tokio::spawn(async move { lease.try_acquire().await.unwrap().owned }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
