//! Gap Tracking
//!
//! Event ids are assigned when a transaction starts but become visible when
//! it commits, so the reader can see 9 before 7. Every id skipped that way
//! is stored with the time it was first noticed, offered again once the
//! grace period has passed, and dropped after the outdated ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::event::EventId;
use crate::state::GapStore;
use crate::error::Result;

/// Default wait before a gap is retried
pub const GAP_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Default age after which a gap is considered lost
pub const GAP_OUTDATED_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Result of a backfill pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    /// Gaps dropped for being older than the outdated ceiling
    pub evicted: u64,
    /// Gaps handed to the handler
    pub attempted: usize,
    /// Gaps the handler confirmed and that were removed
    pub filled: usize,
}

/// Detects holes in the id sequence and re-offers them later
pub struct GapTracker {
    store: Arc<dyn GapStore>,
    /// Last id examined by `check`
    previous_id: EventId,
    grace_period: Duration,
    outdated_period: Duration,
}

impl GapTracker {
    pub fn new(store: Arc<dyn GapStore>, grace_period: Duration, outdated_period: Duration) -> Self {
        Self {
            store,
            previous_id: 0,
            grace_period,
            outdated_period,
        }
    }

    pub fn previous_id(&self) -> EventId {
        self.previous_id
    }

    /// Reset the continuity check, usually to the last id of the previous batch
    pub fn set_previous_id(&mut self, id: EventId) {
        self.previous_id = id;
    }

    /// Record every id strictly between the previous id and `current_id`
    pub async fn check(&mut self, current_id: EventId) -> Result<()> {
        self.check_at(current_id, Utc::now()).await
    }

    /// `check` with an explicit observation time
    pub async fn check_at(&mut self, current_id: EventId, now: DateTime<Utc>) -> Result<()> {
        let result = self.track_gaps(current_id, now).await;
        // The sequence moves on even if recording failed
        self.previous_id = current_id;
        result
    }

    async fn track_gaps(&self, current_id: EventId, now: DateTime<Utc>) -> Result<()> {
        let previous_id = self.previous_id;
        if previous_id <= 0 || current_id <= previous_id + 1 {
            return Ok(());
        }

        tracing::info!(
            previous_id,
            current_id,
            "Event log gap detected"
        );

        for gap_id in (previous_id + 1)..current_id {
            self.store.add(gap_id, now).await?;
        }
        Ok(())
    }

    /// Evict outdated gaps, then offer every gap past its grace period to
    /// `handler`, oldest first. A gap is removed only when the handler
    /// returns `true`.
    pub async fn fill_gaps<F, Fut>(&self, handler: F) -> Result<FillReport>
    where
        F: FnMut(EventId) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.fill_gaps_at(Utc::now(), handler).await
    }

    /// `fill_gaps` with an explicit current time
    pub async fn fill_gaps_at<F, Fut>(&self, now: DateTime<Utc>, mut handler: F) -> Result<FillReport>
    where
        F: FnMut(EventId) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut report = FillReport {
            evicted: self.store.evict(now - to_chrono(self.outdated_period)).await?,
            ..FillReport::default()
        };
        if report.evicted > 0 {
            tracing::info!(evicted = report.evicted, "Evicted outdated event log gaps");
        }

        let due = self.store.range(now - to_chrono(self.grace_period)).await?;
        for gap in due {
            report.attempted += 1;
            if handler(gap.event_id).await? {
                self.store.remove(gap.event_id).await?;
                report.filled += 1;
                tracing::info!(event_id = gap.event_id, "Event log gap filled");
            } else {
                tracing::debug!(event_id = gap.event_id, "Event log gap still missing");
            }
        }

        Ok(report)
    }

    /// Number of pending gaps
    pub async fn pending(&self) -> Result<u64> {
        self.store.len().await
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;

    fn tracker(store: &Arc<MemoryStore>) -> GapTracker {
        GapTracker::new(store.clone(), GAP_GRACE_PERIOD, GAP_OUTDATED_PERIOD)
    }

    async fn gap_ids(store: &MemoryStore, now: DateTime<Utc>) -> Vec<EventId> {
        store.range(now).await.unwrap().into_iter().map(|g| g.event_id).collect()
    }

    #[tokio::test]
    async fn test_first_id_is_not_a_gap() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);

        gaps.check(10).await.unwrap();
        assert_eq!(gaps.previous_id(), 10);
        assert_eq!(gaps.pending().await.unwrap(), 0);

        gaps.set_previous_id(-1);
        gaps.check(4).await.unwrap();
        assert_eq!(gaps.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gap_between_five_and_nine() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(5);
        gaps.check_at(9, now).await.unwrap();

        assert_eq!(gap_ids(&store, now).await, vec![6, 7, 8]);
        assert_eq!(gaps.previous_id(), 9);

        // Consecutive ids add nothing
        gaps.check_at(10, now).await.unwrap();
        assert_eq!(gaps.pending().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_previous_id_advances_when_recording_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        gaps.set_previous_id(2);

        store.set_failing(true).await;
        assert!(gaps.check(5).await.is_err());
        assert_eq!(gaps.previous_id(), 5);
    }

    #[tokio::test]
    async fn test_gaps_wait_for_grace_period() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(2);
        gaps.check_at(5, now).await.unwrap();

        let mut offered = Vec::new();
        let report = gaps
            .fill_gaps_at(now + ChronoDuration::minutes(5), |id| {
                offered.push(id);
                async { Ok(true) }
            })
            .await
            .unwrap();
        assert!(offered.is_empty());
        assert_eq!(report.attempted, 0);
        assert_eq!(gaps.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_backfill() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(2);
        gaps.check_at(5, now).await.unwrap();

        // Only event 3 ever became visible
        let visible: HashSet<EventId> = [3].into_iter().collect();
        let report = gaps
            .fill_gaps_at(now + ChronoDuration::minutes(11), |id| {
                let found = visible.contains(&id);
                async move { Ok(found) }
            })
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.filled, 1);
        assert_eq!(gap_ids(&store, now).await, vec![4]);
    }

    #[tokio::test]
    async fn test_outdated_gaps_are_evicted_and_never_retried() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(2);
        gaps.check_at(5, now).await.unwrap();

        let mut offered = Vec::new();
        let report = gaps
            .fill_gaps_at(now + ChronoDuration::minutes(61), |id| {
                offered.push(id);
                async { Ok(false) }
            })
            .await
            .unwrap();

        assert_eq!(report.evicted, 2);
        assert!(offered.is_empty());
        assert_eq!(gaps.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gaps_offered_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(10);
        gaps.check_at(12, now).await.unwrap();
        gaps.set_previous_id(1);
        gaps.check_at(3, now - ChronoDuration::minutes(20)).await.unwrap();

        let mut offered = Vec::new();
        gaps.fill_gaps_at(now + ChronoDuration::minutes(15), |id| {
            offered.push(id);
            async { Ok(false) }
        })
        .await
        .unwrap();

        assert_eq!(offered, vec![2, 11]);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_gap() {
        let store = Arc::new(MemoryStore::new());
        let mut gaps = tracker(&store);
        let now = Utc::now();

        gaps.set_previous_id(1);
        gaps.check_at(3, now).await.unwrap();

        let result = gaps
            .fill_gaps_at(now + ChronoDuration::minutes(11), |_| async {
                Err(crate::Error::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(gaps.pending().await.unwrap(), 1);
    }
}
