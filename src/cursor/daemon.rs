//! Cursor Daemon
//!
//! The control loop. Each iteration checks the node role, competes for the
//! lease and, when it wins, backfills gaps and drains the event log batch
//! by batch. Nothing a single event or a flaky event source does can end
//! the loop; only a shutdown request does, and it is honoured between
//! batches.

use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::sync::watch;

use super::dispatcher::EventDispatcher;
use super::event_logs::{establish_baseline, EventBatch, EventLogReader, BATCH_SIZE};
use super::gap_tracker::{FillReport, GapTracker};
use crate::config::CursorConfig;
use crate::event::{EventId, EventSource};
use crate::node::RoleOracle;
use crate::state::{duration_millis, CursorStore, Lease};
use crate::error::{Error, Result};

/// Cooperative stop flag shared with the signal handler
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop; callable from any thread
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sleep for `duration` unless a stop is requested first.
    ///
    /// Returns `true` if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let stopped = async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = stopped => true,
        }
    }
}

/// Result of one lease-guarded work cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Another process holds the lease for `ttl` more
    Idle { ttl: Duration },
    /// The log was drained, or reading stopped for shutdown
    Completed { batches: usize, events: usize },
    /// The lease expired under us; the position is saved up to the last
    /// finished batch
    LeaseLost,
    /// The cycle failed and the lease was released
    Failed(Error),
}

/// Loop timing knobs
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub batch_size: usize,
    pub secondary_check_interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            secondary_check_interval: Duration::from_secs(60),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(2000),
        }
    }
}

impl DaemonSettings {
    pub fn from_config(config: &CursorConfig) -> Self {
        let (jitter_min, jitter_max) = config.jitter_range();
        Self {
            batch_size: config.batch_size(),
            secondary_check_interval: config.secondary_check_interval(),
            jitter_min,
            jitter_max,
        }
    }
}

/// Lease-coordinated event log consumer
pub struct Daemon {
    role: Arc<dyn RoleOracle>,
    lease: Lease,
    gaps: GapTracker,
    source: Arc<dyn EventSource>,
    cursor: Arc<dyn CursorStore>,
    dispatcher: EventDispatcher,
    shutdown: Shutdown,
    settings: DaemonSettings,
    /// Set once the cursor position is known to exist
    initialized: bool,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Arc<dyn RoleOracle>,
        lease: Lease,
        gaps: GapTracker,
        source: Arc<dyn EventSource>,
        cursor: Arc<dyn CursorStore>,
        dispatcher: EventDispatcher,
        shutdown: Shutdown,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            role,
            lease,
            gaps,
            source,
            cursor,
            dispatcher,
            shutdown,
            settings,
            initialized: false,
        }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Seed the cursor position if this is the first run ever
    pub async fn initialize(&self) -> Result<EventId> {
        establish_baseline(self.source.as_ref(), self.cursor.as_ref()).await
    }

    /// Run until a stop is requested
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(lease_token = %self.lease.token(), "Geo log cursor started");

        while !self.shutdown.is_stopping() {
            let pause = self.tick().await;
            if self.shutdown.is_stopping() {
                break;
            }
            self.shutdown.sleep(pause).await;
        }

        tracing::info!("Geo log cursor stopped");
        Ok(())
    }

    /// One loop iteration; returns how long to wait before the next one
    pub async fn tick(&mut self) -> Duration {
        match self.role.is_secondary().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Node is not a secondary, waiting");
                return self.settings.secondary_check_interval;
            }
            Err(e) => {
                tracing::error!("Failed to determine node role: {}", e);
                return self.settings.secondary_check_interval;
            }
        }

        if !self.initialized {
            match self.initialize().await {
                Ok(position) => {
                    tracing::info!(last_processed_id = position, "Cursor position ready");
                    self.initialized = true;
                }
                Err(e) => {
                    tracing::error!("Failed to initialize cursor position, retrying: {}", e);
                    return self.jitter();
                }
            }
        }

        match self.run_once().await {
            CycleOutcome::Idle { ttl } => ttl + self.jitter(),
            CycleOutcome::Completed { batches, events } => {
                if events > 0 {
                    tracing::debug!(batches, events, "Work cycle completed");
                }
                self.jitter()
            }
            CycleOutcome::LeaseLost => self.jitter(),
            CycleOutcome::Failed(e) => {
                tracing::debug!(retryable = e.is_retryable(), "Work cycle failed");
                self.jitter()
            }
        }
    }

    /// Take the lease, backfill gaps and drain the log, renewing on success
    /// and releasing the lease on any failure
    pub async fn run_once(&mut self) -> CycleOutcome {
        let lease = match self.lease.try_acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!("Failed to acquire lease: {}", e);
                return CycleOutcome::Failed(e);
            }
        };

        if !lease.owned {
            tracing::debug!(
                ttl_ms = duration_millis(lease.ttl),
                "Lease held by another process"
            );
            return CycleOutcome::Idle { ttl: lease.ttl };
        }

        if let Err(e) = self.fill_gaps().await {
            tracing::error!("Event log gap backfill failed: {}", e);
        }

        match self.work_cycle().await {
            Ok(CycleOutcome::Completed { batches, events }) => match self.lease.renew().await {
                Ok(Some(_)) => CycleOutcome::Completed { batches, events },
                Ok(None) => CycleOutcome::LeaseLost,
                Err(e) => self.abandon(e).await,
            },
            Ok(outcome) => outcome,
            Err(e) => self.abandon(e).await,
        }
    }

    async fn abandon(&self, error: Error) -> CycleOutcome {
        if error.is_programmer_error() {
            tracing::error!("Work cycle aborted, operator action required: {}", error);
        } else {
            tracing::error!("Work cycle aborted: {}", error);
        }

        if let Err(e) = self.lease.cancel(self.lease.token()).await {
            tracing::warn!("Failed to release lease: {}", e);
        }
        CycleOutcome::Failed(error)
    }

    async fn work_cycle(&mut self) -> Result<CycleOutcome> {
        let mut reader =
            EventLogReader::new(self.source.clone(), self.cursor.clone(), self.settings.batch_size)
                .await?;
        let mut batches = 0;
        let mut events = 0;

        while !self.shutdown.is_stopping() {
            let Some(batch) = reader.next_batch().await? else {
                break;
            };

            self.handle_events(&batch).await?;
            batches += 1;
            events += batch.len();

            if !reader.mark_processed(&batch, &self.lease).await? {
                return Ok(CycleOutcome::LeaseLost);
            }
        }

        Ok(CycleOutcome::Completed { batches, events })
    }

    /// Dispatch a batch in order, tracking holes in the id sequence
    pub async fn handle_events(&mut self, batch: &EventBatch) -> Result<()> {
        tracing::info!(
            first_id = batch.first_id(),
            last_id = batch.last_id(),
            count = batch.len(),
            "Handling events"
        );

        self.gaps.set_previous_id(batch.previous_last_id);
        for event in &batch.events {
            self.gaps.check(event.id).await?;
            self.dispatcher.handle_single_event(event).await?;
        }
        Ok(())
    }

    /// Retry gaps past their grace period; a gap counts as filled when its
    /// event exists and was dispatched, whatever the disposition
    pub async fn fill_gaps(&self) -> Result<FillReport> {
        let source = self.source.as_ref();
        let dispatcher = &self.dispatcher;

        self.gaps
            .fill_gaps(|event_id| fill_gap(source, dispatcher, event_id))
            .await
    }

    fn jitter(&self) -> Duration {
        let min = duration_millis(self.settings.jitter_min);
        let max = duration_millis(self.settings.jitter_max).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

async fn fill_gap(source: &dyn EventSource, dispatcher: &EventDispatcher, event_id: EventId) -> Result<bool> {
    match source.find_by_id(event_id).await? {
        Some(event) => {
            dispatcher.handle_single_event(&event).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}
