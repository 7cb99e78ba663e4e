//! Log Cursor
//!
//! Everything that turns the replicated event log into handler calls:
//! reading batches, spotting holes, routing events and the loop that drives
//! them under the lease.

pub mod daemon;
pub mod dispatcher;
pub mod event_logs;
pub mod gap_tracker;

pub use daemon::{CycleOutcome, Daemon, DaemonSettings, Shutdown};
pub use dispatcher::{Disposition, EventDispatcher};
pub use event_logs::{establish_baseline, EventBatch, EventLogReader, BATCH_SIZE};
pub use gap_tracker::{FillReport, GapTracker, GAP_GRACE_PERIOD, GAP_OUTDATED_PERIOD};
