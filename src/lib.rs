//! Geo Log Cursor - Replication Event Consumer for Secondary Nodes
//!
//! A long-running daemon that consumes the ordered event log written by a
//! primary node and applies every event on a secondary through a registry
//! of handlers.
//!
//! # Architecture
//!
//! Several cursor processes may run per node for availability, but a TTL
//! lease lets only one of them read the log at a time; the others idle and
//! take over when the lease expires. Progress is a single durable position
//! that only moves after a whole batch was handled.
//!
//! # Features
//!
//! - Exclusive lease with renew and early release
//! - Batched reading with at-least-once delivery
//! - Gap tracking for ids that become visible out of order
//! - Selective sync with replay of deletions
//! - Webhook handlers configured per event type
//! - Runtime role changes through a role file

pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod state;
pub mod logging;
pub mod handlers;
pub mod cursor;

pub use config::CursorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CursorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventId, EventRecord, EventSource};
    pub use crate::state::{Lease, StateTracker};
    pub use crate::handlers::{EventHandler, HandlerRegistry};
    pub use crate::cursor::{Daemon, EventDispatcher, GapTracker, Shutdown};
}
