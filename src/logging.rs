//! Logging
//!
//! Subscriber setup for the daemon and the event-scoped logger passed to
//! handlers. Every event log line carries `replication_delay_s`, the time
//! between the primary creating the event and this node handling it.

use chrono::{DateTime, Utc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::event::EventRecord;

/// Target used for every cursor log line
pub const LOG_TARGET: &str = "geo_log_cursor";

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the configured level; `debug` forces
/// the debug level regardless of both.
pub fn init_logging(config: &LoggingConfig, debug: bool) {
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Seconds elapsed since `created_at`, rounded to milliseconds
pub fn replication_delay_secs(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - created_at).num_milliseconds() as f64 / 1000.0
}

/// Logger handed to the dispatcher and to every event handler
#[derive(Debug, Clone)]
pub struct CursorLogger {
    pid: u32,
}

impl Default for CursorLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorLogger {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    /// Span carrying the event's identity; handler log lines inherit it
    pub fn event_span(&self, event: &EventRecord) -> tracing::Span {
        tracing::info_span!(
            target: LOG_TARGET,
            "geo_event",
            pid = self.pid,
            event_id = event.id,
            event_type = %event.event_type,
            resource_id = event.resource_id,
        )
    }

    /// Info line with the replication delay of an event
    pub fn event_info(&self, created_at: DateTime<Utc>, message: &str) {
        let delay = replication_delay_secs(created_at, Utc::now());
        tracing::info!(target: LOG_TARGET, pid = self.pid, replication_delay_s = delay, "{}", message);
    }

    /// Warning line with the replication delay of an event
    pub fn event_warn(&self, created_at: DateTime<Utc>, message: &str) {
        let delay = replication_delay_secs(created_at, Utc::now());
        tracing::warn!(target: LOG_TARGET, pid = self.pid, replication_delay_s = delay, "{}", message);
    }

    /// Error line with the replication delay of an event
    pub fn event_error(&self, created_at: DateTime<Utc>, message: &str) {
        let delay = replication_delay_secs(created_at, Utc::now());
        tracing::error!(target: LOG_TARGET, pid = self.pid, replication_delay_s = delay, "{}", message);
    }
}
