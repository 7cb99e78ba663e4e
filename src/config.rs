//! Geo Log Cursor Configuration
//!
//! This module provides configuration structures for the log cursor
//! daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::node::NodeRole;

/// Main cursor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Event log connection configuration
    #[serde(default)]
    pub event_source: EventSourceConfig,

    /// Batch reading and idle polling
    #[serde(default)]
    pub cursor: CursorSettings,

    /// Exclusive lease configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Gap tracking configuration
    #[serde(default)]
    pub gaps: GapConfig,

    /// Resources this node replicates
    #[serde(default)]
    pub selective_sync: SelectiveSyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event type handlers
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Role used when no role file is present
    #[serde(default = "default_role")]
    pub role: NodeRole,

    /// File holding the current role, re-read on every loop iteration
    #[serde(default)]
    pub role_file: Option<PathBuf>,

    /// Data directory for cursor state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Event log connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceConfig {
    /// PostgreSQL URL of the replicated tracking database
    #[serde(default = "default_event_source_url")]
    pub url: String,

    /// Event log table
    #[serde(default = "default_event_table")]
    pub table: String,

    /// Table used to check whether a resource still exists
    #[serde(default = "default_resource_table")]
    pub resource_table: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Batch reading and idle polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorSettings {
    /// Events fetched per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between role checks while the node is not a secondary
    #[serde(default = "default_secondary_check_interval")]
    pub secondary_check_interval_secs: u64,

    /// Lower bound of the random delay added to idle sleeps
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    /// Upper bound of the random delay added to idle sleeps
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

/// Exclusive lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lock key shared by every cursor process
    #[serde(default = "default_lease_key")]
    pub key: String,

    /// Time-to-live in seconds
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

/// Gap tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Minimum age before a gap is retried
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Age after which a gap is given up on
    #[serde(default = "default_outdated_period")]
    pub outdated_period_secs: u64,
}

/// Resources this node replicates
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelectiveSyncConfig {
    /// Resource ids to replicate (empty = all)
    #[serde(default)]
    pub resource_ids: Vec<i64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Webhook handler for one event type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Event type this handler processes
    pub event_type: String,

    /// URL the event is POSTed to
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_handler_timeout")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_role() -> NodeRole {
    NodeRole::Secondary
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/geo-log-cursor")
}

fn default_event_source_url() -> String {
    "postgres://gitlab_geo@localhost:5432/gitlabhq_geo_production".to_string()
}

fn default_event_table() -> String {
    "geo_event_log".to_string()
}

fn default_resource_table() -> String {
    "projects".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_secondary_check_interval() -> u64 {
    60
}

fn default_jitter_min_ms() -> u64 {
    100
}

fn default_jitter_max_ms() -> u64 {
    2000
}

fn default_lease_key() -> String {
    crate::state::lease::DEFAULT_LEASE_KEY.to_string()
}

fn default_lease_ttl() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    10 * 60
}

fn default_outdated_period() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_handler_timeout() -> u64 {
    30
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            url: default_event_source_url(),
            table: default_event_table(),
            resource_table: default_resource_table(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            secondary_check_interval_secs: default_secondary_check_interval(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key: default_lease_key(),
            ttl_secs: default_lease_ttl(),
        }
    }
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            outdated_period_secs: default_outdated_period(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// SQL identifiers are interpolated into queries, so only plain names pass
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl CursorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CursorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.cursor.batch_size == 0 {
            return Err(crate::Error::Config("cursor.batch_size must be positive".into()));
        }

        if self.cursor.jitter_min_ms > self.cursor.jitter_max_ms {
            return Err(crate::Error::Config(
                "cursor.jitter_min_ms cannot exceed cursor.jitter_max_ms".into(),
            ));
        }

        if self.lease.key.is_empty() || self.lease.ttl_secs == 0 {
            return Err(crate::Error::Config("lease.key and lease.ttl_secs must be set".into()));
        }

        if self.gaps.grace_period_secs >= self.gaps.outdated_period_secs {
            return Err(crate::Error::Config(
                "gaps.grace_period_secs must be shorter than gaps.outdated_period_secs".into(),
            ));
        }

        for table in [&self.event_source.table, &self.event_source.resource_table] {
            if !is_identifier(table) {
                return Err(crate::Error::Config(format!("invalid table name '{}'", table)));
            }
        }

        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if !seen.insert(handler.event_type.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate handler for event type '{}'",
                    handler.event_type
                )));
            }
        }

        Ok(())
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Batch size for event log reads
    pub fn batch_size(&self) -> usize {
        self.cursor.batch_size
    }

    /// Sleep while the node is not a secondary
    pub fn secondary_check_interval(&self) -> Duration {
        Duration::from_secs(self.cursor.secondary_check_interval_secs)
    }

    /// Lease time-to-live
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }

    /// Gap grace period
    pub fn gap_grace_period(&self) -> Duration {
        Duration::from_secs(self.gaps.grace_period_secs)
    }

    /// Gap outdated ceiling
    pub fn gap_outdated_period(&self) -> Duration {
        Duration::from_secs(self.gaps.outdated_period_secs)
    }

    /// Bounds of the idle sleep jitter
    pub fn jitter_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.cursor.jitter_min_ms),
            Duration::from_millis(self.cursor.jitter_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "geo-secondary-1"
role = "secondary"
data_dir = "/var/lib/geo-log-cursor"

[event_source]
url = "postgres://geo@db:5432/geo"

[cursor]
batch_size = 100

[gaps]
grace_period_secs = 300

[selective_sync]
resource_ids = [1, 2]

[[handlers]]
event_type = "repository_updated"
url = "http://localhost:9000/repository_updated"
"#;

        let config = CursorConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "geo-secondary-1");
        assert_eq!(config.node.role, NodeRole::Secondary);
        assert_eq!(config.batch_size(), 100);
        assert_eq!(config.gap_grace_period(), Duration::from_secs(300));
        assert_eq!(config.gap_outdated_period(), Duration::from_secs(3600));
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
        assert_eq!(config.lease.key, "geo_log_cursor_processed");
        assert_eq!(config.handlers.len(), 1);
        assert_eq!(config.handlers[0].timeout_secs, 30);
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/geo-log-cursor/state"));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = CursorConfig::from_str("[node]\nid = \"n1\"\n").unwrap();
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.secondary_check_interval(), Duration::from_secs(60));
        assert_eq!(
            config.jitter_range(),
            (Duration::from_millis(100), Duration::from_millis(2000))
        );
        assert_eq!(config.event_source.table, "geo_event_log");
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let grace = "[node]\nid = \"n1\"\n[gaps]\ngrace_period_secs = 7200\n";
        assert!(CursorConfig::from_str(grace).is_err());

        let table = "[node]\nid = \"n1\"\n[event_source]\ntable = \"events; DROP TABLE x\"\n";
        assert!(CursorConfig::from_str(table).is_err());

        let duplicate = r#"
[node]
id = "n1"

[[handlers]]
event_type = "a"
url = "http://x"

[[handlers]]
event_type = "a"
url = "http://y"
"#;
        assert!(CursorConfig::from_str(duplicate).is_err());

        assert!(CursorConfig::from_str("[node]\nid = \"\"\n").is_err());
    }
}
