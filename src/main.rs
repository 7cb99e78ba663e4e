//! Geo Log Cursor - Replication Event Consumer
//!
//! Runs on a secondary node and applies the primary's event log through
//! the configured handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use geo_log_cursor::config::{CursorConfig, LoggingConfig};
use geo_log_cursor::cursor::{Daemon, DaemonSettings, EventDispatcher, GapTracker, Shutdown};
use geo_log_cursor::event::{postgres, EventSource, PgEventSource, PgResourcePolicy};
use geo_log_cursor::handlers::{webhook::register_webhooks, HandlerRegistry};
use geo_log_cursor::logging::{init_logging, CursorLogger};
use geo_log_cursor::node::{RoleFile, RoleOracle, StaticRole};
use geo_log_cursor::state::{CursorStore, GapStore, Lease, LockStore, StateTracker};
use geo_log_cursor::error::{Error, Result};

/// Geo Log Cursor - Replication Event Consumer
#[derive(Parser)]
#[command(name = "geo-log-cursor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "geo-log-cursor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the log cursor daemon
    Run {
        /// Log at debug level
        #[arg(long)]
        debug: bool,
    },

    /// Show cursor position, pending gaps and lease holder
    Status,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "geo-log-cursor.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "geo-secondary-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { debug } => run_daemon(cli.config, debug).await,
        Commands::Status => {
            init_logging(&LoggingConfig::default(), false);
            run_status(cli.config).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Start the daemon and block until a termination signal
async fn run_daemon(config_path: PathBuf, debug: bool) -> Result<()> {
    let config = CursorConfig::from_file(&config_path)?;
    init_logging(&config.logging, debug);

    tracing::info!("Starting geo log cursor on node {}", config.node.id);

    let state = Arc::new(StateTracker::new(config.state_dir())?);
    tracing::info!("State database: {}", state.path().display());

    let pool = postgres::connect(&config.event_source)?;
    let source: Arc<dyn EventSource> =
        Arc::new(PgEventSource::new(pool.clone(), &config.event_source.table));
    let resources = Arc::new(PgResourcePolicy::new(
        pool,
        &config.event_source.resource_table,
        config.selective_sync.resource_ids.iter().copied(),
    ));

    let role: Arc<dyn RoleOracle> = match &config.node.role_file {
        Some(path) => {
            tracing::info!("Reading node role from {}", path.display());
            Arc::new(RoleFile::new(path.clone(), config.node.role))
        }
        None => Arc::new(StaticRole::new(config.node.role)),
    };

    let mut registry = HandlerRegistry::new();
    register_webhooks(&mut registry, &config.handlers)?;
    if registry.is_empty() {
        tracing::warn!("No event handlers configured, any event will abort the work cycle");
    } else {
        tracing::info!("Handling event types: {}", registry.event_types().join(", "));
    }
    let dispatcher = EventDispatcher::new(registry, resources, CursorLogger::new());

    let lease = Lease::new(
        state.clone() as Arc<dyn LockStore>,
        config.lease.key.clone(),
        config.lease_ttl(),
    );
    let gaps = GapTracker::new(
        state.clone(),
        config.gap_grace_period(),
        config.gap_outdated_period(),
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal");
        signal.trigger();
    })
    .map_err(|e| Error::Internal(format!("failed to install signal handler: {}", e)))?;

    let mut daemon = Daemon::new(
        role,
        lease,
        gaps,
        source,
        state,
        dispatcher,
        shutdown,
        DaemonSettings::from_config(&config),
    );
    daemon.run().await?;

    tracing::info!("Geo log cursor shutdown complete");
    Ok(())
}

/// Print the persisted cursor state
async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = CursorConfig::from_file(&config_path)?;
    let state = StateTracker::new(config.state_dir())?;

    let position = state.last_processed().await?;
    let pending = state.len().await?;
    let oldest = state.oldest_gap().await?;
    let holder = state.holder(&config.lease.key).await?;

    println!("Geo Log Cursor Status");
    println!("=====================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("State Database:   {}", state.path().display());
    println!();
    match position {
        Some(id) => println!("Last Processed:   {}", id),
        None => println!("Last Processed:   (not initialized)"),
    }
    println!("Pending Gaps:     {}", pending);
    if let Some(gap) = oldest {
        println!("Oldest Gap:       {} (recorded {})", gap.event_id, gap.recorded_at.to_rfc3339());
    }
    println!();
    match holder {
        Some(holder) => {
            println!("Lease Holder:     {}", holder.token);
            println!("Lease Expires In: {} ms", holder.remaining.as_millis());
        }
        None => println!("Lease Holder:     (none)"),
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# Geo Log Cursor Configuration
# Generated configuration file

[node]
id = "{node_id}"
role = "secondary"
data_dir = "/var/lib/geo-log-cursor/{node_id}"
# role_file = "/etc/geo-log-cursor/role"

[event_source]
url = "postgres://gitlab_geo@localhost:5432/gitlabhq_geo_production"
table = "geo_event_log"
resource_table = "projects"
pool_size = 5
connect_timeout_secs = 30

[cursor]
batch_size = 50
secondary_check_interval_secs = 60
jitter_min_ms = 100
jitter_max_ms = 2000

[lease]
key = "geo_log_cursor_processed"
ttl_secs = 30

[gaps]
grace_period_secs = 600
outdated_period_secs = 3600

[selective_sync]
resource_ids = []
# resource_ids = [1, 2, 3]

[logging]
level = "info"
format = "pretty"

# [[handlers]]
# event_type = "repository_updated"
# url = "http://localhost:9000/geo/repository_updated"
# timeout_secs = 30
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the event source and handlers.");
    println!("Then start with: geo-log-cursor --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CursorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Role: {}", config.node.role);
            println!("  Event Table: {}", config.event_source.table);
            println!("  Batch Size: {}", config.batch_size());
            println!("  Lease TTL: {}s", config.lease.ttl_secs);
            println!("  Handlers: {}", config.handlers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
