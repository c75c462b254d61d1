/*!
Telemetron CLI - runs the metrics collector or the reporting agent.

Settings are resolved per field: command-line flag, then environment
variable, then the JSON file given with `--config`, then built-in defaults.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{Table, Tabled};
use telemetron_core::observability::init_observability;
use telemetron_core::{
    create_router, open_store, read_metrics_file, Agent, AgentConfig, AppState, ServerConfig,
};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "telemetron")]
#[command(about = "Push-based metrics agent and collector")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log one JSON object per line
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the metrics collector
    Server(ServerArgs),
    /// Run the reporting agent
    Agent(AgentArgs),
    /// Inspect collector snapshot files
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Print the metrics held in a snapshot file
    Show {
        /// Snapshot file written by the collector
        path: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct ServerArgs {
    /// JSON config file
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, host:port
    #[arg(short, long, env = "ADDRESS")]
    address: Option<String>,

    /// PostgreSQL connection string; selects the database backend
    #[arg(short = 'd', long, env = "DATABASE_DSN")]
    database_dsn: Option<String>,

    /// Snapshot period in seconds; 0 writes every update straight to the file
    #[arg(short = 'i', long, env = "STORE_INTERVAL")]
    store_interval: Option<u64>,

    /// Snapshot file path
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH")]
    file_storage_path: Option<PathBuf>,

    /// Load the snapshot file at startup; a bare `-r` means true
    #[arg(short, long, env = "RESTORE", num_args = 0..=1, default_missing_value = "true")]
    restore: Option<bool>,

    /// Shared HMAC secret
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Args, Debug, Default)]
struct AgentArgs {
    /// JSON config file
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Collector address, host:port or a base URL
    #[arg(short, long, env = "ADDRESS")]
    address: Option<String>,

    /// Seconds between samples
    #[arg(short, long, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Seconds between reports
    #[arg(short, long, env = "REPORT_INTERVAL")]
    report_interval: Option<u64>,

    /// Shared HMAC secret
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    key: Option<String>,

    /// Maximum concurrent deliveries
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    rate_limit: Option<usize>,
}

impl ServerArgs {
    fn resolve(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(dsn) = self.database_dsn {
            config.database_dsn = Some(dsn);
        }
        if let Some(secs) = self.store_interval {
            config.store_interval = Duration::from_secs(secs);
        }
        if let Some(path) = self.file_storage_path {
            config.file_storage_path = path;
        }
        if let Some(restore) = self.restore {
            config.restore = restore;
        }
        if let Some(key) = self.key {
            config.secret_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }
}

impl AgentArgs {
    fn resolve(self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AgentConfig::default(),
        };

        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.report_interval {
            config.report_interval = Duration::from_secs(secs);
        }
        if let Some(key) = self.key {
            config.secret_key = Some(key);
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit = limit;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.json, cli.verbose)?;

    match cli.command {
        Commands::Server(args) => run_server(args.resolve()?).await?,
        Commands::Agent(args) => run_agent(args.resolve()?).await?,
        Commands::Snapshot {
            command: SnapshotCommands::Show { path },
        } => show_snapshot(&path)?,
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<(), anyhow::Error> {
    let (store, scheduler) = open_store(&config).await?;
    let app = create_router(AppState::from_config(store.clone(), &config)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let snapshots = scheduler.map(|scheduler| scheduler.spawn(stop_rx));

    let listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.address))?;

    info!(
        backend = store.backend_name(),
        signed = config.secret().is_some(),
        "Collector listening on http://{}",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // the scheduler writes one last snapshot after the stop signal
    let _ = stop_tx.send(true);
    if let Some(handle) = snapshots {
        handle
            .await
            .context("Snapshot task panicked")?
            .context("Final snapshot failed")?;
    }
    store.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<(), anyhow::Error> {
    let agent = Agent::new(&config)?;
    info!(
        poll_secs = config.poll_interval.as_secs(),
        report_secs = config.report_interval.as_secs(),
        rate_limit = config.rate_limit,
        signed = config.secret().is_some(),
        "Starting agent"
    );

    let handle = agent.start();
    shutdown_signal().await;
    handle.stop().await;

    info!("Shutdown complete");
    Ok(())
}

fn show_snapshot(path: &Path) -> Result<(), anyhow::Error> {
    info!("Showing snapshot: {}", path.display());

    let metrics = read_metrics_file(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;

    if metrics.is_empty() {
        println!("No metrics in {}", path.display());
        return Ok(());
    }

    let size = match std::fs::metadata(path) {
        Ok(meta) => format_size(meta.len()),
        Err(_) => "Unknown".to_string(),
    };

    let rows: Vec<MetricRow> = metrics
        .values()
        .map(|metric| MetricRow {
            id: metric.id().to_string(),
            kind: metric.kind().to_string(),
            value: metric.value().to_string(),
        })
        .collect();

    println!("{}", Table::new(rows));
    println!("{} metrics, {size}", metrics.len());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
