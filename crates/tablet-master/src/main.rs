//! Tablet master service entry point

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tablet_master::{MasterConfig, TabletMaster};

/// Tablet master - tablet lifecycle and tablet action orchestration
#[derive(Parser, Debug)]
#[command(name = "tablet-master")]
#[command(about = "Tablet lifecycle and tablet action master for dynamic tables")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Tag of this master cell
    #[arg(long)]
    cell_tag: Option<u16>,

    /// Tag of the primary master cell
    #[arg(long)]
    primary_cell_tag: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<MasterConfig> {
        let mut config = match &self.config {
            Some(path) => MasterConfig::from_file(path)?,
            None => MasterConfig::default(),
        };
        if let Some(cluster) = self.cluster {
            config.cluster_name = cluster;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(http_addr) = self.http_addr {
            config.http_addr = http_addr;
        }
        if let Some(cell_tag) = self.cell_tag {
            config.cell_tag = cell_tag;
        }
        if let Some(primary_cell_tag) = self.primary_cell_tag {
            config.primary_cell_tag = primary_cell_tag;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting tablet master...");
    info!("  Cluster: {}", config.cluster_name);
    info!("  Cell tag: {} (primary {})", config.cell_tag, config.primary_cell_tag);
    info!("  Data dir: {:?}", config.data_dir);
    info!("  HTTP API: {}", config.http_addr);

    let master = TabletMaster::start(config.clone()).await?;

    // Single master per cell, so leadership is immediate.
    master.automaton().leader_active().await?;

    let app = master.router();
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP API listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    master.shutdown().await?;
    Ok(())
}
