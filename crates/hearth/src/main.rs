//! Hearth Hub
//!
//! Home-automation hub hosting device plugins and running automation tasks.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hearth::{Hub, HubConfig};

/// Hearth Home Automation Hub
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "Hearth Home Automation Hub", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the device database (overrides the configuration)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep devices in memory only
    #[arg(long, conflicts_with = "data_dir")]
    in_memory: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = HubConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.hub.data_dir = Some(dir);
    }
    if args.in_memory {
        config.hub.data_dir = None;
    }

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting Hearth v{}", env!("CARGO_PKG_VERSION"));
    let hub = Hub::start(config).await?;

    for (id, status) in hub.plugins().list() {
        info!("  - {} ({})", id, status);
    }

    shutdown_signal().await;
    hub.shutdown().await?;

    info!("Hearth stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hearth=info,hearth_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received terminate signal, shutting down..."),
    }
}
