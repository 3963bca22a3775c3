//! Ringmesh daemon binary
//!
//! Loads configuration and runs a node until interrupted.

use clap::Parser;
use ringmesh::{Config, Node};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Ringmesh overlay node daemon
#[derive(Parser, Debug)]
#[command(name = "ringmesh", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP port to bind (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("ringmesh starting");

    let (mut config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if let Some(port) = args.port {
        config.transports.udp.port = Some(port);
    }

    if !config.has_address() {
        warn!("No address configured, generating a random one");
    }

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        std::process::exit(1);
    }

    info!("Node address: {}", node.address());
    for ta in node.local_tas().iter() {
        info!("Advertised endpoint: {}", ta);
    }
    info!("ringmesh running, press Ctrl+C to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    node.stop().await;
    info!("ringmesh shutdown complete");
}
