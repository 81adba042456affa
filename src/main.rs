//! Chanmux development server
//!
//! Runs the SSH connection service behind a JSON-lines TCP transport so
//! channels, forwards and the demo console can be exercised by hand.

use anyhow::{Context, Result};
use chanmux::ServiceConfig;
use chanmux::server;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

/// Chanmux - SSH connection-layer service
#[derive(Parser, Debug)]
#[command(name = "chanmux", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/chanmux/chanmux.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let content = toml::to_string_pretty(&ServiceConfig::default())?;
        println!("{}", content);
        return Ok(());
    }

    let mut config = ServiceConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!("Starting chanmux");
    info!("  Listen address: {}", config.listen_addr);
    info!(
        "  Window: {} bytes, max packet: {} bytes",
        config.channel.initial_window_size, config.channel.max_packet_size
    );
    info!(
        "  Direct-tcpip: {} (non-local destinations: {})",
        config.forwarding.allow_direct_tcpip, config.forwarding.allow_nonlocal_destinations
    );

    server::run_server(Arc::new(config)).await
}
