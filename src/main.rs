//! Mock Request Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mock_request_server::{MockServer, MockServerConfig, PortValue};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-request-server",
    about = "Programmable HTTP test double - ordered request mappings with simulated latency and timeouts",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no mappings)");
        MockServerConfig::default()
    };

    if args.validate {
        println!(
            "Configuration is valid ({} mappings defined)",
            config.mappings.len()
        );
        return Ok(());
    }

    let port = args
        .port
        .map(PortValue::from)
        .or_else(|| config.port.clone())
        .context("No port given; pass --port or set `port` in the configuration")?;

    let mut server = MockServer::from_config(&config)?;
    server.start(port).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.close().await;

    Ok(())
}
