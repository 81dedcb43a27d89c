// ABOUTME: Main entry point for the switchyard gateway
// ABOUTME: Parses CLI flags, initializes logging and config, and runs the HTTP server

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use switchyard::{config::Config, server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OpenAI- and Anthropic-compatible gateway in front of an agent backend
#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// Path to the TOML config file (default: ./switchyard.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding config and environment
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind, overriding config and environment
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend.backend_type(),
        addr = %config.bind_addr(),
        "Starting switchyard"
    );

    server::start_server(config).await
}
