use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use waddle_router::{RoutingServer, ServerContext};

mod config;
mod telemetry;

use crate::config::{CliArgs, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        println!("{}", ServerConfig::default_toml()?);
        return Ok(());
    }

    let settings = ServerConfig::load(&cli)?;
    if cli.validate {
        settings
            .router
            .validate()
            .context("Configuration validation failed")?;
        println!("Configuration is valid");
        return Ok(());
    }

    telemetry::init(&settings.telemetry)?;

    info!("Waddle Server starting...");
    info!(version = env!("CARGO_PKG_VERSION"), domain = %settings.router.domain, "Routing core configured");

    let context = ServerContext::builder(settings.router)
        .build()
        .context("Failed to build the routing context")?;
    let server = RoutingServer::start(context);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    server.shutdown().await;
    telemetry::shutdown();
    Ok(())
}
