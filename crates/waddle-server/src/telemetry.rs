//! Log output for the server process.
//!
//! `RUST_LOG` takes precedence over the configured filter. The routing
//! core records its metrics through the global OpenTelemetry meter; with no
//! meter provider installed those instruments are no-ops.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

/// Install the global tracing subscriber.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .with_context(|| format!("Invalid log filter '{}'", config.filter))?;

    let (json_layer, text_layer) = if config.json {
        (
            Some(fmt::layer().json().with_current_span(true).with_target(true)),
            None,
        )
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(json = config.json, "Telemetry initialized");
    Ok(())
}

/// Flush log output before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}

