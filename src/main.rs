//! # Credential Hub Entry Point

use anyhow::Context;
use credential_hub::{config::ConfigLoader, server::run_server, telemetry::init_tracing};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;

    init_tracing(&config).context("Failed to initialize tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    run_server(config).await
}
