//! SwapRail node binary.
//!
//! Runs the currency sync daemon and the swap consumer until Ctrl+C.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swaprail_service::{ServiceConfig, SwapRail};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ServiceConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SwapRail");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let node = SwapRail::connect(config).await?;
    node.start().await?;

    info!(
        daemon_enabled = node.config().daemon_enabled,
        exchanges = node.engine().exchanges().len(),
        "SwapRail running"
    );

    // Wait for Ctrl+C, then shut down
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
    } else {
        info!("Shutdown signal received");
    }

    node.stop().await?;

    info!("SwapRail shutdown complete");
    Ok(())
}
