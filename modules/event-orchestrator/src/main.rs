use tracing_subscriber::EnvFilter;

use event_orchestrator::{config::Config, connect_bus, Platform};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting event orchestrator...");

    let config = Config::from_env()?;
    tracing::info!(
        app = %config.app_name,
        bus_type = ?config.bus_type,
        catalog = ?config.topic_catalog_path,
        "Configuration loaded"
    );

    let bus = connect_bus(&config).await?;

    // Provisioning errors end the process here
    let platform = Platform::start(&config, bus).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    platform.shutdown().await;
    Ok(())
}
