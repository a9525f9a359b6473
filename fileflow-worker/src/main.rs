use anyhow::Result;
use fileflow_core::FlowConfig;
use fileflow_worker::logging::{self, LogFormat};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let mut config = FlowConfig::new();
    let overrides = config.load_env(fileflow_worker::ENV_PREFIX);
    let snapshot = config.snapshot();

    logging::init(LogFormat::from_snapshot(&snapshot))?;
    info!(overrides, "Loaded configuration");

    let mut worker = fileflow_worker::build(snapshot).await?;
    worker.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    worker.shutdown().await
}
