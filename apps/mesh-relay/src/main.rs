use anyhow::{Context, Result};
use clap::Parser;
use mesh_relay::{router, Cli, Relay, RelayConfig};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::try_from(Cli::parse())?;
    run(config).await
}

async fn run(config: RelayConfig) -> Result<()> {
    let relay = Relay::new();
    let app = router(relay);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(listen_addr = %config.listen_addr, "mesh relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if !config.shutdown_grace.is_zero() {
        info!(
            grace_seconds = config.shutdown_grace.as_secs(),
            "shutdown signal received; waiting out grace period"
        );
        tokio::time::sleep(config.shutdown_grace).await;
    }
    info!("mesh relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
