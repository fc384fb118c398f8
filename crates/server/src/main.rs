//! scenariodb remote build server entry point.
//!
//! Logs go to stderr as JSON; the filter comes from `RUST_LOG`.

use anyhow::{Context, Result};
use scenariodb_server::{AppState, ServerConfig, router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = ServerConfig::load().context("loading server configuration")?;
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    tracing::info!(
        "Starting scenariodb remote build server on {} (project root {})",
        config.bind,
        config.project_root.display()
    );

    axum::serve(listener, router(AppState::new(config)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
