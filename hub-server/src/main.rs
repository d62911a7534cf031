//! peerhub-server binary entry point.
//!
//! Usage:
//! ```bash
//! peerhub-server --config hub.toml
//! ```

use anyhow::Context;
use peerhub_server::cost::{CostProvider, HttpCostProvider, StaticCostProvider};
use peerhub_server::http::build_router;
use peerhub_server::sink::TracingMetricsSink;
use peerhub_server::{Config, CoordinatorState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = get_config_path();
    let config = load_config(&path)?;
    let bind_address = config.server.bind_address.clone();

    let provider: Arc<dyn CostProvider> = match &config.cost.provider_url {
        Some(url) => Arc::new(
            HttpCostProvider::new(url.clone(), Duration::from_secs(config.cost.timeout_secs))
                .context("building cost provider")?,
        ),
        None => {
            tracing::warn!("no cost provider configured, admission runs at zero spend");
            Arc::new(StaticCostProvider::zero())
        }
    };

    let state = Arc::new(
        CoordinatorState::new(config, provider, Arc::new(TracingMetricsSink))
            .context("invalid configuration")?,
    );
    state.start().await;

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(
        address = %bind_address,
        version = env!("CARGO_PKG_VERSION"),
        "peerhub-server listening"
    );

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.shutdown();
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hub.toml"))
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        let config = Config::from_file(path)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    } else {
        tracing::warn!(path = %path.display(), "configuration file not found, using defaults");
        Ok(Config::default())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
