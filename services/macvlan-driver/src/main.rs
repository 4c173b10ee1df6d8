//! Macvlan network driver
//!
//! Opens the local store, restores networks and endpoints persisted by a
//! previous run, then serves until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mvlan_driver::config::Config;
use mvlan_driver::{Driver, IpLinkOps, SqliteStore, SwarmClient};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        orchestrator_url = %config.orchestrator_url,
        data_dir = %config.data_dir.display(),
        delete_attempts = config.store_delete_attempts,
        "Starting macvlan driver"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = SqliteStore::open(config.store_path()).context("opening store")?;
    let orchestrator = SwarmClient::new(&config).context("building orchestrator client")?;

    let driver = Driver::new(
        Arc::new(store),
        Arc::new(IpLinkOps::new()),
        Arc::new(orchestrator),
        config.retry_policy(),
    );

    let report = driver.bootstrap().await?;
    info!(
        networks = report.networks_restored,
        endpoints = report.endpoints_restored,
        pruned = report.endpoints_pruned,
        "Macvlan driver ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down macvlan driver");

    Ok(())
}
