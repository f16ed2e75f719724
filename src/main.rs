use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use nodewave_bridge::bridge::{provision_nodes, BridgeHandle};
use nodewave_bridge::config::BridgeConfig;
use nodewave_bridge::persistence::node_store::SqliteNodeStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load().await?;
    info!(
        "Starting NodeWave bridge for broker {}",
        config.broker.endpoint()
    );

    let store_path = config.store.resolved_path();
    if let Some(parent) = store_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| eyre!("Failed to create store directory {}: {}", parent.display(), e))?;
    }
    let store = SqliteNodeStore::open(&store_path)?;

    let seeded = provision_nodes(&store, &config.provision)?;
    if seeded > 0 {
        info!("Provisioned {} nodes from config", seeded);
    }

    let bridge = BridgeHandle::spawn(&config, Arc::new(store))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Ctrl-C received");

    bridge.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
