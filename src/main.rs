// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use signal_sync::config::{Config, SyncNodeConfig};
use signal_sync::node::run_sync_node;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncNodeConfig::load(&args.config_path)?;
    let prometheus_registry = prometheus::Registry::new();

    let (syncer, server_handle) = run_sync_node(config, prometheus_registry).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            syncer.stop();
        }
        result = server_handle => {
            result.map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
        }
    }
    Ok(())
}
