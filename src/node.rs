// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Result;
use ethers::providers::{Http, Provider};

use crate::chain_client::EthChainReader;
use crate::checkpoint::CheckpointStore;
use crate::config::SyncNodeConfig;
use crate::grant_client::DataProtectorClient;
use crate::live::run_live_listener;
use crate::metrics::SyncMetrics;
use crate::server::{run_server, AppState};
use crate::syncer::{AccessSyncer, SyncerOptions};

/// Wires up the chain reader, grant client, reconciliation engine, optional
/// live listener, and HTTP server. Returns the engine (for shutdown) and the
/// server task handle.
pub async fn run_sync_node(
    config: SyncNodeConfig,
    registry: prometheus::Registry,
) -> Result<(Arc<AccessSyncer>, tokio::task::JoinHandle<()>)> {
    let validated = config.validate()?;
    let metrics = Arc::new(SyncMetrics::new(&registry));

    let provider = Provider::<Http>::try_from(config.chain.rpc_url.as_str())?;
    let reader = Arc::new(EthChainReader::new(
        provider,
        validated.market_contract_address,
        config.chain.replay_from_block,
    ));
    reader.describe().await?;

    let granter = Arc::new(DataProtectorClient::new(
        config.access.api_url.clone(),
        config.access.api_token.clone(),
    ));

    let syncer = Arc::new(AccessSyncer::new(
        reader.clone(),
        granter,
        CheckpointStore::new(&config.checkpoint_path),
        SyncerOptions {
            authorized_app: validated.authorized_app,
            allow_bulk: config.access.allow_bulk,
            start_block_delta: config.chain.start_block_delta,
            catchup_interval: validated.catchup_interval,
        },
        metrics.clone(),
    ));

    let cancel = syncer.start();

    if config.live_listener_enabled {
        // validate() guarantees ws-url is present when the listener is enabled
        if let Some(ws_url) = config.chain.ws_url.clone() {
            tokio::spawn(run_live_listener(
                ws_url,
                validated.market_contract_address,
                syncer.clone(),
                cancel,
            ));
        }
    }

    let state = Arc::new(AppState {
        syncer: syncer.clone(),
        chain: reader,
        metrics,
        registry,
    });
    tracing::info!(
        listen = %validated.server_socket_address,
        "starting signal-sync server"
    );
    let server_handle = run_server(&validated.server_socket_address, state);
    Ok((syncer, server_handle))
}
