// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Optional websocket listener. Logs are pushed into a bounded queue consumed
//! by a single task so live dispatch stays ordered; the catch-up poll path
//! remains authoritative and picks up anything the stream drops.

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address, Filter, ValueOrArray};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain_client::{
    decode_market_log, SeasonClosedFilter, SignalPublishedFilter, SubscribedFilter,
};
use crate::events::ChainEvent;
use crate::syncer::AccessSyncer;
use ethers::contract::EthEvent;

const LIVE_EVENT_QUEUE_SIZE: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscription filter matching the three marketplace events.
pub fn market_log_filter(contract_address: Address) -> Filter {
    Filter::new()
        .address(contract_address)
        .topic0(ValueOrArray::Array(vec![
            SubscribedFilter::signature(),
            SignalPublishedFilter::signature(),
            SeasonClosedFilter::signature(),
        ]))
}

/// Runs until cancelled, reconnecting with a fixed delay whenever the
/// websocket drops.
pub async fn run_live_listener(
    ws_url: String,
    contract_address: Address,
    syncer: Arc<AccessSyncer>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<ChainEvent>(LIVE_EVENT_QUEUE_SIZE);

    let consumer_cancel = cancel.clone();
    let consumer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = consumer_cancel.cancelled() => break,
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => syncer.handle_live_event(event).await,
                    None => break,
                },
            }
        }
    });

    stream_logs(&ws_url, contract_address, tx, cancel).await;
    let _ = consumer.await;
    tracing::info!("live listener stopped");
}

async fn stream_logs(
    ws_url: &str,
    contract_address: Address,
    tx: mpsc::Sender<ChainEvent>,
    cancel: CancellationToken,
) {
    let filter = market_log_filter(contract_address);
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let provider = match Provider::<Ws>::connect(ws_url).await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(error = %e, "websocket connect failed, retrying");
                if wait_or_cancelled(&cancel).await {
                    return;
                }
                continue;
            }
        };
        let mut stream = match provider.subscribe_logs(&filter).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "log subscription failed, retrying");
                if wait_or_cancelled(&cancel).await {
                    return;
                }
                continue;
            }
        };
        tracing::info!(contract = ?contract_address, "live log subscription established");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe_log = stream.next() => match maybe_log {
                    Some(log) => match decode_market_log(&log) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => tracing::debug!(topics = ?log.topics, "unrecognized live log"),
                        Err(e) => tracing::warn!(error = %e, "undecodable live log"),
                    },
                    None => {
                        tracing::warn!("live log stream ended, reconnecting");
                        break;
                    }
                },
            }
        }

        if wait_or_cancelled(&cancel).await {
            return;
        }
    }
}

/// Returns true if cancellation fired during the reconnect delay.
async fn wait_or_cancelled(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}
