// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::RawLog;
use ethers::contract::abigen;
use ethers::prelude::EthEvent;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, BigEndianHash, BlockNumber, Filter, Log, H256, U256};

use crate::error::{SyncError, SyncResult};
use crate::events::{ChainEvent, EventKind};

abigen!(
    SignalMarket,
    r#"[
        event Subscribed(uint256 indexed seasonId, address indexed subscriber)
        event SignalPublished(uint256 indexed seasonId, uint256 indexed signalId, address protectedData)
        event SeasonClosed(uint256 indexed seasonId)
        function getSeasonSignalIds(uint256 seasonId) external view returns (uint256[] memory)
        function getSeasonSubscribers(uint256 seasonId) external view returns (address[] memory)
        function getSignal(uint256 signalId) external view returns (uint256 seasonId, address trader, address protectedData)
        function isSubscribed(uint256 seasonId, address subscriber) external view returns (bool)
        function isSignalPublic(uint256 signalId) external view returns (bool)
    ]"#
);

/// On-chain record of one published signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub season_id: U256,
    pub trader: Address,
    pub protected_data: Address,
}

/// Read-only view of the signal marketplace contract.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn latest_block(&self) -> SyncResult<u64>;

    /// Fetches Subscribed, SignalPublished and SeasonClosed logs in the
    /// inclusive block range. Order across event kinds is not guaranteed;
    /// callers sort before processing.
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> SyncResult<Vec<ChainEvent>>;

    async fn season_signal_ids(&self, season_id: U256) -> SyncResult<Vec<U256>>;

    async fn signal(&self, signal_id: U256) -> SyncResult<SignalInfo>;

    async fn season_subscribers(&self, season_id: U256) -> SyncResult<Vec<Address>>;

    async fn is_subscribed(&self, season_id: U256, subscriber: Address) -> SyncResult<bool>;

    /// Whether a signal has been opened to everyone. Callers must treat an
    /// error here as "not public" so access is never widened on bad data.
    async fn is_signal_public(&self, signal_id: U256) -> SyncResult<bool>;
}

/// Decodes a raw marketplace log into a [`ChainEvent`]. Returns `Ok(None)`
/// for logs whose topic0 is not one of the three marketplace events.
pub fn decode_market_log(log: &Log) -> SyncResult<Option<ChainEvent>> {
    let Some(topic0) = log.topics.first().copied() else {
        return Ok(None);
    };

    let block_number = log
        .block_number
        .ok_or_else(|| SyncError::ChainUnavailable("log without block number".to_string()))?
        .as_u64();
    let log_index = log
        .log_index
        .ok_or_else(|| SyncError::ChainUnavailable("log without log index".to_string()))?
        .as_u64();
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| SyncError::ChainUnavailable("log without transaction hash".to_string()))?;

    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let decode_err =
        |e: ethers::abi::Error| SyncError::ChainUnavailable(format!("undecodable log: {}", e));

    let kind = if topic0 == SubscribedFilter::signature() {
        let ev = SubscribedFilter::decode_log(&raw).map_err(decode_err)?;
        EventKind::Subscribed {
            season_id: ev.season_id,
            subscriber: ev.subscriber,
        }
    } else if topic0 == SignalPublishedFilter::signature() {
        let ev = SignalPublishedFilter::decode_log(&raw).map_err(decode_err)?;
        EventKind::SignalPublished {
            season_id: ev.season_id,
            signal_id: ev.signal_id,
            protected_data: ev.protected_data,
        }
    } else if topic0 == SeasonClosedFilter::signature() {
        let ev = SeasonClosedFilter::decode_log(&raw).map_err(decode_err)?;
        EventKind::SeasonClosed {
            season_id: ev.season_id,
        }
    } else {
        return Ok(None);
    };

    Ok(Some(ChainEvent {
        block_number,
        log_index,
        tx_hash,
        kind,
    }))
}

/// Left-pads an address into a 32-byte indexed-topic value.
pub(crate) fn address_topic(address: Address) -> H256 {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(address.as_bytes());
    H256::from(padded)
}

pub(crate) fn dedupe_addresses(addresses: Vec<Address>) -> Vec<Address> {
    let mut seen = HashSet::new();
    addresses.into_iter().filter(|a| seen.insert(*a)).collect()
}

/// [`ChainReader`] backed by an ethers provider. Direct contract accessors
/// are preferred; when one fails (pruned node, older contract revision) the
/// client falls back to replaying Subscribed logs from `replay_from_block`.
pub struct EthChainReader<P> {
    provider: Arc<Provider<P>>,
    contract: SignalMarket<Provider<P>>,
    contract_address: Address,
    replay_from_block: u64,
}

impl<P> EthChainReader<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(provider: Provider<P>, contract_address: Address, replay_from_block: u64) -> Self {
        let provider = Arc::new(provider);
        let contract = SignalMarket::new(contract_address, provider.clone());
        Self {
            provider,
            contract,
            contract_address,
            replay_from_block,
        }
    }

    /// Logs chain id and head block, validating connectivity at startup.
    pub async fn describe(&self) -> SyncResult<()> {
        let chain_id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("get_chainid: {}", e)))?;
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("get_block_number: {}", e)))?;
        tracing::info!(
            chain_id = chain_id.as_u64(),
            head_block = block.as_u64(),
            contract = ?self.contract_address,
            "connected to signal marketplace chain"
        );
        Ok(())
    }

    async fn get_logs(&self, filter: &Filter) -> SyncResult<Vec<Log>> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("get_logs: {}", e)))
    }

    /// Replays Subscribed logs for a season, optionally narrowed to a single
    /// subscriber via the indexed second topic.
    async fn replay_subscribed_logs(
        &self,
        season_id: U256,
        subscriber: Option<Address>,
    ) -> SyncResult<Vec<Address>> {
        let mut filter = Filter::new()
            .address(self.contract_address)
            .from_block(self.replay_from_block)
            .to_block(BlockNumber::Latest)
            .topic0(SubscribedFilter::signature())
            .topic1(H256::from_uint(&season_id));
        if let Some(subscriber) = subscriber {
            filter = filter.topic2(address_topic(subscriber));
        }

        let logs = self.get_logs(&filter).await?;
        let mut subscribers = Vec::with_capacity(logs.len());
        for log in &logs {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };
            let ev = SubscribedFilter::decode_log(&raw)
                .map_err(|e| SyncError::ChainUnavailable(format!("undecodable log: {}", e)))?;
            subscribers.push(ev.subscriber);
        }
        Ok(dedupe_addresses(subscribers))
    }
}

#[async_trait]
impl<P> ChainReader for EthChainReader<P>
where
    P: JsonRpcClient + 'static,
{
    async fn latest_block(&self) -> SyncResult<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("get_block_number: {}", e)))?;
        Ok(block.as_u64())
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> SyncResult<Vec<ChainEvent>> {
        let base = Filter::new()
            .address(self.contract_address)
            .from_block(from_block)
            .to_block(to_block);
        let subscribed = base.clone().topic0(SubscribedFilter::signature());
        let published = base.clone().topic0(SignalPublishedFilter::signature());
        let closed = base.topic0(SeasonClosedFilter::signature());

        let (subscribed, published, closed) = futures::try_join!(
            self.get_logs(&subscribed),
            self.get_logs(&published),
            self.get_logs(&closed),
        )?;

        let mut events = Vec::with_capacity(subscribed.len() + published.len() + closed.len());
        for log in subscribed.iter().chain(&published).chain(&closed) {
            match decode_market_log(log)? {
                Some(event) => events.push(event),
                None => tracing::warn!(topics = ?log.topics, "skipping unrecognized log"),
            }
        }
        Ok(events)
    }

    async fn season_signal_ids(&self, season_id: U256) -> SyncResult<Vec<U256>> {
        self.contract
            .get_season_signal_ids(season_id)
            .call()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("getSeasonSignalIds: {}", e)))
    }

    async fn signal(&self, signal_id: U256) -> SyncResult<SignalInfo> {
        let (season_id, trader, protected_data) = self
            .contract
            .get_signal(signal_id)
            .call()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("getSignal: {}", e)))?;
        Ok(SignalInfo {
            season_id,
            trader,
            protected_data,
        })
    }

    async fn season_subscribers(&self, season_id: U256) -> SyncResult<Vec<Address>> {
        match self.contract.get_season_subscribers(season_id).call().await {
            Ok(subscribers) => Ok(dedupe_addresses(subscribers)),
            Err(e) => {
                tracing::warn!(
                    season_id = %season_id,
                    error = %e,
                    "getSeasonSubscribers failed, replaying Subscribed logs"
                );
                self.replay_subscribed_logs(season_id, None).await
            }
        }
    }

    async fn is_subscribed(&self, season_id: U256, subscriber: Address) -> SyncResult<bool> {
        match self.contract.is_subscribed(season_id, subscriber).call().await {
            Ok(subscribed) => Ok(subscribed),
            Err(e) => {
                tracing::warn!(
                    season_id = %season_id,
                    subscriber = ?subscriber,
                    error = %e,
                    "isSubscribed failed, replaying Subscribed logs"
                );
                let matches = self
                    .replay_subscribed_logs(season_id, Some(subscriber))
                    .await?;
                Ok(!matches.is_empty())
            }
        }
    }

    async fn is_signal_public(&self, signal_id: U256) -> SyncResult<bool> {
        self.contract
            .is_signal_public(signal_id)
            .call()
            .await
            .map_err(|e| SyncError::ChainUnavailable(format!("isSignalPublic: {}", e)))
    }
}
