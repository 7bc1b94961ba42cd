// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, U256};

use crate::chain_client::{ChainReader, SignalInfo};
use crate::error::{SyncError, SyncResult};
use crate::events::ChainEvent;
use crate::grant_client::{AccessGrantRequest, AccessGranter, GrantOutcome};

/// Scriptable in-memory marketplace used by engine tests.
#[derive(Debug, Default)]
pub struct MockChainReader {
    latest: AtomicU64,
    events: Mutex<Vec<ChainEvent>>,
    fetch_calls: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_is_public: AtomicBool,
    season_signals: Mutex<HashMap<U256, Vec<U256>>>,
    signals: Mutex<HashMap<U256, SignalInfo>>,
    subscribers: Mutex<HashMap<U256, Vec<Address>>>,
    public_signals: Mutex<HashSet<U256>>,
}

impl MockChainReader {
    pub fn new(latest: u64) -> Self {
        Self {
            latest: AtomicU64::new(latest),
            ..Default::default()
        }
    }

    pub fn set_latest(&self, block: u64) {
        self.latest.store(block, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: ChainEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn add_signal(&self, season: u64, signal: u64, info: SignalInfo) {
        let season = U256::from(season);
        let signal = U256::from(signal);
        self.season_signals
            .lock()
            .unwrap()
            .entry(season)
            .or_default()
            .push(signal);
        self.signals.lock().unwrap().insert(signal, info);
    }

    pub fn set_subscribers(&self, season: u64, subscribers: Vec<Address>) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(U256::from(season), subscribers);
    }

    pub fn mark_public(&self, signal: u64) {
        self.public_signals.lock().unwrap().insert(U256::from(signal));
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_is_public(&self, fail: bool) {
        self.fail_is_public.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn latest_block(&self) -> SyncResult<u64> {
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> SyncResult<Vec<ChainEvent>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(SyncError::ChainUnavailable("mock outage".to_string()));
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn season_signal_ids(&self, season_id: U256) -> SyncResult<Vec<U256>> {
        Ok(self
            .season_signals
            .lock()
            .unwrap()
            .get(&season_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn signal(&self, signal_id: U256) -> SyncResult<SignalInfo> {
        self.signals
            .lock()
            .unwrap()
            .get(&signal_id)
            .cloned()
            .ok_or_else(|| SyncError::ChainUnavailable(format!("unknown signal {}", signal_id)))
    }

    async fn season_subscribers(&self, season_id: U256) -> SyncResult<Vec<Address>> {
        Ok(self
            .subscribers
            .lock()
            .unwrap()
            .get(&season_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_subscribed(&self, season_id: U256, subscriber: Address) -> SyncResult<bool> {
        Ok(self
            .subscribers
            .lock()
            .unwrap()
            .get(&season_id)
            .map_or(false, |subs| subs.contains(&subscriber)))
    }

    async fn is_signal_public(&self, signal_id: U256) -> SyncResult<bool> {
        if self.fail_is_public.load(Ordering::SeqCst) {
            return Err(SyncError::ChainUnavailable("mock outage".to_string()));
        }
        Ok(self.public_signals.lock().unwrap().contains(&signal_id))
    }
}

/// Idempotent in-memory granter. Repeated grants for the same (dataset, user)
/// pair come back as [`GrantOutcome::AlreadyGranted`], mirroring the API.
#[derive(Debug, Default)]
pub struct MockGranter {
    applied: Mutex<Vec<(Address, Address)>>,
    seen: Mutex<HashSet<(Address, Address)>>,
    fail_datasets: Mutex<HashSet<Address>>,
}

impl MockGranter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants applied so far, in dispatch order.
    pub fn applied(&self) -> Vec<(Address, Address)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn fail_dataset(&self, dataset: Address) {
        self.fail_datasets.lock().unwrap().insert(dataset);
    }

    pub fn clear_failures(&self) {
        self.fail_datasets.lock().unwrap().clear();
    }
}

#[async_trait]
impl AccessGranter for MockGranter {
    async fn grant(&self, request: &AccessGrantRequest) -> SyncResult<GrantOutcome> {
        if self
            .fail_datasets
            .lock()
            .unwrap()
            .contains(&request.protected_data)
        {
            return Err(SyncError::GrantFailed {
                dataset: format!("{:?}", request.protected_data),
                user: format!("{:?}", request.authorized_user),
                reason: "mock failure".to_string(),
            });
        }
        let key = (request.protected_data, request.authorized_user);
        if !self.seen.lock().unwrap().insert(key) {
            return Ok(GrantOutcome::AlreadyGranted);
        }
        self.applied.lock().unwrap().push(key);
        Ok(GrantOutcome::Applied)
    }
}
