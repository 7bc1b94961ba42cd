// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::{Address, H256, U256};

/// Sentinel `authorizedUser` that makes a grant apply to any requester.
pub fn everyone() -> Address {
    Address::zero()
}

/// Uniquely identifies a log within the chain, independent of which path
/// (catch-up poll or live push) delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogIdentity {
    pub tx_hash: H256,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A user purchased access to every signal of a season.
    Subscribed {
        season_id: U256,
        subscriber: Address,
    },
    /// A trader published a new encrypted signal dataset into a season.
    SignalPublished {
        season_id: U256,
        signal_id: U256,
        protected_data: Address,
    },
    /// A season ended and its signals become publicly readable.
    SeasonClosed { season_id: U256 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub kind: EventKind,
}

impl ChainEvent {
    pub fn identity(&self) -> LogIdentity {
        LogIdentity {
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    pub fn season_id(&self) -> U256 {
        match &self.kind {
            EventKind::Subscribed { season_id, .. } => *season_id,
            EventKind::SignalPublished { season_id, .. } => *season_id,
            EventKind::SeasonClosed { season_id } => *season_id,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            EventKind::Subscribed { .. } => "subscribed",
            EventKind::SignalPublished { .. } => "signal_published",
            EventKind::SeasonClosed { .. } => "season_closed",
        }
    }
}

/// Orders a merged batch of events into strict chain order. Processing must
/// follow (block_number, log_index) ascending so that, for example, a
/// Subscribed in block N is handled before a SignalPublished in block N+1.
pub fn sort_events(events: &mut [ChainEvent]) {
    events.sort_by_key(|e| (e.block_number, e.log_index));
}
