// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use ethers::types::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::{SyncError, SyncResult};

/// Loads YAML (by extension) or JSON config files; saves as JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
            || path.extension().and_then(|s| s.to_str()) == Some("yml")
        {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint. Authoritative for polling and view calls.
    pub rpc_url: String,
    /// Optional websocket endpoint enabling the live listener.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ws_url: Option<String>,
    /// Signal marketplace contract address.
    pub market_contract_address: String,
    /// Earliest block consulted when replaying Subscribed logs as a fallback
    /// for failed direct accessors. Usually the contract deployment block.
    #[serde(default)]
    pub replay_from_block: u64,
    /// How far behind the head a fresh deployment starts scanning.
    #[serde(default = "default_start_block_delta")]
    pub start_block_delta: u64,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccessApiConfig {
    /// Base URL of the access-control API fronting the TEE.
    pub api_url: String,
    pub api_token: String,
    /// TEE application address included in every grant.
    pub authorized_app: String,
    #[serde(default = "default_true")]
    pub allow_bulk: bool,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncNodeConfig {
    #[serde(default = "default_server_port")]
    pub server_listen_port: u16,
    pub chain: ChainConfig,
    pub access: AccessApiConfig,
    #[serde(default = "default_catchup_interval_secs")]
    pub catchup_interval_secs: u64,
    /// When true and a ws-url is configured, run the live push listener.
    #[serde(default)]
    pub live_listener_enabled: bool,
    pub checkpoint_path: PathBuf,
}

impl Config for SyncNodeConfig {}

/// Config fields parsed into their runtime types.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub market_contract_address: Address,
    pub authorized_app: Address,
    pub catchup_interval: Duration,
    pub server_socket_address: SocketAddr,
}

impl SyncNodeConfig {
    pub fn validate(&self) -> SyncResult<ValidatedConfig> {
        if self.chain.rpc_url.is_empty() {
            return Err(SyncError::ConfigurationMissing("chain.rpc-url".to_string()));
        }
        if self.access.api_url.is_empty() {
            return Err(SyncError::ConfigurationMissing(
                "access.api-url".to_string(),
            ));
        }
        if self.access.api_token.is_empty() {
            return Err(SyncError::ConfigurationMissing(
                "access.api-token".to_string(),
            ));
        }
        let market_contract_address: Address =
            self.chain.market_contract_address.parse().map_err(|_| {
                SyncError::ConfigurationMissing(format!(
                    "chain.market-contract-address is not a valid address: {}",
                    self.chain.market_contract_address
                ))
            })?;
        let authorized_app: Address = self.access.authorized_app.parse().map_err(|_| {
            SyncError::ConfigurationMissing(format!(
                "access.authorized-app is not a valid address: {}",
                self.access.authorized_app
            ))
        })?;
        if self.live_listener_enabled && self.chain.ws_url.is_none() {
            return Err(SyncError::ConfigurationMissing(
                "chain.ws-url (required when live-listener-enabled)".to_string(),
            ));
        }
        Ok(ValidatedConfig {
            market_contract_address,
            authorized_app,
            catchup_interval: Duration::from_secs(self.catchup_interval_secs),
            server_socket_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.server_listen_port,
            ),
        })
    }
}

fn default_server_port() -> u16 {
    9191
}

fn default_start_block_delta() -> u64 {
    10_000
}

fn default_catchup_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
