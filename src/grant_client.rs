// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the off-chain access-control API that fronts the TEE.
//! Grant submission is idempotent: an "already granted" rejection is treated
//! as success so replays after a restart converge instead of erroring.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use reqwest::StatusCode;
use serde::Serialize;

use crate::error::{SyncError, SyncResult};

/// Payload dispatched to the access-control API for one (dataset, user) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrantRequest {
    pub protected_data: Address,
    pub authorized_user: Address,
    pub authorized_app: Address,
    pub allow_bulk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The API accepted and recorded a new grant.
    Applied,
    /// The grant already existed; nothing changed.
    AlreadyGranted,
}

#[async_trait]
pub trait AccessGranter: Send + Sync {
    async fn grant(&self, request: &AccessGrantRequest) -> SyncResult<GrantOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    AlreadyGranted,
    Transient,
    Permanent,
}

/// Buckets an API rejection. The "already granted" phrase list is the single
/// place that knows how the API words duplicate-grant rejections.
fn classify(status: Option<StatusCode>, message: &str) -> FailureKind {
    let msg = message.to_lowercase();
    if status == Some(StatusCode::CONFLICT)
        || msg.contains("already granted")
        || msg.contains("already exists")
        || msg.contains("already authorized")
        || msg.contains("duplicate grant")
    {
        return FailureKind::AlreadyGranted;
    }

    if let Some(status) = status {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return FailureKind::Transient;
        }
        // Remaining 4xx responses are permanent: retrying the same payload
        // cannot change the answer.
        return FailureKind::Permanent;
    }

    // No HTTP status means the transport failed before a response arrived.
    if msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("broken pipe")
        || msg.contains("reset")
        || msg.contains("unexpected eof")
        || msg.contains("temporarily unavailable")
        || msg.contains("rate limit")
    {
        return FailureKind::Transient;
    }
    FailureKind::Transient
}

struct GrantApiError {
    status: Option<StatusCode>,
    message: String,
}

/// Client for the data-protector grant endpoint.
#[derive(Debug, Clone)]
pub struct DataProtectorClient {
    http_client: reqwest::Client,
    api_url: String,
    api_token: String,
    max_attempts: usize,
    retry_backoff: Duration,
}

impl DataProtectorClient {
    pub fn new(api_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(64)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("Failed to build reqwest client")
                })
                .clone()
        }

        Self {
            http_client: shared_http_client(),
            api_url: api_url.into(),
            api_token: api_token.into(),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn grants_url(&self) -> String {
        format!("{}/grants", self.api_url.trim_end_matches('/'))
    }

    async fn try_grant(&self, request: &AccessGrantRequest) -> Result<(), GrantApiError> {
        let response = self
            .http_client
            .post(self.grants_url())
            .bearer_auth(&self.api_token)
            .json(request)
            .send()
            .await
            .map_err(|e| GrantApiError {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(GrantApiError {
            status: Some(status),
            message,
        })
    }
}

#[async_trait]
impl AccessGranter for DataProtectorClient {
    async fn grant(&self, request: &AccessGrantRequest) -> SyncResult<GrantOutcome> {
        let grant_failed = |reason: String| SyncError::GrantFailed {
            dataset: format!("{:?}", request.protected_data),
            user: format!("{:?}", request.authorized_user),
            reason,
        };

        for attempt in 1..=self.max_attempts {
            let err = match self.try_grant(request).await {
                Ok(()) => return Ok(GrantOutcome::Applied),
                Err(err) => err,
            };

            match classify(err.status, &err.message) {
                FailureKind::AlreadyGranted => {
                    tracing::debug!(
                        dataset = ?request.protected_data,
                        user = ?request.authorized_user,
                        "grant already present, treating as success"
                    );
                    return Ok(GrantOutcome::AlreadyGranted);
                }
                FailureKind::Transient if attempt < self.max_attempts => {
                    tracing::warn!(
                        dataset = ?request.protected_data,
                        user = ?request.authorized_user,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err.message,
                        "transient grant failure, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt as u32).await;
                }
                _ => {
                    return Err(grant_failed(match err.status {
                        Some(status) => format!("{}: {}", status, err.message),
                        None => err.message,
                    }));
                }
            }
        }
        Err(grant_failed("retry budget exhausted".to_string()))
    }
}
