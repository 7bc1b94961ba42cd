// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// RPC endpoint unreachable, rate limited, or returned a malformed response.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// Grant dispatch exhausted its retry budget or hit a permanent rejection.
    #[error("grant failed for dataset {dataset} user {user}: {reason}")]
    GrantFailed {
        dataset: String,
        user: String,
        reason: String,
    },

    /// A required configuration value is absent or unparseable.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Checkpoint file exists but cannot be read or parsed.
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// Checkpoint persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Uncategorized error.
    #[error("{0}")]
    Generic(String),
}

impl SyncError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            SyncError::ChainUnavailable(_) => "chain_unavailable",
            SyncError::GrantFailed { .. } => "grant_failed",
            SyncError::ConfigurationMissing(_) => "configuration_missing",
            SyncError::CheckpointCorrupt(_) => "checkpoint_corrupt",
            SyncError::Storage(_) => "storage_error",
            SyncError::Generic(_) => "generic",
        }
    }

    /// Whether the next catch-up cycle is expected to clear the error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::ChainUnavailable(_) | SyncError::Storage(_)
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
