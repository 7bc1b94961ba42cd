// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Durable record of reconciliation progress. Only `last_synced_block` is
/// persisted; the processed-log cache is rebuilt from grant idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_synced_block: u64,
}

/// File-backed checkpoint store. Writes go through a temp file followed by a
/// rename so a crash mid-write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted checkpoint. A missing file is `Ok(None)`; an
    /// unreadable or unparseable file is `CheckpointCorrupt` and the caller
    /// decides how to degrade.
    pub fn read(&self) -> SyncResult<Option<SyncCheckpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::CheckpointCorrupt(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let checkpoint: SyncCheckpoint = serde_json::from_str(&raw).map_err(|e| {
            SyncError::CheckpointCorrupt(format!(
                "failed to parse {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(checkpoint))
    }

    /// Atomically overwrites the checkpoint. Callers enforce monotonicity;
    /// the store just persists whatever it is given.
    pub fn write(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::Storage(format!(
                        "failed to create checkpoint dir {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| SyncError::Storage(format!("failed to serialize checkpoint: {}", e)))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized).map_err(|e| {
            SyncError::Storage(format!("failed to write {}: {}", tmp_path.display(), e))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            SyncError::Storage(format!(
                "failed to move checkpoint into place at {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
