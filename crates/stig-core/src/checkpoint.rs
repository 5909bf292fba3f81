// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

/// What a restore touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Truncate the message log and transcript only.
    Task,
    /// Revert workspace files only.
    Workspace,
    /// Both of the above.
    Both,
}

/// Shadow-VCS snapshots of the workspace, tied to message timestamps.
/// Opaque to the driver beyond this contract.
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Commit the current workspace state; returns the commit hash.
    async fn commit(&self) -> anyhow::Result<String>;

    async fn save_checkpoint(
        &self,
        is_completion: bool,
        message_ts: Option<u64>,
    ) -> anyhow::Result<()>;

    async fn latest_completion_has_new_changes(&self) -> anyhow::Result<bool>;

    async fn restore(
        &self,
        message_ts: u64,
        mode: RestoreMode,
        offset: Option<u32>,
    ) -> anyhow::Result<()>;
}

/// Checkpointing disabled: every operation succeeds and does nothing.
pub struct NoopCheckpoints;

#[async_trait]
impl CheckpointManager for NoopCheckpoints {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn save_checkpoint(
        &self,
        _is_completion: bool,
        _message_ts: Option<u64>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn latest_completion_has_new_changes(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn restore(
        &self,
        _message_ts: u64,
        _mode: RestoreMode,
        _offset: Option<u32>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
