// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod loader;
pub mod schema;

pub use loader::{config_path, load, load_from};
pub use schema::{
    AutoApprovalConfig, CheckpointConfig, Config, ContextConfig, EngineConfig, FocusChainConfig,
    StorageConfig,
};
