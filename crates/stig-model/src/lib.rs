// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod error;
pub mod mock;
pub mod provider;
pub mod replay;
pub mod types;

pub use error::{ProviderError, ProviderErrorKind};
pub use mock::ScriptedProvider;
pub use provider::{ChunkStream, ModelProvider};
pub use replay::ReplayProvider;
pub use types::{
    ApiMessage, ContentBlock, ModelInfo, Role, StreamChunk, ToolFunction, UsageChunk,
};
