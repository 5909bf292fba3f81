// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    error::ProviderError,
    types::{ApiMessage, ModelInfo, StreamChunk, ToolFunction, UsageChunk},
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// The engine's view of an LLM backend.
///
/// Concrete HTTP clients live outside this workspace; the engine only needs
/// a stream of typed chunks, an abort hook, and a handful of capability
/// queries that influence request construction.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_info(&self) -> ModelInfo;

    /// Context window size in tokens for the active model.
    fn context_window(&self) -> usize;

    /// Whether this model accepts structured tool definitions.  When false
    /// the engine describes tools in the system prompt and parses tool tags
    /// out of the text stream.
    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Model families that always execute several tool calls per turn report
    /// true here; it overrides the user's parallel-tool-calls setting.
    fn forces_parallel_tool_calls(&self) -> bool {
        false
    }

    /// Send a request and return the chunk stream.  The transcript passed in
    /// has the deleted range already masked out.
    async fn create_message(
        &self,
        system_prompt: &str,
        transcript: &[ApiMessage],
        tools: Option<&[ToolFunction]>,
    ) -> Result<ChunkStream, ProviderError>;

    /// Best-effort: tear down the in-flight request so no further chunks
    /// arrive.
    fn abort(&self) {}

    /// Late usage fetch for streams that ended without a usage chunk.
    async fn fetch_stream_usage(&self) -> Option<UsageChunk> {
        None
    }
}
