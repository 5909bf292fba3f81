// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::stream;

use crate::{
    error::ProviderError,
    provider::{ChunkStream, ModelProvider},
    types::{ApiMessage, ModelInfo, StreamChunk, ToolFunction, UsageChunk},
};

/// One scripted `create_message` call.
pub enum ScriptedCall {
    /// The call itself fails before any chunk is produced.
    Fail(ProviderError),
    /// The call yields this exact chunk sequence (errors allowed mid-stream).
    Chunks(Vec<Result<StreamChunk, ProviderError>>),
}

/// Captured copy of the last request, for assertions.
#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    pub system_prompt: String,
    pub transcript: Vec<ApiMessage>,
    pub tool_count: usize,
}

/// A pre-scripted provider.  Each `create_message` call pops the next script
/// from the front of the queue, so tests can specify exact chunk sequences —
/// including failures — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<ScriptedCall>>,
    context_window: usize,
    native_tools: bool,
    forces_parallel: bool,
    pub call_count: AtomicU32,
    pub abort_called: AtomicBool,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CapturedRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            context_window: 200_000,
            native_tools: false,
            forces_parallel: false,
            call_count: AtomicU32::new(0),
            abort_called: AtomicBool::new(false),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_native_tools(mut self) -> Self {
        self.native_tools = true;
        self
    }

    pub fn with_forced_parallel(mut self) -> Self {
        self.forces_parallel = true;
        self
    }

    /// Convenience: a single call that streams `text` then a usage chunk.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(vec![Self::text_call(text)])
    }

    /// A script entry streaming `text` followed by a usage chunk.
    pub fn text_call(text: impl Into<String>) -> ScriptedCall {
        ScriptedCall::Chunks(vec![
            Ok(StreamChunk::Text { text: text.into() }),
            Ok(StreamChunk::Usage(UsageChunk {
                input_tokens: 10,
                output_tokens: 10,
                ..Default::default()
            })),
        ])
    }

    /// A script entry that streams the given text split into `n`-byte deltas,
    /// exercising the incremental parser the way a real stream would.
    pub fn chunked_text_call(text: &str, n: usize) -> ScriptedCall {
        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = text
            .as_bytes()
            .chunks(n.max(1))
            .map(|c| {
                Ok(StreamChunk::Text {
                    text: String::from_utf8_lossy(c).into_owned(),
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk::Usage(UsageChunk {
            input_tokens: 10,
            output_tokens: 10,
            ..Default::default()
        })));
        ScriptedCall::Chunks(chunks)
    }

    /// A script entry that emits only a usage chunk (an empty reply).
    pub fn empty_call() -> ScriptedCall {
        ScriptedCall::Chunks(vec![Ok(StreamChunk::Usage(UsageChunk {
            input_tokens: 10,
            output_tokens: 0,
            ..Default::default()
        }))])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider_id: "scripted".into(),
            model_id: "scripted-model".into(),
        }
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    fn forces_parallel_tool_calls(&self) -> bool {
        self.forces_parallel
    }

    async fn create_message(
        &self,
        system_prompt: &str,
        transcript: &[ApiMessage],
        tools: Option<&[ToolFunction]>,
    ) -> Result<ChunkStream, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(CapturedRequest {
            system_prompt: system_prompt.to_string(),
            transcript: transcript.to_vec(),
            tool_count: tools.map(<[_]>::len).unwrap_or(0),
        });

        let call = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback once all scripts are consumed.
                ScriptedCall::Chunks(vec![Ok(StreamChunk::Text {
                    text: "[no more scripts]".into(),
                })])
            } else {
                scripts.remove(0)
            }
        };
        match call {
            ScriptedCall::Fail(e) => Err(e),
            ScriptedCall::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks))),
        }
    }

    fn abort(&self) {
        self.abort_called.store(true, Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
