// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! YAML-configured replay provider for end-to-end and CLI tests.
//!
//! The provider reads a YAML file that maps input patterns to canned
//! responses.  A reply is emitted as a sequence of text deltas (so the
//! incremental decoder is exercised realistically); native tool calls can be
//! scripted explicitly for the structured tool-call path.
//!
//! # YAML format
//!
//! ```yaml
//! responses:
//!   - match_type: contains       # contains | equals | starts_with | regex | default
//!     pattern: "list the files"
//!     reply: |
//!       <list_files>
//!       <path>.</path>
//!       </list_files>
//!
//!   - match_type: default
//!     reply: "Nothing matched; here is a plain answer."
//! ```

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::ProviderError,
    provider::{ChunkStream, ModelProvider},
    types::{ApiMessage, ContentBlock, ModelInfo, StreamChunk, ToolFunction, UsageChunk},
};

// ─── YAML schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReplayConfig {
    pub responses: Vec<ResponseRule>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseRule {
    pub match_type: MatchType,
    #[serde(default)]
    pub pattern: String,
    /// Text reply, streamed as deltas.  May contain tool tags when the
    /// engine runs the text tool path.
    pub reply: Option<String>,
    /// Structured tool calls for the native path.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    Equals,
    StartsWith,
    Regex,
    Default,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallDef {
    pub id: String,
    pub tool: String,
    /// YAML map serialised to a JSON string for the call arguments.
    pub args: serde_json::Value,
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Size of each streamed text delta.  Small enough to exercise partial-block
/// handling, large enough to keep test logs readable.
const DELTA_BYTES: usize = 24;

pub struct ReplayProvider {
    config: ReplayConfig,
    context_window: usize,
    call_count: Mutex<u32>,
}

impl ReplayProvider {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay responses file: {}", path.display()))?;
        Self::load(&text)
    }

    pub fn load(yaml: &str) -> anyhow::Result<Self> {
        let config: ReplayConfig =
            serde_yaml::from_str(yaml).context("parsing replay responses YAML")?;
        Ok(Self {
            config,
            context_window: 200_000,
            call_count: Mutex::new(0),
        })
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    fn find_rule(&self, input: &str) -> Option<&ResponseRule> {
        let specific = self.config.responses.iter().find(|r| match r.match_type {
            MatchType::Contains => input.contains(&r.pattern),
            MatchType::Equals => input == r.pattern,
            MatchType::StartsWith => input.starts_with(&r.pattern),
            MatchType::Regex => regex::Regex::new(&r.pattern)
                .map(|re| re.is_match(input))
                .unwrap_or(false),
            MatchType::Default => false,
        });
        specific.or_else(|| {
            self.config
                .responses
                .iter()
                .find(|r| r.match_type == MatchType::Default)
        })
    }
}

/// The last user-authored text in the transcript, used as the match input.
fn last_user_text(transcript: &[ApiMessage]) -> String {
    transcript
        .iter()
        .rev()
        .find(|m| m.role == crate::Role::User)
        .map(|m| {
            m.content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[async_trait]
impl ModelProvider for ReplayProvider {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider_id: "replay".into(),
            model_id: "replay-model".into(),
        }
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn create_message(
        &self,
        _system_prompt: &str,
        transcript: &[ApiMessage],
        _tools: Option<&[ToolFunction]>,
    ) -> Result<ChunkStream, ProviderError> {
        {
            let mut n = self.call_count.lock().unwrap();
            *n += 1;
            debug!(call = *n, "replay provider request");
        }
        let input = last_user_text(transcript);
        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = Vec::new();
        match self.find_rule(&input) {
            Some(rule) => {
                for (i, def) in rule.tool_calls.iter().enumerate() {
                    chunks.push(Ok(StreamChunk::ToolCall {
                        index: i as u32,
                        call_id: def.id.clone(),
                        name: def.tool.clone(),
                        arguments: def.args.to_string(),
                    }));
                }
                if let Some(reply) = &rule.reply {
                    for delta in reply.as_bytes().chunks(DELTA_BYTES) {
                        chunks.push(Ok(StreamChunk::Text {
                            text: String::from_utf8_lossy(delta).into_owned(),
                        }));
                    }
                }
            }
            None => {
                return Err(ProviderError::other(format!(
                    "replay provider has no rule matching input: {input:?}"
                )))
            }
        }
        chunks.push(Ok(StreamChunk::Usage(UsageChunk {
            input_tokens: (input.len() / 4) as u32,
            output_tokens: 16,
            ..Default::default()
        })));
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    const YAML: &str = r#"
responses:
  - match_type: contains
    pattern: "ping"
    reply: "pong"
  - match_type: regex
    pattern: "^hi"
    reply: "hello there"
  - match_type: default
    reply: "fallback"
"#;

    async fn reply_text(p: &ReplayProvider, input: &str) -> String {
        let transcript = vec![ApiMessage::user_text(input)];
        let mut s = p.create_message("sys", &transcript, None).await.unwrap();
        let mut out = String::new();
        while let Some(Ok(c)) = s.next().await {
            if let StreamChunk::Text { text } = c {
                out.push_str(&text);
            }
        }
        out
    }

    #[tokio::test]
    async fn contains_rule_matches() {
        let p = ReplayProvider::load(YAML).unwrap();
        assert_eq!(reply_text(&p, "well, ping me").await, "pong");
    }

    #[tokio::test]
    async fn regex_rule_matches() {
        let p = ReplayProvider::load(YAML).unwrap();
        assert_eq!(reply_text(&p, "hi friend").await, "hello there");
    }

    #[tokio::test]
    async fn default_rule_is_the_fallback() {
        let p = ReplayProvider::load(YAML).unwrap();
        assert_eq!(reply_text(&p, "unmatched").await, "fallback");
    }

    #[tokio::test]
    async fn scripted_native_tool_call_is_emitted() {
        let yaml = r#"
responses:
  - match_type: contains
    pattern: "read"
    tool_calls:
      - id: tc-1
        tool: read_file
        args:
          path: src/main.rs
"#;
        let p = ReplayProvider::load(yaml).unwrap();
        let transcript = vec![ApiMessage::user_text("read the entrypoint")];
        let mut s = p.create_message("sys", &transcript, None).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        match first {
            StreamChunk::ToolCall { call_id, name, arguments, .. } => {
                assert_eq!(call_id, "tc-1");
                assert_eq!(name, "read_file");
                assert!(arguments.contains("src/main.rs"));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_rule_is_a_provider_error() {
        let p = ReplayProvider::load("responses: []").unwrap();
        let transcript = vec![ApiMessage::user_text("anything")];
        assert!(p.create_message("sys", &transcript, None).await.is_err());
    }
}
