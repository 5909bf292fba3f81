// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Content blocks ──────────────────────────────────────────────────────────

/// One typed block inside a transcript message.
///
/// Assistant messages serialise reasoning blocks first, then text, then
/// tool-use blocks — providers that verify reasoning traces require that
/// order on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload without the `data:` prefix.
        data: String,
    },
    Thinking {
        text: String,
        /// Provider-issued signature for verified reasoning traces.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    /// Approximate token count used for context budgeting (4 chars ≈ 1 token
    /// for text; a flat high estimate for images).
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::Text { text } | Self::Thinking { text, .. } => text.len(),
            Self::Image { .. } => 765 * 4,
            Self::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            Self::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Which provider/model produced (or will receive) a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider_id: String,
    pub model_id: String,
}

/// One entry in the provider-facing transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<UsageChunk>,
}

impl ApiMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
            model_info: None,
            metrics: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            model_info: None,
            metrics: None,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True when the message carries at least one `ToolUse` block.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn approx_tokens(&self) -> usize {
        self.content.iter().map(ContentBlock::approx_tokens).sum()
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// A tool definition offered to the model when native tool calling is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: serde_json::Value,
}

// ─── Stream chunks ───────────────────────────────────────────────────────────

/// Final (or incremental) usage statistics for one request.
///
/// When a stream emits several usage chunks, the last one wins for
/// `total_cost`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageChunk {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens written into the provider's prompt cache.
    pub cache_write_tokens: u32,
    /// Tokens served from the provider's prompt cache.
    pub cache_read_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl UsageChunk {
    /// Total tokens occupying the context window after this request.
    pub fn context_tokens(&self) -> usize {
        (self.input_tokens + self.output_tokens + self.cache_write_tokens + self.cache_read_tokens)
            as usize
    }
}

/// One streamed event from the provider.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Usage(UsageChunk),
    /// A reasoning/extended-thinking delta.
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    /// A text delta.
    Text { text: String },
    /// A structured tool-call fragment.  Providers interleave fragments for
    /// parallel calls by `index`; `call_id`/`name` may be empty on
    /// continuation fragments.
    ToolCall {
        index: u32,
        call_id: String,
        name: String,
        arguments: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_builds_single_text_block() {
        let m = ApiMessage::user_text("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert!(!m.has_tool_use());
    }

    #[test]
    fn has_tool_use_detects_tool_blocks() {
        let m = ApiMessage::assistant(vec![
            ContentBlock::text("using a tool"),
            ContentBlock::ToolUse {
                id: "tc-1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "a.rs"}),
            },
        ]);
        assert!(m.has_tool_use());
    }

    #[test]
    fn approx_tokens_divides_text_by_four() {
        let b = ContentBlock::text("12345678");
        assert_eq!(b.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(ContentBlock::text("").approx_tokens(), 1);
    }

    #[test]
    fn content_block_serialises_with_type_tag() {
        let b = ContentBlock::tool_result("tc-1", "done");
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"tool_result\""));
        assert!(json.contains("\"tool_use_id\":\"tc-1\""));
    }

    #[test]
    fn api_message_round_trips() {
        let m = ApiMessage::assistant(vec![
            ContentBlock::Thinking {
                text: "hm".into(),
                signature: None,
            },
            ContentBlock::text("answer"),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: ApiMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_result_is_error_defaults_false_on_deserialize() {
        let json = r#"{"type":"tool_result","tool_use_id":"x","content":"ok"}"#;
        let b: ContentBlock = serde_json::from_str(json).unwrap();
        assert!(matches!(b, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn usage_context_tokens_sums_all_counters() {
        let u = UsageChunk {
            input_tokens: 10,
            output_tokens: 5,
            cache_write_tokens: 3,
            cache_read_tokens: 2,
            total_cost: None,
        };
        assert_eq!(u.context_tokens(), 20);
    }
}
