// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Turns the provider's chunk stream into the ordered assistant block list.
//!
//! Two mutually exclusive paths, selected at request build time:
//!
//! - **Text path**: deltas accumulate in a rolling buffer that is re-parsed
//!   after every chunk by [`crate::parser::parse_assistant_message`].
//! - **Native path**: structured tool-call fragments accumulate per call
//!   index and materialise as `ToolUse` blocks directly, bypassing the tag
//!   parser.
//!
//! The decoder never reorders earlier blocks when later chunks arrive.

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::warn;

use stig_model::UsageChunk;
use stig_tools::kind::{ParamName, ToolKind, ToolUseBlock};

use crate::parser::{parse_assistant_message, AssistantBlock, TextBlock};

#[derive(Debug)]
struct NativeCall {
    index: u32,
    id: String,
    name: String,
    args_buf: String,
    done: bool,
}

#[derive(Debug)]
pub struct StreamDecoder {
    native: bool,
    raw_text: String,
    native_calls: Vec<NativeCall>,
    reasoning: String,
    reasoning_signature: Option<String>,
    usage: Option<UsageChunk>,
}

impl StreamDecoder {
    pub fn new(native: bool) -> Self {
        Self {
            native,
            raw_text: String::new(),
            native_calls: Vec::new(),
            reasoning: String::new(),
            reasoning_signature: None,
            usage: None,
        }
    }

    /// The full raw assistant text received so far (tool tags included on
    /// the text path).
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn reasoning_signature(&self) -> Option<&str> {
        self.reasoning_signature.as_deref()
    }

    pub fn usage(&self) -> Option<UsageChunk> {
        self.usage
    }

    /// Accumulate a reasoning delta.
    pub fn feed_reasoning(&mut self, delta: &str, signature: Option<String>) {
        self.reasoning.push_str(delta);
        if signature.is_some() {
            self.reasoning_signature = signature;
        }
    }

    /// Record usage; when several usage chunks arrive the last one wins.
    pub fn set_usage(&mut self, usage: UsageChunk) {
        self.usage = Some(usage);
    }

    /// Accumulate a text delta and rebuild the block list.
    pub fn feed_text(&mut self, delta: &str) -> Vec<AssistantBlock> {
        self.raw_text.push_str(delta);
        self.rebuild(false)
    }

    /// Accumulate a native tool-call fragment and rebuild the block list.
    ///
    /// Fragments for different parallel calls interleave by `index`; a call
    /// is considered finished once a fragment for a different index arrives
    /// (or at finalize).
    pub fn feed_tool_call(
        &mut self,
        index: u32,
        call_id: &str,
        name: &str,
        arguments: &str,
    ) -> Vec<AssistantBlock> {
        if let Some(last) = self.native_calls.last_mut() {
            if last.index != index {
                last.done = true;
            }
        }
        match self.native_calls.iter_mut().find(|c| c.index == index) {
            Some(call) => {
                if !call_id.is_empty() {
                    call.id = call_id.to_string();
                }
                if !name.is_empty() {
                    call.name = name.to_string();
                }
                call.args_buf.push_str(arguments);
            }
            None => self.native_calls.push(NativeCall {
                index,
                id: call_id.to_string(),
                name: name.to_string(),
                args_buf: arguments.to_string(),
                done: false,
            }),
        }
        self.rebuild(false)
    }

    /// Flush all lingering partial blocks to complete.  Called once, after
    /// the provider stream terminates.
    pub fn finalize(&mut self) -> Vec<AssistantBlock> {
        for call in &mut self.native_calls {
            call.done = true;
        }
        self.rebuild(true)
    }

    fn rebuild(&self, finalized: bool) -> Vec<AssistantBlock> {
        if !self.native {
            let mut blocks = parse_assistant_message(&self.raw_text);
            if finalized {
                for b in &mut blocks {
                    b.set_complete();
                }
            }
            return blocks;
        }

        let mut blocks = Vec::new();
        let trimmed = self.raw_text.trim();
        if !trimmed.is_empty() {
            blocks.push(AssistantBlock::Text(TextBlock {
                content: trimmed.to_string(),
                partial: !finalized,
            }));
        }
        for call in &self.native_calls {
            let complete = call.done;
            if complete && call.name.is_empty() {
                // An undispatchable call; storing it would corrupt the
                // conversation history sent back on the next turn.
                warn!(call_id = %call.id, "dropping tool call with empty name from model");
                continue;
            }
            let Ok(kind) = ToolKind::from_str(&call.name) else {
                if complete {
                    warn!(tool = %call.name, "dropping unknown tool call from model");
                }
                continue;
            };
            let params = if complete {
                parse_native_args(kind, &call.id, &call.args_buf)
            } else {
                BTreeMap::new()
            };
            blocks.push(AssistantBlock::ToolUse(ToolUseBlock {
                name: kind,
                params,
                id: Some(call.id.clone()),
                partial: !complete,
            }));
        }
        blocks
    }
}

/// Decode a completed native argument buffer into the parameter map.
fn parse_native_args(kind: ToolKind, call_id: &str, buf: &str) -> BTreeMap<ParamName, String> {
    let value: serde_json::Value = if buf.trim().is_empty() {
        warn!(tool = %kind, call_id, "model sent tool call with empty arguments; substituting {{}}");
        serde_json::Value::Object(Default::default())
    } else {
        match serde_json::from_str(buf) {
            Ok(v) => v,
            Err(parse_err) => match attempt_json_repair(buf) {
                Ok(v) => {
                    warn!(tool = %kind, call_id, "repaired invalid JSON arguments from model");
                    v
                }
                Err(_) => {
                    warn!(
                        tool = %kind,
                        call_id,
                        error = %parse_err,
                        "model sent tool call with invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            },
        }
    };

    let mut params = BTreeMap::new();
    if let serde_json::Value::Object(map) = value {
        for (key, val) in map {
            let Ok(name) = ParamName::from_str(&key) else {
                warn!(tool = %kind, param = %key, "dropping unknown tool parameter");
                continue;
            };
            let text = match val {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            params.insert(name, text);
        }
    }
    params
}

/// Attempt to repair common JSON syntax errors in model-emitted arguments:
/// invalid escape sequences inside string values, and strings or objects
/// truncated at the end of the stream.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk through a JSON string and replace any invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`,
/// `u`.  Anything else (e.g. `\c`, `\(`) becomes `\\X` so the result parses.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
