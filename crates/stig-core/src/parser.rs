// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incremental parser for the assistant's text stream.
//!
//! The raw buffer grows as deltas arrive and is re-parsed after every chunk.
//! The parse is deterministic and stable over prefixes: for any buffer `b`
//! that is a prefix of `b'`, every non-final block of `parse(b)` equals the
//! corresponding block of `parse(b')`.  Earlier blocks never change when
//! more bytes arrive — only the trailing partial block may still move.

use std::collections::BTreeMap;

use stig_tools::kind::{ALL_TOOLS, ParamName, ToolKind, ToolUseBlock};

/// A run of prose between tool invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub content: String,
    pub partial: bool,
}

/// One parsed unit of assistant output.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
}

impl AssistantBlock {
    pub fn partial(&self) -> bool {
        match self {
            Self::Text(t) => t.partial,
            Self::ToolUse(t) => t.partial,
        }
    }

    pub fn set_complete(&mut self) {
        match self {
            Self::Text(t) => t.partial = false,
            Self::ToolUse(t) => t.partial = false,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            Self::ToolUse(t) => Some(t),
            _ => None,
        }
    }
}

/// Parse the accumulated assistant text into an ordered block list.
///
/// Tool tags are recognised from the legal tag table only; a stray `<` in
/// prose stays prose.  A buffer ending mid-tag yields a trailing partial
/// block.  The final block is always partial — the decoder flips it to
/// complete when the stream ends.
pub fn parse_assistant_message(buf: &str) -> Vec<AssistantBlock> {
    let mut blocks = Vec::new();
    let mut text_start = 0usize;
    let mut i = 0usize;

    while i < buf.len() {
        if buf.as_bytes()[i] == b'<' {
            if let Some(kind) = match_tool_open(&buf[i..]) {
                push_text(&mut blocks, &buf[text_start..i], false);
                let body_start = i + kind.as_str().len() + 2;
                let (params, consumed, closed) = parse_tool_body(kind, &buf[body_start..]);
                blocks.push(AssistantBlock::ToolUse(ToolUseBlock {
                    name: kind,
                    params,
                    id: None,
                    partial: !closed,
                }));
                if !closed {
                    // The open tool consumed the rest of the buffer.
                    return blocks;
                }
                i = body_start + consumed;
                text_start = i;
                continue;
            }
        }
        i += char_width(buf, i);
    }

    push_text(&mut blocks, &buf[text_start..], true);
    blocks
}

fn push_text(blocks: &mut Vec<AssistantBlock>, raw: &str, partial: bool) {
    let content = raw.trim();
    if !content.is_empty() {
        blocks.push(AssistantBlock::Text(TextBlock {
            content: content.to_string(),
            partial,
        }));
    }
}

fn char_width(s: &str, i: usize) -> usize {
    s[i..].chars().next().map(char::len_utf8).unwrap_or(1)
}

/// `s` starts with `<`.  Returns the tool whose full open tag `<name>` is at
/// the head of `s`.
fn match_tool_open(s: &str) -> Option<ToolKind> {
    let rest = &s[1..];
    ALL_TOOLS
        .iter()
        .copied()
        .find(|k| rest.starts_with(k.as_str()) && rest.as_bytes().get(k.as_str().len()) == Some(&b'>'))
}

/// `s` starts with `<`.  Returns the parameter of `kind` whose full open tag
/// is at the head of `s`.
fn match_param_open(kind: ToolKind, s: &str) -> Option<ParamName> {
    let rest = &s[1..];
    kind.params()
        .iter()
        .copied()
        .find(|p| rest.starts_with(p.as_str()) && rest.as_bytes().get(p.as_str().len()) == Some(&b'>'))
}

/// Parse a tool body, returning the collected parameters, the bytes
/// consumed, and whether the closing tag was reached.
fn parse_tool_body(
    kind: ToolKind,
    body: &str,
) -> (BTreeMap<ParamName, String>, usize, bool) {
    let close_tag = format!("</{}>", kind.as_str());
    let mut params = BTreeMap::new();
    let mut j = 0usize;

    while j < body.len() {
        let rest = &body[j..];
        if rest.starts_with(&close_tag) {
            return (params, j + close_tag.len(), true);
        }
        if rest.as_bytes()[0] == b'<' {
            if let Some(p) = match_param_open(kind, rest) {
                let val_start = j + p.as_str().len() + 2;
                let search_in = &body[val_start..];
                match find_param_close(p, search_in, &close_tag) {
                    Some(idx) => {
                        params.insert(p, search_in[..idx].trim().to_string());
                        j = val_start + idx + p.as_str().len() + 3;
                        continue;
                    }
                    None => {
                        // In-flight parameter: the value runs to the end of
                        // the buffer until its closing tag arrives.
                        params.insert(p, search_in.trim_start().to_string());
                        return (params, body.len(), false);
                    }
                }
            }
        }
        j += char_width(body, j);
    }
    (params, body.len(), false)
}

/// Locate the closing tag of a parameter value.
///
/// File content and diff payloads may legitimately contain tag-like text, so
/// for those the LAST closing tag before the tool's own closing tag wins;
/// every other parameter closes at the first occurrence.
fn find_param_close(p: ParamName, s: &str, tool_close: &str) -> Option<usize> {
    let close = format!("</{}>", p.as_str());
    match p {
        ParamName::Content | ParamName::Diff => {
            let limit = s.find(tool_close).unwrap_or(s.len());
            s[..limit].rfind(&close)
        }
        _ => s.find(&close),
    }
}

// ─── Display cleaning ────────────────────────────────────────────────────────

/// Prepare a text block for the UI.
///
/// Thinking tag markers are dropped.  While the block is still partial, a
/// trailing fragment that could grow into a legal tag — or an incomplete
/// code-fence marker — is elided so the UI does not flicker when the rest of
/// the tag arrives.  A trailing `<` followed by non-tag characters stays
/// visible as ordinary prose.
pub fn clean_text_for_display(text: &str, partial: bool) -> String {
    let mut out = text.replace("<thinking>", "").replace("</thinking>", "");
    if partial {
        out = elide_trailing_tag_fragment(out);
        out = elide_trailing_fence_fragment(out);
    }
    out.trim().to_string()
}

fn legal_tag_names() -> impl Iterator<Item = String> {
    let tools = ALL_TOOLS.iter().map(|k| k.as_str().to_string());
    let params = stig_tools::kind::ALL_PARAMS.iter().map(|p| p.as_str().to_string());
    let thinking = std::iter::once("thinking".to_string());
    tools
        .chain(params)
        .chain(thinking)
        .flat_map(|n| [n.clone(), format!("/{n}")])
}

fn elide_trailing_tag_fragment(text: String) -> String {
    let Some(pos) = text.rfind('<') else {
        return text;
    };
    if text[pos..].contains('>') {
        return text;
    }
    let frag = &text[pos + 1..];
    let could_be_tag = legal_tag_names().any(|name| name.starts_with(frag));
    if could_be_tag {
        text[..pos].to_string()
    } else {
        text
    }
}

fn elide_trailing_fence_fragment(text: String) -> String {
    let last_line_start = text.rfind('\n').map(|p| p + 1).unwrap_or(0);
    let last_line = &text[last_line_start..];
    let is_fence_fragment = {
        let backticks = last_line.chars().take_while(|&c| c == '`').count();
        backticks >= 1
            && backticks <= 3
            && last_line[backticks..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if is_fence_fragment {
        text[..last_line_start].to_string()
    } else {
        text
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
