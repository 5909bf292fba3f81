// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The tool vocabulary the engine understands.
///
/// The wire names double as the XML tag names recognised by the streaming
/// parser, so `as_str` / `FromStr` must stay in exact agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ExecuteCommand,
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    SearchFiles,
    ListFiles,
    BrowserAction,
    UseMcpTool,
    AccessMcpResource,
    AskFollowupQuestion,
    AttemptCompletion,
    NewTask,
    SummarizeTask,
    WebFetch,
}

/// All tool kinds, in tag-table order.
pub const ALL_TOOLS: &[ToolKind] = &[
    ToolKind::ExecuteCommand,
    ToolKind::ReadFile,
    ToolKind::WriteToFile,
    ToolKind::ReplaceInFile,
    ToolKind::SearchFiles,
    ToolKind::ListFiles,
    ToolKind::BrowserAction,
    ToolKind::UseMcpTool,
    ToolKind::AccessMcpResource,
    ToolKind::AskFollowupQuestion,
    ToolKind::AttemptCompletion,
    ToolKind::NewTask,
    ToolKind::SummarizeTask,
    ToolKind::WebFetch,
];

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteCommand => "execute_command",
            Self::ReadFile => "read_file",
            Self::WriteToFile => "write_to_file",
            Self::ReplaceInFile => "replace_in_file",
            Self::SearchFiles => "search_files",
            Self::ListFiles => "list_files",
            Self::BrowserAction => "browser_action",
            Self::UseMcpTool => "use_mcp_tool",
            Self::AccessMcpResource => "access_mcp_resource",
            Self::AskFollowupQuestion => "ask_followup_question",
            Self::AttemptCompletion => "attempt_completion",
            Self::NewTask => "new_task",
            Self::SummarizeTask => "summarize_task",
            Self::WebFetch => "web_fetch",
        }
    }

    /// Parameters this tool accepts.  The parser rejects tags outside this
    /// set so a stray `<path>` inside prose never opens a parameter.
    pub fn params(&self) -> &'static [ParamName] {
        use ParamName::*;
        match self {
            Self::ExecuteCommand => &[Command, RequiresApproval, Timeout, TaskProgress],
            Self::ReadFile => &[Path, TaskProgress],
            Self::WriteToFile => &[Path, Content, TaskProgress],
            Self::ReplaceInFile => &[Path, Diff, TaskProgress],
            Self::SearchFiles => &[Path, Regex, FilePattern, TaskProgress],
            Self::ListFiles => &[Path, Recursive, TaskProgress],
            Self::BrowserAction => &[Action, Url, Coordinate, Text],
            Self::UseMcpTool => &[ServerName, ToolName, Arguments, TaskProgress],
            Self::AccessMcpResource => &[ServerName, Uri],
            Self::AskFollowupQuestion => &[Question, Options],
            Self::AttemptCompletion => &[Result, Command, TaskProgress],
            Self::NewTask => &[Context],
            Self::SummarizeTask => &[Context],
            Self::WebFetch => &[Url],
        }
    }

    /// Read-only tools may run before the initial checkpoint commit lands;
    /// everything else must wait for it.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::ReadFile
                | Self::SearchFiles
                | Self::ListFiles
                | Self::AskFollowupQuestion
                | Self::AttemptCompletion
                | Self::SummarizeTask
                | Self::WebFetch
                | Self::AccessMcpResource
        )
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_TOOLS
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or(())
    }
}

/// Parameter tag names used inside a tool tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    Command,
    RequiresApproval,
    Timeout,
    Path,
    Content,
    Diff,
    Regex,
    FilePattern,
    Recursive,
    Action,
    Url,
    Coordinate,
    Text,
    ServerName,
    ToolName,
    Arguments,
    Uri,
    Question,
    Options,
    Result,
    Context,
    TaskProgress,
}

pub const ALL_PARAMS: &[ParamName] = &[
    ParamName::Command,
    ParamName::RequiresApproval,
    ParamName::Timeout,
    ParamName::Path,
    ParamName::Content,
    ParamName::Diff,
    ParamName::Regex,
    ParamName::FilePattern,
    ParamName::Recursive,
    ParamName::Action,
    ParamName::Url,
    ParamName::Coordinate,
    ParamName::Text,
    ParamName::ServerName,
    ParamName::ToolName,
    ParamName::Arguments,
    ParamName::Uri,
    ParamName::Question,
    ParamName::Options,
    ParamName::Result,
    ParamName::Context,
    ParamName::TaskProgress,
];

impl ParamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::RequiresApproval => "requires_approval",
            Self::Timeout => "timeout",
            Self::Path => "path",
            Self::Content => "content",
            Self::Diff => "diff",
            Self::Regex => "regex",
            Self::FilePattern => "file_pattern",
            Self::Recursive => "recursive",
            Self::Action => "action",
            Self::Url => "url",
            Self::Coordinate => "coordinate",
            Self::Text => "text",
            Self::ServerName => "server_name",
            Self::ToolName => "tool_name",
            Self::Arguments => "arguments",
            Self::Uri => "uri",
            Self::Question => "question",
            Self::Options => "options",
            Self::Result => "result",
            Self::Context => "context",
            Self::TaskProgress => "task_progress",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_PARAMS
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or(())
    }
}

/// A parsed tool invocation from the assistant stream.
///
/// `partial` is true while the closing tag (or the final argument fragment,
/// on the native path) has not arrived yet.  Once false, the block is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub name: ToolKind,
    pub params: BTreeMap<ParamName, String>,
    /// Provider call id on the native path; `None` for parsed tool tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub partial: bool,
}

impl ToolUseBlock {
    pub fn param(&self, name: ParamName) -> Option<&str> {
        self.params.get(&name).map(String::as_str)
    }

    /// The structured input object sent back in the transcript for native
    /// tool calling; for parsed tags this is the params map as an object.
    pub fn input_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Structured tool definitions for providers that take native tool
/// schemas.  Every parameter is a string on the wire, mirroring the tag
/// parser's view of the same vocabulary.
pub fn tool_functions() -> Vec<stig_model::ToolFunction> {
    ALL_TOOLS
        .iter()
        .map(|kind| {
            let properties: serde_json::Map<String, serde_json::Value> = kind
                .params()
                .iter()
                .map(|p| {
                    (
                        p.as_str().to_string(),
                        serde_json::json!({ "type": "string" }),
                    )
                })
                .collect();
            stig_model::ToolFunction {
                name: kind.as_str().to_string(),
                description: tool_description(*kind).to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                }),
            }
        })
        .collect()
}

fn tool_description(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::ExecuteCommand => "Run a shell command in the workspace.",
        ToolKind::ReadFile => "Read the contents of a file.",
        ToolKind::WriteToFile => "Create or overwrite a file with the given content.",
        ToolKind::ReplaceInFile => "Apply a targeted search/replace edit to a file.",
        ToolKind::SearchFiles => "Search files with a regular expression.",
        ToolKind::ListFiles => "List files and directories.",
        ToolKind::BrowserAction => "Drive the browser session.",
        ToolKind::UseMcpTool => "Invoke a tool exposed by a connected MCP server.",
        ToolKind::AccessMcpResource => "Read a resource exposed by a connected MCP server.",
        ToolKind::AskFollowupQuestion => "Ask the user a clarifying question.",
        ToolKind::AttemptCompletion => "Present the finished result of the task.",
        ToolKind::NewTask => "Propose starting a new task with carried-over context.",
        ToolKind::SummarizeTask => "Summarize the conversation to free context space.",
        ToolKind::WebFetch => "Fetch a web page and return its content.",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_functions_cover_the_vocabulary() {
        let fns = tool_functions();
        assert_eq!(fns.len(), ALL_TOOLS.len());
        let read = fns.iter().find(|f| f.name == "read_file").unwrap();
        assert!(read.parameters["properties"]["path"].is_object());
        assert!(!read.description.is_empty());
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in ALL_TOOLS {
            assert_eq!(ToolKind::from_str(kind.as_str()), Ok(*kind));
        }
        for p in ALL_PARAMS {
            assert_eq!(ParamName::from_str(p.as_str()), Ok(*p));
        }
    }

    #[test]
    fn unknown_tag_does_not_parse() {
        assert!(ToolKind::from_str("rm_rf").is_err());
        assert!(ParamName::from_str("payload").is_err());
    }

    #[test]
    fn read_only_classification() {
        assert!(ToolKind::ReadFile.is_read_only());
        assert!(ToolKind::SearchFiles.is_read_only());
        assert!(!ToolKind::WriteToFile.is_read_only());
        assert!(!ToolKind::ExecuteCommand.is_read_only());
        assert!(!ToolKind::BrowserAction.is_read_only());
    }

    #[test]
    fn every_tool_lists_its_own_params() {
        // Each tool's param list must be non-empty and contain no duplicates.
        for kind in ALL_TOOLS {
            let params = kind.params();
            assert!(!params.is_empty(), "{kind} has no params");
            let mut sorted = params.to_vec();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), params.len(), "{kind} has duplicate params");
        }
    }

    #[test]
    fn tool_use_block_input_json_is_an_object() {
        let mut params = BTreeMap::new();
        params.insert(ParamName::Path, "src/lib.rs".to_string());
        let block = ToolUseBlock {
            name: ToolKind::ReadFile,
            params,
            id: None,
            partial: false,
        };
        let v = block.input_json();
        assert_eq!(v["path"], "src/lib.rs");
    }

    #[test]
    fn serde_uses_snake_case_wire_names() {
        let json = serde_json::to_string(&ToolKind::ReplaceInFile).unwrap();
        assert_eq!(json, "\"replace_in_file\"");
        let back: ToolKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ToolKind::ReplaceInFile);
    }
}
