// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use regex::Regex;
use stig_config::AutoApprovalConfig;

use crate::kind::{ParamName, ToolKind, ToolUseBlock};

/// Commands considered safe enough for the `execute_safe_commands` flag.
/// Anything that is not a pure read falls through to an interactive ask.
const SAFE_COMMAND_PATTERNS: &[&str] = &[
    "ls*", "cat *", "head *", "tail *", "grep *", "find *", "pwd", "echo *", "wc *", "which *",
    "git status*", "git log*", "git diff*", "git show*", "git branch", "du *", "df *", "file *",
    "stat *",
];

/// Decides whether a tool call runs without an interactive approval.
///
/// The controller is pure over the settings it was built from; counting the
/// consecutive auto-approved requests belongs to the task driver, which owns
/// the per-task counters.
#[derive(Debug)]
pub struct AutoApprovalController {
    settings: AutoApprovalConfig,
    safe_commands: Vec<Regex>,
}

impl AutoApprovalController {
    pub fn new(settings: AutoApprovalConfig) -> Self {
        let safe_commands = SAFE_COMMAND_PATTERNS
            .iter()
            .filter_map(|p| glob_to_regex(p))
            .collect();
        Self {
            settings,
            safe_commands,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn max_requests(&self) -> u32 {
        self.settings.max_requests
    }

    /// True when `block` may execute without asking the user.
    pub fn should_auto_approve(&self, block: &ToolUseBlock) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match block.name {
            ToolKind::ReadFile | ToolKind::SearchFiles | ToolKind::ListFiles => {
                self.settings.read_files
            }
            ToolKind::WriteToFile | ToolKind::ReplaceInFile => self.settings.edit_files,
            ToolKind::ExecuteCommand => {
                self.settings.execute_safe_commands
                    && block
                        .param(ParamName::Command)
                        .map(|cmd| self.is_safe_command(cmd))
                        .unwrap_or(false)
            }
            ToolKind::BrowserAction | ToolKind::WebFetch => self.settings.use_browser,
            ToolKind::UseMcpTool | ToolKind::AccessMcpResource => self.settings.use_mcp,
            // Asks, completion and context ops are engine-internal; they
            // never require a tool approval of their own.
            ToolKind::AskFollowupQuestion
            | ToolKind::AttemptCompletion
            | ToolKind::NewTask
            | ToolKind::SummarizeTask => true,
        }
    }

    fn is_safe_command(&self, command: &str) -> bool {
        let trimmed = command.trim();
        // Command substitution can smuggle arbitrary commands into an
        // otherwise-safe invocation; never auto-approve it.
        if trimmed.contains("$(") || trimmed.contains('`') {
            return false;
        }
        // Chained or piped commands are only safe when every segment is.
        if trimmed.contains('&') || trimmed.contains('|') || trimmed.contains(';') {
            return split_chained(trimmed).iter().all(|c| self.is_safe_command(c));
        }
        self.safe_commands.iter().any(|re| re.is_match(trimmed))
    }
}

fn split_chained(command: &str) -> Vec<&str> {
    command
        .split(&['&', '|', ';'][..])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
