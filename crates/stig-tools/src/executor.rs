// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::kind::{ToolKind, ToolUseBlock};

/// Ambient inputs a tool implementation may need.  Passed by reference per
/// call so the executor itself stays stateless and externally synchronised
/// (the presenter guarantees a single call in flight).
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    /// Per-invocation command timeout; `None` means unbounded.
    pub command_timeout_ms: Option<u64>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            command_timeout_ms: None,
        }
    }
}

/// The result of one tool execution.
///
/// Exactly one outcome per dispatched block; approval and rejection happen
/// before the executor is reached, so a denied call never produces one.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    /// Base64 data URLs for tools that return screenshots or images.
    pub images: Vec<String>,
    pub is_error: bool,
    /// Set when a command hit its timeout; the CLI maps this to exit 124.
    pub timed_out: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn timeout(partial_output: impl Into<String>) -> Self {
        Self {
            content: partial_output.into(),
            is_error: true,
            timed_out: true,
            ..Default::default()
        }
    }
}

/// The engine's interface to tool implementations.
///
/// Implementations run file edits, commands, browser actions and MCP calls.
/// They must terminate (honouring `cx.command_timeout_ms`) and must never
/// panic across this boundary — failures are reported through
/// [`ToolOutcome::err`] so the error text can be fed back to the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome;
}

/// Table-driven executor for tests: returns a canned outcome per tool kind
/// and records every dispatched block so tests can assert ordering.
#[derive(Default)]
pub struct StaticExecutor {
    outcomes: HashMap<ToolKind, ToolOutcome>,
    pub executed: Mutex<Vec<ToolUseBlock>>,
}

impl StaticExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, kind: ToolKind, outcome: ToolOutcome) -> Self {
        self.outcomes.insert(kind, outcome);
        self
    }

    pub fn executed_kinds(&self) -> Vec<ToolKind> {
        self.executed.lock().unwrap().iter().map(|b| b.name).collect()
    }
}

#[async_trait]
impl ToolExecutor for StaticExecutor {
    async fn execute(&self, block: &ToolUseBlock, _cx: &ToolContext) -> ToolOutcome {
        self.executed.lock().unwrap().push(block.clone());
        self.outcomes
            .get(&block.name)
            .cloned()
            .unwrap_or_else(|| ToolOutcome::ok(format!("{} completed", block.name)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn block(kind: ToolKind) -> ToolUseBlock {
        ToolUseBlock {
            name: kind,
            params: BTreeMap::new(),
            id: None,
            partial: false,
        }
    }

    #[tokio::test]
    async fn static_executor_returns_canned_outcome() {
        let ex = StaticExecutor::new()
            .with_outcome(ToolKind::ReadFile, ToolOutcome::ok("file contents"));
        let out = ex.execute(&block(ToolKind::ReadFile), &ToolContext::default()).await;
        assert_eq!(out.content, "file contents");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn static_executor_default_outcome_names_the_tool() {
        let ex = StaticExecutor::new();
        let out = ex.execute(&block(ToolKind::ListFiles), &ToolContext::default()).await;
        assert!(out.content.contains("list_files"));
    }

    #[tokio::test]
    async fn execution_order_is_recorded() {
        let ex = StaticExecutor::new();
        let cx = ToolContext::default();
        ex.execute(&block(ToolKind::ReadFile), &cx).await;
        ex.execute(&block(ToolKind::WriteToFile), &cx).await;
        assert_eq!(
            ex.executed_kinds(),
            vec![ToolKind::ReadFile, ToolKind::WriteToFile]
        );
    }

    #[test]
    fn timeout_outcome_is_an_error() {
        let out = ToolOutcome::timeout("partial");
        assert!(out.is_error);
        assert!(out.timed_out);
    }
}
