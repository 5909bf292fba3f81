// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The reference tool executor for the headless CLI.
//!
//! Covers the filesystem and shell tools; the richer surfaces (browser,
//! MCP) belong to embedding hosts and report as unsupported here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use stig_tools::{ParamName, ToolContext, ToolExecutor, ToolKind, ToolOutcome, ToolUseBlock};

pub struct HostExecutor;

#[async_trait]
impl ToolExecutor for HostExecutor {
    async fn execute(&self, block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome {
        debug!(tool = %block.name, "host executor dispatch");
        match block.name {
            ToolKind::ExecuteCommand => run_command(block, cx).await,
            ToolKind::ReadFile => read_file(block, cx),
            ToolKind::WriteToFile => write_file(block, cx),
            ToolKind::ListFiles => list_files(block, cx),
            other => ToolOutcome::err(format!(
                "The {other} tool is not supported by the headless executor."
            )),
        }
    }
}

fn resolve(cx: &ToolContext, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cx.workspace_root.join(p)
    }
}

fn missing_param(name: ParamName) -> ToolOutcome {
    ToolOutcome::err(format!("Missing required parameter: {name}"))
}

async fn run_command(block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome {
    let Some(command) = block.param(ParamName::Command) else {
        return missing_param(ParamName::Command);
    };
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&cx.workspace_root)
        .kill_on_drop(true);

    let run = cmd.output();
    let output = match cx.command_timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
            Ok(result) => result,
            Err(_) => {
                return ToolOutcome::timeout(format!(
                    "Command timed out after {ms} ms: {command}"
                ))
            }
        },
        None => run.await,
    };
    match output {
        Ok(out) => {
            let mut text = String::new();
            text.push_str(&String::from_utf8_lossy(&out.stdout));
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            let code = out.status.code().unwrap_or(-1);
            if out.status.success() {
                ToolOutcome::ok(text)
            } else {
                ToolOutcome::err(format!("Command exited with code {code}.\n{text}"))
            }
        }
        Err(e) => ToolOutcome::err(format!("Failed to run command: {e}")),
    }
}

fn read_file(block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome {
    let Some(path) = block.param(ParamName::Path) else {
        return missing_param(ParamName::Path);
    };
    match std::fs::read_to_string(resolve(cx, path)) {
        Ok(content) => ToolOutcome::ok(content),
        Err(e) => ToolOutcome::err(format!("Failed to read {path}: {e}")),
    }
}

fn write_file(block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome {
    let Some(path) = block.param(ParamName::Path) else {
        return missing_param(ParamName::Path);
    };
    let Some(content) = block.param(ParamName::Content) else {
        return missing_param(ParamName::Content);
    };
    let target = resolve(cx, path);
    if let Some(parent) = target.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return ToolOutcome::err(format!("Failed to create parent directories: {e}"));
        }
    }
    match std::fs::write(&target, content) {
        Ok(()) => ToolOutcome::ok(format!("Wrote {} bytes to {path}", content.len())),
        Err(e) => ToolOutcome::err(format!("Failed to write {path}: {e}")),
    }
}

fn list_files(block: &ToolUseBlock, cx: &ToolContext) -> ToolOutcome {
    let Some(path) = block.param(ParamName::Path) else {
        return missing_param(ParamName::Path);
    };
    let recursive = block.param(ParamName::Recursive) == Some("true");
    let root = resolve(cx, path);
    let mut names = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) => return ToolOutcome::err(format!("Failed to list {path}: {e}")),
        };
        for entry in entries.flatten() {
            let p = entry.path();
            let display = p
                .strip_prefix(&root)
                .unwrap_or(&p)
                .to_string_lossy()
                .into_owned();
            if p.is_dir() {
                names.push(format!("{display}/"));
                if recursive && !display.starts_with('.') {
                    stack.push(p);
                }
            } else {
                names.push(display);
            }
        }
    }
    names.sort();
    ToolOutcome::ok(names.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn block(kind: ToolKind, params: &[(ParamName, &str)]) -> ToolUseBlock {
        ToolUseBlock {
            name: kind,
            params: params
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            id: None,
            partial: false,
        }
    }

    fn cx(root: &Path) -> ToolContext {
        ToolContext {
            workspace_root: root.to_path_buf(),
            command_timeout_ms: Some(5_000),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cx = cx(dir.path());
        let out = HostExecutor
            .execute(
                &block(
                    ToolKind::WriteToFile,
                    &[(ParamName::Path, "notes.txt"), (ParamName::Content, "hello")],
                ),
                &cx,
            )
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = HostExecutor
            .execute(&block(ToolKind::ReadFile, &[(ParamName::Path, "notes.txt")]), &cx)
            .await;
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn command_runs_in_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = HostExecutor
            .execute(
                &block(ToolKind::ExecuteCommand, &[(ParamName::Command, "ls")]),
                &cx(dir.path()),
            )
            .await;
        assert!(out.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn command_timeout_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cx(dir.path());
        c.command_timeout_ms = Some(50);
        let out = HostExecutor
            .execute(
                &block(ToolKind::ExecuteCommand, &[(ParamName::Command, "sleep 5")]),
                &c,
            )
            .await;
        assert!(out.timed_out);
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = HostExecutor
            .execute(
                &block(ToolKind::ExecuteCommand, &[(ParamName::Command, "exit 3")]),
                &cx(dir.path()),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("code 3"));
    }

    #[tokio::test]
    async fn unsupported_tool_reports_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = HostExecutor
            .execute(&block(ToolKind::BrowserAction, &[]), &cx(dir.path()))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not supported"));
    }

    #[tokio::test]
    async fn list_files_walks_recursively_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.txt"), "x").unwrap();
        let out = HostExecutor
            .execute(
                &block(
                    ToolKind::ListFiles,
                    &[(ParamName::Path, "."), (ParamName::Recursive, "true")],
                ),
                &cx(dir.path()),
            )
            .await;
        assert!(out.content.contains("sub/"));
        assert!(out.content.contains("inner.txt"));
    }
}
