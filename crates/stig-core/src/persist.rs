// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-task on-disk state.
//!
//! Each task owns a directory under the tasks root:
//!
//!   `<root>/<task-id>/messages.json`                  — display log
//!   `<root>/<task-id>/api_conversation_history.json`  — provider transcript
//!   `<root>/<task-id>/context_history.json`           — context-manager state
//!   `<root>/<task-id>/task.lock`                      — single-writer lock
//!   `<root>/<task-id>/focus_chain_taskid_<id>.md`     — optional todo list
//!
//! The lock is held for the task's lifetime; opening the same task twice
//! fails fast.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs4::fs_std::FileExt;
use tracing::warn;

use stig_model::{ApiMessage, ContentBlock, Role};

use crate::context::ContextState;
use crate::message::{ApiReqInfo, AskKind, DisplayEntry, SayKind};

pub const MESSAGES_FILE: &str = "messages.json";
pub const TRANSCRIPT_FILE: &str = "api_conversation_history.json";
pub const CONTEXT_FILE: &str = "context_history.json";
pub const LOCK_FILE: &str = "task.lock";

/// Handle to one task's directory, holding its exclusive lock.
#[derive(Debug)]
pub struct TaskStore {
    dir: PathBuf,
    task_id: String,
    // Held open for the lifetime of the store; dropping releases the lock.
    _lock: File,
}

impl TaskStore {
    /// Create (or reopen) the task directory and take the single-writer
    /// lock.  Fails fast when another process already holds it.
    pub fn open(root: &Path, task_id: &str) -> Result<Self> {
        let dir = root.join(task_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating task directory {}", dir.display()))?;
        let lock_path = dir.join(LOCK_FILE);
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating lock file {}", lock_path.display()))?;
        let locked = lock
            .try_lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;
        if !locked {
            bail!("task {task_id} is already open in another process");
        }
        Ok(Self {
            dir,
            task_id: task_id.to_string(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn focus_chain_path(&self) -> PathBuf {
        self.dir
            .join(format!("focus_chain_taskid_{}.md", self.task_id))
    }

    pub fn save_display(&self, entries: &[DisplayEntry]) -> Result<()> {
        write_json(&self.dir.join(MESSAGES_FILE), entries)
    }

    pub fn load_display(&self) -> Result<Vec<DisplayEntry>> {
        read_json_or_default(&self.dir.join(MESSAGES_FILE))
    }

    pub fn save_transcript(&self, transcript: &[ApiMessage]) -> Result<()> {
        write_json(&self.dir.join(TRANSCRIPT_FILE), transcript)
    }

    pub fn load_transcript(&self) -> Result<Vec<ApiMessage>> {
        read_json_or_default(&self.dir.join(TRANSCRIPT_FILE))
    }

    pub fn save_context(&self, state: &ContextState) -> Result<()> {
        write_json(&self.dir.join(CONTEXT_FILE), state)
    }

    pub fn load_context(&self) -> Result<ContextState> {
        read_json_or_default(&self.dir.join(CONTEXT_FILE))
    }
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string(value).context("serialising task state")?;
    // Write-then-rename so readers never observe a torn file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// List task ids under the tasks root, newest directory first.
pub fn list_tasks(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<(std::time::SystemTime, String)> = Vec::new();
    for entry in fs::read_dir(root).context("reading tasks root")? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        ids.push((modified, entry.file_name().to_string_lossy().to_string()));
    }
    ids.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(ids.into_iter().map(|(_, id)| id).collect())
}

// ─── Resume trimming ─────────────────────────────────────────────────────────

/// Drop the trailing entries that must not survive a reload: resume asks
/// from a previous open, and any request marker that never produced a chunk
/// (no cost tallied, no cancel reason recorded).
pub fn trim_for_resume(mut entries: Vec<DisplayEntry>) -> Vec<DisplayEntry> {
    loop {
        let before = entries.len();
        while entries
            .last()
            .map(|e| e.is_ask(AskKind::ResumeTask) || e.is_ask(AskKind::ResumeCompletedTask))
            .unwrap_or(false)
        {
            entries.pop();
        }
        if entries
            .last()
            .map(|e| {
                e.is_say(SayKind::ApiReqStarted)
                    && ApiReqInfo::from_entry(e)
                        .map(|i| i.never_produced_output())
                        .unwrap_or(true)
            })
            .unwrap_or(false)
        {
            entries.pop();
        }
        if entries.len() == before {
            return entries;
        }
    }
}

/// Repair the transcript tail after an interrupted run: a trailing assistant
/// message with tool-use blocks that never received results gets synthetic
/// interrupted results so providers accept the next request.
pub fn reconcile_transcript_tail(mut transcript: Vec<ApiMessage>) -> Vec<ApiMessage> {
    let needs_results: Vec<String> = match transcript.last() {
        Some(last) if last.role == Role::Assistant => last
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect(),
        _ => return transcript,
    };
    if needs_results.is_empty() {
        return transcript;
    }
    warn!(
        count = needs_results.len(),
        "synthesising interrupted tool results for transcript tail"
    );
    let results: Vec<ContentBlock> = needs_results
        .into_iter()
        .map(|id| {
            ContentBlock::tool_error(
                id,
                "The task was interrupted before this tool call could be completed.",
            )
        })
        .collect();
    transcript.push(ApiMessage::user(results));
    transcript
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
