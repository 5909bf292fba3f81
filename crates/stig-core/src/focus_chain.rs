// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The focus chain: an optional, user-editable markdown todo list.
//!
//! The model updates the list through the `task_progress` tool parameter;
//! the user may edit the file directly at any time.  External edits are
//! detected through a file watcher and folded back into the next turn.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tracing::{debug, warn};

use stig_config::FocusChainConfig;

#[derive(Debug)]
pub struct FocusChain {
    path: PathBuf,
    cfg: FocusChainConfig,
    turns_since_update: u32,
    external_edit: Arc<AtomicBool>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl FocusChain {
    pub fn new(path: PathBuf, cfg: FocusChainConfig) -> Self {
        Self {
            path,
            cfg,
            turns_since_update: 0,
            external_edit: Arc::new(AtomicBool::new(false)),
            _watcher: None,
        }
    }

    /// Start watching the list file for edits made outside the engine.
    /// Watch failures are logged, not fatal — the reminder interval still
    /// drives updates.
    pub fn watch(&mut self) {
        let flag = Arc::clone(&self.external_edit);
        let watched = self.path.clone();
        let mut watcher = match notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.paths.iter().any(|p| p == &watched) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!("focus chain watcher unavailable: {e}");
                return;
            }
        };
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("failed to watch focus chain directory: {e}");
            return;
        }
        self._watcher = Some(watcher);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a list update coming from the model's `task_progress`
    /// parameter.
    pub fn update_from_progress(&mut self, list_md: &str) -> Result<()> {
        std::fs::write(&self.path, list_md.trim_end().to_string() + "\n")
            .with_context(|| format!("writing focus chain file {}", self.path.display()))?;
        self.turns_since_update = 0;
        // The engine's own write also trips the watcher; swallow that edge.
        self.external_edit.store(false, Ordering::SeqCst);
        debug!(path = %self.path.display(), "focus chain updated");
        Ok(())
    }

    pub fn current_list(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }

    /// `(total, completed)` checklist items in the list.
    pub fn counts(list_md: &str) -> (usize, usize) {
        let mut total = 0;
        let mut completed = 0;
        for line in list_md.lines() {
            let item = line.trim_start();
            if item.starts_with("- [ ]") {
                total += 1;
            } else if item.starts_with("- [x]") || item.starts_with("- [X]") {
                total += 1;
                completed += 1;
            }
        }
        (total, completed)
    }

    /// Instructions to inject into this turn's user content, if any.
    ///
    /// Fires when the user edited the file externally, or when the model has
    /// gone `remind_interval_turns` turns without updating the list.
    pub fn instructions_for_turn(&mut self) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }
        self.turns_since_update += 1;
        let externally_edited = self.external_edit.swap(false, Ordering::SeqCst);
        let overdue = self.turns_since_update >= self.cfg.remind_interval_turns;
        if !externally_edited && !overdue {
            return None;
        }
        self.turns_since_update = 0;
        let mut text = String::from("<task_progress_instructions>\n");
        if externally_edited {
            text.push_str("The user manually edited the todo list. The current list is:\n\n");
        } else {
            text.push_str(
                "You have not updated the todo list in a while. Review it and include an \
                 updated task_progress parameter with your next tool call.\n\nCurrent list:\n\n",
            );
        }
        match self.current_list() {
            Some(list) if !list.trim().is_empty() => text.push_str(list.trim_end()),
            _ => text.push_str("(no list yet — create one)"),
        }
        text.push_str("\n</task_progress_instructions>");
        Some(text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
