// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Builds the textual environment preamble attached to each user turn.
//!
//! The builder is pure over a snapshot of its inputs; anything slow or
//! racy (letting a busy terminal settle, enumerating a large workspace)
//! happens in the [`EnvironmentProvider`] that produces the snapshot, where
//! it can be time-boxed without blocking the engine.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use stig_tools::IgnoreController;

/// State of one integrated terminal at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct TerminalSnapshot {
    pub id: u32,
    pub busy: bool,
    pub last_command: String,
    pub unread_output: String,
}

/// Everything the builder needs, gathered in advance.
#[derive(Debug, Clone)]
pub struct EnvironmentSnapshot {
    pub workspace_root: PathBuf,
    pub visible_files: Vec<PathBuf>,
    pub open_tabs: Vec<PathBuf>,
    pub terminals: Vec<TerminalSnapshot>,
    pub recently_modified: Vec<PathBuf>,
    pub now: DateTime<FixedOffset>,
    /// Pre-rendered workspace listing; only attached on the first turn.
    pub file_listing: Option<String>,
    /// Git remotes; only attached on the first turn.
    pub git_remotes: Vec<String>,
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            visible_files: Vec::new(),
            open_tabs: Vec::new(),
            terminals: Vec::new(),
            recently_modified: Vec::new(),
            now: DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00").unwrap(),
            file_listing: None,
            git_remotes: Vec::new(),
        }
    }
}

/// Gathers an [`EnvironmentSnapshot`].  Implementations may block briefly
/// (e.g. up to ~15 s waiting for a busy terminal's output to settle) but
/// must give up gracefully rather than wedge the turn.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn snapshot(&self, include_file_details: bool) -> EnvironmentSnapshot;
}

/// A fixed snapshot, for tests and headless runs.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    pub snapshot: EnvironmentSnapshot,
}

#[async_trait]
impl EnvironmentProvider for StaticEnvironment {
    async fn snapshot(&self, include_file_details: bool) -> EnvironmentSnapshot {
        let mut snap = self.snapshot.clone();
        if !include_file_details {
            snap.file_listing = None;
            snap.git_remotes = Vec::new();
        }
        snap
    }
}

/// Render the environment details block for one turn.
pub fn build_environment_details(
    snap: &EnvironmentSnapshot,
    ignore: &IgnoreController,
    include_file_details: bool,
    context_tokens: usize,
    context_window: usize,
) -> String {
    let mut out = String::from("<environment_details>\n");

    out.push_str("# Visible Files\n");
    push_path_list(&mut out, &ignore.filter_paths(&snap.visible_files));

    out.push_str("\n# Open Tabs\n");
    push_path_list(&mut out, &ignore.filter_paths(&snap.open_tabs));

    let busy: Vec<&TerminalSnapshot> = snap.terminals.iter().filter(|t| t.busy).collect();
    let idle: Vec<&TerminalSnapshot> = snap
        .terminals
        .iter()
        .filter(|t| !t.busy && !t.unread_output.is_empty())
        .collect();
    if !busy.is_empty() {
        out.push_str("\n# Actively Running Terminals\n");
        for t in busy {
            out.push_str(&format!("## Terminal {} (command: `{}`)\n", t.id, t.last_command));
            if !t.unread_output.is_empty() {
                out.push_str(&format!("### New Output\n{}\n", t.unread_output.trim_end()));
            }
        }
    }
    if !idle.is_empty() {
        out.push_str("\n# Inactive Terminals With Completed Process Output\n");
        for t in idle {
            out.push_str(&format!(
                "## Terminal {} (command: `{}`)\n### New Output\n{}\n",
                t.id,
                t.last_command,
                t.unread_output.trim_end()
            ));
        }
    }

    if !snap.recently_modified.is_empty() {
        out.push_str("\n# Recently Modified Files\n");
        push_path_list(&mut out, &ignore.filter_paths(&snap.recently_modified));
    }

    out.push_str(&format!(
        "\n# Current Time\n{}\n",
        snap.now.format("%Y-%m-%d %H:%M:%S %:z")
    ));

    if include_file_details {
        out.push_str(&format!(
            "\n# Current Working Directory ({}) Files\n",
            snap.workspace_root.display()
        ));
        match &snap.file_listing {
            Some(listing) if !listing.is_empty() => {
                out.push_str(listing.trim_end());
                out.push('\n');
            }
            _ => out.push_str("(empty or not enumerated)\n"),
        }
        if !snap.git_remotes.is_empty() {
            out.push_str("\n# Git Remote URLs\n");
            for remote in &snap.git_remotes {
                out.push_str(remote);
                out.push('\n');
            }
        }
    }

    let percent = if context_window == 0 {
        0.0
    } else {
        (context_tokens as f64 / context_window as f64) * 100.0
    };
    out.push_str(&format!(
        "\n# Context Window Usage\n{} / {} tokens used ({:.0}%)\n",
        context_tokens, context_window, percent
    ));

    out.push_str("</environment_details>");
    out
}

fn push_path_list(out: &mut String, paths: &[PathBuf]) {
    if paths.is_empty() {
        out.push_str("(No files)\n");
        return;
    }
    for p in paths {
        out.push_str(&p.to_string_lossy());
        out.push('\n');
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            workspace_root: PathBuf::from("/work/repo"),
            visible_files: vec![PathBuf::from("src/main.rs")],
            open_tabs: vec![PathBuf::from("src/main.rs"), PathBuf::from("Cargo.toml")],
            terminals: vec![
                TerminalSnapshot {
                    id: 1,
                    busy: true,
                    last_command: "cargo watch".into(),
                    unread_output: "Compiling stig".into(),
                },
                TerminalSnapshot {
                    id: 2,
                    busy: false,
                    last_command: "ls".into(),
                    unread_output: "Cargo.toml\nsrc".into(),
                },
            ],
            recently_modified: vec![PathBuf::from("src/lib.rs")],
            file_listing: Some("Cargo.toml\nsrc/main.rs".into()),
            git_remotes: vec!["origin: git@example.com:w/repo.git".into()],
            ..Default::default()
        }
    }

    #[test]
    fn sections_appear_in_order() {
        let details =
            build_environment_details(&snapshot(), &IgnoreController::default(), true, 100, 1000);
        let visible = details.find("# Visible Files").unwrap();
        let tabs = details.find("# Open Tabs").unwrap();
        let time = details.find("# Current Time").unwrap();
        let usage = details.find("# Context Window Usage").unwrap();
        assert!(visible < tabs && tabs < time && time < usage);
        assert!(details.starts_with("<environment_details>"));
        assert!(details.ends_with("</environment_details>"));
    }

    #[test]
    fn busy_and_idle_terminals_are_separated() {
        let details =
            build_environment_details(&snapshot(), &IgnoreController::default(), false, 0, 1000);
        assert!(details.contains("# Actively Running Terminals"));
        assert!(details.contains("cargo watch"));
        assert!(details.contains("# Inactive Terminals With Completed Process Output"));
    }

    #[test]
    fn first_turn_includes_listing_and_remotes() {
        let details =
            build_environment_details(&snapshot(), &IgnoreController::default(), true, 0, 1000);
        assert!(details.contains("# Current Working Directory (/work/repo) Files"));
        assert!(details.contains("# Git Remote URLs"));
    }

    #[test]
    fn later_turns_omit_listing() {
        let details =
            build_environment_details(&snapshot(), &IgnoreController::default(), false, 0, 1000);
        assert!(!details.contains("# Current Working Directory"));
        assert!(!details.contains("# Git Remote URLs"));
    }

    #[test]
    fn ignored_paths_are_filtered_from_every_list() {
        let ignore = IgnoreController::from_patterns(["src/main.rs"]);
        let details = build_environment_details(&snapshot(), &ignore, false, 0, 1000);
        assert!(!details.contains("src/main.rs"));
        assert!(details.contains("Cargo.toml"));
    }

    #[test]
    fn context_usage_shows_percentage() {
        let details = build_environment_details(
            &EnvironmentSnapshot::default(),
            &IgnoreController::default(),
            false,
            500,
            1000,
        );
        assert!(details.contains("500 / 1000 tokens used (50%)"));
    }

    #[test]
    fn empty_lists_render_placeholder() {
        let details = build_environment_details(
            &EnvironmentSnapshot::default(),
            &IgnoreController::default(),
            false,
            0,
            0,
        );
        assert!(details.contains("(No files)"));
    }
}
