// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::approval::glob_to_regex;

/// Name of the per-workspace ignore file.
pub const IGNORE_FILE: &str = ".stigignore";

/// Filters workspace paths that tools and environment details must not see.
///
/// Patterns are one glob per line, matched against workspace-relative paths;
/// `#` starts a comment.  A pattern ending in `/` matches the directory and
/// everything beneath it.
#[derive(Debug, Default)]
pub struct IgnoreController {
    patterns: Vec<Regex>,
}

impl IgnoreController {
    /// Load the ignore file from `root`.  A missing file yields a controller
    /// that allows everything.
    pub fn load(root: &Path) -> Self {
        let path = root.join(IGNORE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let c = Self::from_patterns(text.lines());
                debug!(path = %path.display(), rules = c.patterns.len(), "loaded ignore file");
                c
            }
            Err(_) => Self::default(),
        }
    }

    pub fn from_patterns<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let patterns = lines
            .into_iter()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| {
                // `dir/` means the directory and its whole subtree.
                if let Some(dir) = l.strip_suffix('/') {
                    glob_to_regex(&format!("{dir}/*")).or_else(|| glob_to_regex(dir))
                } else {
                    glob_to_regex(l)
                }
            })
            .collect();
        Self { patterns }
    }

    /// True when the tool may touch `path` (workspace-relative).
    pub fn is_allowed(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches("./");
        !self.patterns.iter().any(|re| {
            re.is_match(normalized)
                // A directory pattern also blocks the bare directory path.
                || re.is_match(&format!("{normalized}/"))
        })
    }

    /// Drop disallowed paths, preserving order.
    pub fn filter_paths(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths
            .iter()
            .filter(|p| self.is_allowed(&p.to_string_lossy()))
            .cloned()
            .collect()
    }

    /// Structured denial text fed back to the model on a violation.
    pub fn denial_message(path: &str) -> String {
        format!(
            "Access to {path} is blocked by the {IGNORE_FILE} file settings. \
             You must try to continue in the task without using this file, \
             or ask the user to update the {IGNORE_FILE} file."
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_controller_allows_everything() {
        let c = IgnoreController::default();
        assert!(c.is_allowed("src/main.rs"));
        assert!(c.is_allowed(".env"));
    }

    #[test]
    fn exact_pattern_blocks_the_file() {
        let c = IgnoreController::from_patterns([".env"]);
        assert!(!c.is_allowed(".env"));
        assert!(c.is_allowed("src/.envrc"));
    }

    #[test]
    fn glob_pattern_blocks_matches() {
        let c = IgnoreController::from_patterns(["*.pem", "secrets/*"]);
        assert!(!c.is_allowed("server.pem"));
        assert!(!c.is_allowed("secrets/api_key.txt"));
        assert!(c.is_allowed("src/server.rs"));
    }

    #[test]
    fn directory_pattern_blocks_subtree() {
        let c = IgnoreController::from_patterns(["node_modules/"]);
        assert!(!c.is_allowed("node_modules/pkg/index.js"));
        assert!(c.is_allowed("src/modules.rs"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let c = IgnoreController::from_patterns(["# comment", "", "*.log"]);
        assert!(!c.is_allowed("debug.log"));
        assert!(c.is_allowed("# comment"));
    }

    #[test]
    fn leading_dot_slash_is_normalized() {
        let c = IgnoreController::from_patterns([".env"]);
        assert!(!c.is_allowed("./.env"));
    }

    #[test]
    fn filter_paths_preserves_order() {
        let c = IgnoreController::from_patterns(["*.key"]);
        let paths = vec![
            PathBuf::from("a.rs"),
            PathBuf::from("b.key"),
            PathBuf::from("c.rs"),
        ];
        let kept = c.filter_paths(&paths);
        assert_eq!(kept, vec![PathBuf::from("a.rs"), PathBuf::from("c.rs")]);
    }

    #[test]
    fn load_missing_file_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let c = IgnoreController::load(dir.path());
        assert!(c.is_allowed("anything"));
    }

    #[test]
    fn load_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.secret\n").unwrap();
        let c = IgnoreController::load(dir.path());
        assert!(!c.is_allowed("deploy.secret"));
    }
}
