// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly turned
/// off need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub auto_approval: AutoApprovalConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub focus_chain: FocusChainConfig,
}

fn default_max_mistakes() -> u32 {
    3
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2_000
}
fn default_first_chunk_timeout_ms() -> u64 {
    30_000
}
fn default_ask_poll_interval_ms() -> u64 {
    100
}

/// Knobs for the task driver loop itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Turns with no tool use before the engine asks the user whether to
    /// continue.  In yolo mode the same ceiling fails the task instead.
    #[serde(default = "default_max_mistakes")]
    pub max_consecutive_mistakes: u32,
    /// Fully autonomous mode: never raise interactive asks; the mistake
    /// ceiling terminates the task with an error say.
    #[serde(default)]
    pub yolo_mode: bool,
    /// Allow more than one tool call to execute within a single model turn.
    /// When the model family forces parallel calling, that wins over this
    /// setting.
    #[serde(default)]
    pub parallel_tool_calls: bool,
    /// Use the provider's structured tool-call protocol instead of parsing
    /// tool tags out of the text stream.  The two paths are mutually
    /// exclusive within a turn; this selects the path at request build time.
    #[serde(default)]
    pub native_tool_calling: bool,
    /// Automatic retries for a transient first-chunk failure.
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Base backoff delay; doubles per attempt (2 s, 4 s, 8 s with the
    /// default).  Configurable so tests can run in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_first_chunk_timeout_ms")]
    pub first_chunk_timeout_ms: u64,
    /// Per-invocation command timeout.  `None` means unbounded (the
    /// production default); the test profile sets 30 000.
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    /// Fallback tick for the ask rendezvous and readiness waits.  The
    /// notify primitives wake immediately; this bounds the worst case.
    #[serde(default = "default_ask_poll_interval_ms")]
    pub ask_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_mistakes: default_max_mistakes(),
            yolo_mode: false,
            parallel_tool_calls: false,
            native_tool_calling: false,
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            first_chunk_timeout_ms: default_first_chunk_timeout_ms(),
            command_timeout_ms: None,
            ask_poll_interval_ms: default_ask_poll_interval_ms(),
        }
    }
}

fn default_compact_threshold() -> f32 {
    0.75
}
fn default_guard_band_tokens() -> usize {
    27_000
}
fn default_min_active_messages() -> usize {
    3
}

/// Context-window management knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Summarise older history automatically instead of hard-truncating.
    #[serde(default = "default_true")]
    pub auto_condense: bool,
    /// Fraction of the usable window at which compaction triggers.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold_fraction: f32,
    /// Reserved headroom subtracted from the raw context window before the
    /// threshold is applied, so compaction fires before the hard ceiling.
    #[serde(default = "default_guard_band_tokens")]
    pub guard_band_tokens: usize,
    /// Refuse to compact when fewer active messages than this would remain;
    /// the state is surfaced to the user for manual intervention instead.
    #[serde(default = "default_min_active_messages")]
    pub min_active_messages: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_condense: true,
            compact_threshold_fraction: default_compact_threshold(),
            guard_band_tokens: default_guard_band_tokens(),
            min_active_messages: default_min_active_messages(),
        }
    }
}

fn default_max_auto_requests() -> u32 {
    20
}

/// Which tool classes may run without an interactive approval, and how many
/// consecutive auto-approved requests are allowed before the engine checks in
/// with the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprovalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Ceiling for consecutive auto-approved requests; reaching it raises an
    /// ask and, on approval, resets the counter.
    #[serde(default = "default_max_auto_requests")]
    pub max_requests: u32,
    #[serde(default = "default_true")]
    pub read_files: bool,
    #[serde(default)]
    pub edit_files: bool,
    #[serde(default)]
    pub execute_safe_commands: bool,
    #[serde(default)]
    pub use_browser: bool,
    #[serde(default)]
    pub use_mcp: bool,
}

impl Default for AutoApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_max_auto_requests(),
            read_files: true,
            edit_files: false,
            execute_safe_commands: false,
            use_browser: false,
            use_mcp: false,
        }
    }
}

fn default_checkpoint_init_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cap on how long the first-turn checkpoint initialisation may take
    /// before checkpoints are disabled for the task.
    #[serde(default = "default_checkpoint_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_timeout_ms: default_checkpoint_init_timeout_ms(),
        }
    }
}

/// Where per-task state (message log, transcript, lock file) lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for task directories.  Defaults to
    /// `$XDG_DATA_HOME/stig/tasks` when unset.  Supports `~` expansion.
    #[serde(default)]
    pub tasks_dir: Option<String>,
}

impl StorageConfig {
    /// Resolve the tasks root, applying shell expansion and the XDG default.
    pub fn resolved_tasks_dir(&self) -> PathBuf {
        match &self.tasks_dir {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).to_string()),
            None => dirs::data_dir()
                .unwrap_or_else(|| {
                    dirs::home_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join(".local")
                        .join("share")
                })
                .join("stig")
                .join("tasks"),
        }
    }
}

fn default_remind_interval_turns() -> u32 {
    6
}

/// The optional user-editable todo list the engine watches and feeds back
/// into each turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusChainConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Remind the model to update the list after this many turns without an
    /// update.
    #[serde(default = "default_remind_interval_turns")]
    pub remind_interval_turns: u32,
}

impl Default for FocusChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remind_interval_turns: default_remind_interval_turns(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_interactive_mistake_ceiling() {
        let c = Config::default();
        assert_eq!(c.engine.max_consecutive_mistakes, 3);
        assert!(!c.engine.yolo_mode);
    }

    #[test]
    fn default_backoff_is_two_seconds_doubling() {
        let c = EngineConfig::default();
        assert_eq!(c.retry_base_delay_ms, 2_000);
        assert_eq!(c.max_retry_attempts, 3);
    }

    #[test]
    fn default_context_threshold_is_three_quarters() {
        let c = ContextConfig::default();
        assert!((c.compact_threshold_fraction - 0.75).abs() < f32::EPSILON);
        assert!(c.auto_condense);
    }

    #[test]
    fn empty_yaml_parses_to_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.auto_approval.max_requests, 20);
        assert!(c.checkpoints.enabled);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let yaml = "engine:\n  yolo_mode: true\n  retry_base_delay_ms: 10\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.engine.yolo_mode);
        assert_eq!(c.engine.retry_base_delay_ms, 10);
        // Untouched fields keep their defaults.
        assert_eq!(c.engine.max_consecutive_mistakes, 3);
    }

    #[test]
    fn auto_approval_defaults_allow_only_reads() {
        let a = AutoApprovalConfig::default();
        assert!(a.read_files);
        assert!(!a.edit_files);
        assert!(!a.execute_safe_commands);
    }

    #[test]
    fn storage_dir_tilde_expands() {
        let s = StorageConfig {
            tasks_dir: Some("~/stig-tasks".into()),
        };
        let p = s.resolved_tasks_dir();
        assert!(!p.to_string_lossy().contains('~'));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            back.engine.max_retry_attempts,
            c.engine.max_retry_attempts
        );
        assert_eq!(back.context.guard_band_tokens, c.context.guard_band_tokens);
    }
}
