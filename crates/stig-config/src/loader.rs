// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::schema::Config;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "STIG_CONFIG";

/// Resolve the config file path.
///
/// Priority: `$STIG_CONFIG` → `$XDG_CONFIG_HOME/stig/config.yaml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(shellexpand::tilde(&p).to_string());
    }
    dirs::config_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        })
        .join("stig")
        .join("config.yaml")
}

/// Load the configuration, falling back to defaults when no file exists.
///
/// A missing file is not an error — first runs should work out of the box.
/// A file that exists but fails to parse IS an error: silently ignoring a
/// typo would run the task with settings the user did not intend.
pub fn load() -> Result<Config> {
    load_from(&config_path())
}

/// Load configuration from an explicit path (used by `--config` and tests).
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
