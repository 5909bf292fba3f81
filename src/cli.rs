// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

/// Headless agentic task engine.
///
/// Runs one coding task to completion: streams the model's reply, executes
/// the tools it requests, and loops until the model presents a result or
/// the run is cancelled (Ctrl-C).
#[derive(Debug, Parser)]
#[command(name = "stig", version, about)]
pub struct Cli {
    /// The task to work on.  Omit when using --resume or --list.
    pub task: Option<String>,

    /// Resume a persisted task by id (see --list).
    #[arg(long, value_name = "TASK_ID", conflicts_with = "task")]
    pub resume: Option<String>,

    /// List persisted tasks and exit.
    #[arg(long)]
    pub list: bool,

    /// Config file path (default: ~/.config/stig/config.yaml or $STIG_CONFIG).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Workspace root the tools operate on (default: current directory).
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// YAML replay-responses file driving the model provider.
    ///
    /// The engine core is provider-agnostic; the bundled provider replays
    /// canned responses, which is what CI runs and demos use.
    #[arg(long, value_name = "FILE", env = "STIG_REPLAY_RESPONSES")]
    pub replay: Option<PathBuf>,

    /// Approve every ask automatically instead of prompting on stdin.
    #[arg(long)]
    pub auto_approve: bool,

    /// Fully autonomous mode: never prompt; fail instead of asking.
    #[arg(long)]
    pub yolo: bool,

    /// Do not persist task state to disk.
    #[arg(long)]
    pub no_persist: bool,

    /// Override the tasks storage directory.
    #[arg(long, value_name = "DIR")]
    pub tasks_dir: Option<PathBuf>,
}
