// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;
mod exec;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use exec::HostExecutor;
use stig_core::{
    list_tasks, AskResponse, EngineEvent, EntryKind, NoopCheckpoints, SayKind, StaticEnvironment,
    Task, TaskHandle, TaskOptions, TaskOutcome,
};
use stig_model::{ModelProvider, ReplayProvider};

/// Exit codes: 0 clean, 1 failure, 124 command timeout, 130 cancelled.
const EXIT_FAILURE: i32 = 1;
const EXIT_COMMAND_TIMEOUT: i32 = 124;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("stig: {e:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_logging();

    let mut config = match &cli.config {
        Some(path) => stig_config::load_from(path)?,
        None => stig_config::load()?,
    };
    if cli.yolo {
        config.engine.yolo_mode = true;
        config.auto_approval.enabled = true;
    }
    if let Some(dir) = &cli.tasks_dir {
        config.storage.tasks_dir = Some(dir.to_string_lossy().into_owned());
    }

    if cli.list {
        let root = config.storage.resolved_tasks_dir();
        for id in list_tasks(&root)? {
            println!("{id}");
        }
        return Ok(0);
    }

    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let provider: Arc<dyn ModelProvider> = match &cli.replay {
        Some(path) => Arc::new(ReplayProvider::from_file(path)?),
        None => anyhow::bail!(
            "no model provider configured; pass --replay <responses.yaml> \
             (or set STIG_REPLAY_RESPONSES)"
        ),
    };

    let cfg = Arc::new(config);
    let opts = TaskOptions {
        cfg: cfg.clone(),
        provider,
        executor: Arc::new(HostExecutor),
        checkpoints: Some(Arc::new(NoopCheckpoints)),
        environment: Arc::new(StaticEnvironment {
            snapshot: workspace_snapshot(&workspace),
        }),
        workspace_root: workspace,
        system_prompt: None,
        task_id: cli.resume.clone(),
        persist: !cli.no_persist,
    };
    let (mut task, handle, events) = Task::new(opts)?;

    // Ctrl-C cancels the task; the driver unwinds at the next suspension
    // point and records the interruption.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.cancel();
            }
        });
    }

    let auto = cli.auto_approve || cli.yolo;
    let ui = tokio::spawn(render_events(events, handle.clone(), auto));

    let outcome = if cli.resume.is_some() {
        task.resume().await?
    } else {
        let text = cli
            .task
            .clone()
            .context("a task is required (or use --resume / --list)")?;
        task.run(&text, Vec::new()).await?
    };

    drop(task);
    let _ = ui.await;

    Ok(match outcome {
        TaskOutcome::Completed => 0,
        TaskOutcome::CommandTimedOut => EXIT_COMMAND_TIMEOUT,
        TaskOutcome::Cancelled => EXIT_CANCELLED,
        TaskOutcome::Failed(msg) => {
            eprintln!("stig: task failed: {msg}");
            EXIT_FAILURE
        }
    })
}

/// Tracing goes to stderr so stdout stays clean for the rendered task
/// output (pipeable into other tools).
fn init_logging() {
    let filter = EnvFilter::try_from_env("STIG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("stig=info,stig_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A best-effort environment snapshot for headless runs: workspace listing
/// on the first turn, current time, nothing editor-specific.
fn workspace_snapshot(root: &PathBuf) -> stig_core::EnvironmentSnapshot {
    let mut listing = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten().take(200) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                listing.push(format!("{name}/"));
            } else {
                listing.push(name);
            }
        }
    }
    listing.sort();
    stig_core::EnvironmentSnapshot {
        workspace_root: root.clone(),
        now: chrono::Local::now().fixed_offset(),
        file_listing: Some(listing.join("\n")),
        ..Default::default()
    }
}

/// Render engine events to stdout and answer asks from stdin (or
/// automatically when `auto` is set).
async fn render_events(
    mut events: mpsc::Receiver<EngineEvent>,
    handle: Arc<TaskHandle>,
    auto: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Message(entry) => {
                // Partial chunks redraw in place in a richer UI; the
                // headless renderer prints only completed entries.
                if entry.partial || entry.kind != EntryKind::Say {
                    continue;
                }
                let Some(text) = &entry.text else { continue };
                match entry.say {
                    Some(SayKind::Text) => println!("{text}"),
                    Some(SayKind::Reasoning) => eprintln!("[thinking] {text}"),
                    Some(SayKind::Tool) => println!("[tool] {text}"),
                    Some(SayKind::Error) => eprintln!("[error] {text}"),
                    Some(SayKind::CompletionResult) => println!("\n{text}"),
                    Some(SayKind::UserFeedback) => println!("[you] {text}"),
                    _ => {}
                }
            }
            EngineEvent::AskPending { kind, text, .. } => {
                if auto {
                    handle.respond(AskResponse::approved());
                    continue;
                }
                if let Some(text) = &text {
                    eprintln!("[{kind:?}] {text}");
                }
                eprintln!("approve? [y]es / [n]o / free-form feedback:");
                match stdin.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        let response = match line.as_str() {
                            "" | "y" | "yes" => AskResponse::approved(),
                            "n" | "no" => AskResponse::rejected(),
                            _ => AskResponse::message(line),
                        };
                        handle.respond(response);
                    }
                    _ => handle.respond(AskResponse::rejected()),
                }
            }
            EngineEvent::TaskCompleted { .. } => {}
            EngineEvent::Aborted { .. } => eprintln!("[cancelled]"),
            _ => {}
        }
    }
}
