// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end runs of the assembled stack: replay provider, real task
//! store on disk, and the full driver loop.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use stig_config::Config;
use stig_core::{
    AskResponse, EngineEvent, NoopCheckpoints, StaticEnvironment, Task, TaskHandle, TaskOptions,
    TaskOutcome, TaskStore,
};
use stig_model::{ModelProvider, ReplayProvider, Role};
use stig_tools::StaticExecutor;

const REPLAY_RULES: &str = r#"
responses:
  - match_type: contains
    pattern: "<task>"
    reply: |
      Taking a look at the workspace first.
      <list_files>
      <path>.</path>
      </list_files>
  - match_type: contains
    pattern: "[list_files] Result:"
    reply: |
      <attempt_completion>
      <result>The workspace has been inspected.</result>
      </attempt_completion>
  - match_type: default
    reply: "I am not sure how to proceed."
"#;

fn fast_config(tasks_dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.engine.retry_base_delay_ms = 1;
    cfg.engine.ask_poll_interval_ms = 5;
    cfg.checkpoints.enabled = false;
    cfg.auto_approval.enabled = true;
    cfg.storage.tasks_dir = Some(tasks_dir.to_string_lossy().into_owned());
    cfg
}

fn approve_all(
    mut rx: mpsc::Receiver<EngineEvent>,
    handle: Arc<TaskHandle>,
) -> tokio::task::JoinHandle<Vec<EngineEvent>> {
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            if matches!(ev, EngineEvent::AskPending { .. }) {
                handle.respond(AskResponse::approved());
            }
            events.push(ev);
        }
        events
    })
}

#[tokio::test]
async fn replayed_task_runs_to_completion_and_persists() {
    let root = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("lib.rs"), "fn x() {}").unwrap();

    let provider: Arc<dyn ModelProvider> = Arc::new(ReplayProvider::load(REPLAY_RULES).unwrap());
    let opts = TaskOptions {
        cfg: Arc::new(fast_config(root.path())),
        provider,
        executor: Arc::new(StaticExecutor::new()),
        checkpoints: Some(Arc::new(NoopCheckpoints)),
        environment: Arc::new(StaticEnvironment::default()),
        workspace_root: workspace.path().to_path_buf(),
        system_prompt: None,
        task_id: Some("e2e-1".into()),
        persist: true,
    };
    let (mut task, handle, rx) = Task::new(opts).unwrap();
    let responder = approve_all(rx, handle);

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        task.run("inspect the workspace", Vec::new()),
    )
    .await
    .expect("task wedged")
    .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    // Two full model turns: tool round, then completion.
    assert!(task.transcript().len() >= 4);
    let entries = task.log_entries().to_vec();
    drop(task);
    responder.await.unwrap();

    // Persist-then-reload yields the same sequences.
    let store = TaskStore::open(root.path(), "e2e-1").unwrap();
    let reloaded = store.load_display().unwrap();
    assert_eq!(reloaded, entries);
    let transcript = store.load_transcript().unwrap();
    assert_eq!(
        transcript.iter().filter(|m| m.role == Role::User).count(),
        2
    );
    assert!(transcript
        .iter()
        .any(|m| m.text().contains("[list_files] Result:")));
}

#[tokio::test]
async fn replay_provider_without_a_matching_rule_fails_cleanly() {
    let provider: Arc<dyn ModelProvider> =
        Arc::new(ReplayProvider::load("responses: []").unwrap());
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.engine.retry_base_delay_ms = 1;
    cfg.engine.ask_poll_interval_ms = 5;
    cfg.checkpoints.enabled = false;
    let opts = TaskOptions {
        cfg: Arc::new(cfg),
        provider,
        executor: Arc::new(StaticExecutor::new()),
        checkpoints: None,
        environment: Arc::new(StaticEnvironment::default()),
        workspace_root: workspace.path().to_path_buf(),
        system_prompt: None,
        task_id: None,
        persist: false,
    };
    let (mut task, handle, mut rx) = Task::new(opts).unwrap();
    // Reject the api_req_failed ask so the task ends instead of retrying.
    let handle2 = handle.clone();
    let ui = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if matches!(ev, EngineEvent::AskPending { .. }) {
                handle2.respond(AskResponse::rejected());
            }
        }
    });

    let outcome = tokio::time::timeout(Duration::from_secs(20), task.run("hello", Vec::new()))
        .await
        .expect("task wedged")
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Failed(_)));

    drop(task);
    let _ = ui.await;
}
