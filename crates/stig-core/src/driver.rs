// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The task driver: owns all task state and runs the outer loop that
//! assembles user content, issues the provider request, decodes and presents
//! the response, and feeds tool results back into the next turn.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stig_config::Config;
use stig_model::{
    ApiMessage, ChunkStream, ContentBlock, ModelProvider, ProviderError, ProviderErrorKind,
    StreamChunk, UsageChunk,
};
use stig_tools::{
    kind::tool_functions, AutoApprovalController, IgnoreController, ToolContext, ToolExecutor,
    ToolUseBlock,
};

use crate::checkpoint::{CheckpointManager, RestoreMode};
use crate::context::{ContextManager, TruncationStrategy};
use crate::decoder::StreamDecoder;
use crate::environment::{build_environment_details, EnvironmentProvider};
use crate::error::TaskAbort;
use crate::events::EngineEvent;
use crate::focus_chain::FocusChain;
use crate::log::{EntryMeta, MessageLog};
use crate::message::{
    ApiReqInfo, AskKind, AskOutcome, AskResponseKind, CancelReason, SayKind,
};
use crate::persist::{reconcile_transcript_tail, trim_for_resume, TaskStore};
use crate::state::{TaskHandle, TaskState};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable software engineering agent. Work on the \
    user's task step by step, using the available tools to read and modify the workspace. Use \
    exactly one tool per message unless told otherwise, wait for its result before continuing, \
    and finish with the attempt_completion tool once the task is done.";

const NO_TOOLS_USED_FEEDBACK: &str = "[ERROR] You did not use a tool in your previous response. \
    Every reply must either use a tool to make progress or use the attempt_completion tool to \
    present the finished result. Retry with a tool use.";

const MISTAKE_GUIDANCE: &str = "The model keeps replying without using any tool. You can provide \
    guidance to get it back on track, or end the task here.";

const SUMMARIZE_DIRECTIVE: &str = "The conversation is approaching the context window limit. Use \
    the summarize_task tool now: produce a detailed summary of everything done so far, every \
    decision made, and what remains, so the task can continue from the summary alone.";

const BRICKED_CONTEXT_TEXT: &str = "The conversation no longer fits the model's context window \
    and too few messages remain to truncate further. Edit an earlier message or start a new task \
    carrying over the relevant context.";

const EMPTY_RESPONSE_TEXT: &str = "Unexpected API response: the language model did not provide \
    any assistant messages. This may indicate an issue with the API or the model's output.";

/// How the task ended, as seen by the embedding process.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    /// A tool command hit its timeout; the CLI maps this to exit 124.
    CommandTimedOut,
    Failed(String),
}

/// One driver turn's verdict.
#[derive(Debug)]
pub(crate) enum TurnResult {
    Continue(Vec<ContentBlock>),
    Completed,
    Aborted,
    Failed(String),
}

enum RequestResult {
    Stream(ChunkStream),
    Fatal(String),
}

/// What one provider stream produced, after finalization.
#[derive(Debug, Default)]
struct StreamedTurn {
    text: String,
    reasoning: String,
    reasoning_signature: Option<String>,
    tool_blocks: Vec<ToolUseBlock>,
    usage: Option<UsageChunk>,
    interruption: Option<Interruption>,
}

#[derive(Debug, Clone, PartialEq)]
enum Interruption {
    UserCancelled,
    StreamError(String),
}

impl StreamedTurn {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_blocks.is_empty()
    }
}

/// Everything a task needs at construction.
pub struct TaskOptions {
    pub cfg: Arc<Config>,
    pub provider: Arc<dyn ModelProvider>,
    pub executor: Arc<dyn ToolExecutor>,
    pub checkpoints: Option<Arc<dyn CheckpointManager>>,
    pub environment: Arc<dyn EnvironmentProvider>,
    pub workspace_root: PathBuf,
    /// Override the built-in system prompt.
    pub system_prompt: Option<String>,
    /// Explicit task id; a fresh UUID when absent.
    pub task_id: Option<String>,
    /// Open a task directory (log, transcript, lock) under the configured
    /// tasks root.  Off for ephemeral/in-memory runs.
    pub persist: bool,
}

/// A single agentic task.  Owns the message log, transcript and per-turn
/// state; external input (cancellation, ask responses) arrives through the
/// shared [`TaskHandle`].
pub struct Task {
    pub(crate) id: String,
    pub(crate) cfg: Arc<Config>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) executor: Arc<dyn ToolExecutor>,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointManager>>,
    pub(crate) checkpoints_ready: bool,
    pub(crate) pending_first_commit: Option<tokio::task::JoinHandle<Option<String>>>,
    pub(crate) latest_checkpoint_hash: Option<String>,
    pub(crate) env: Arc<dyn EnvironmentProvider>,
    pub(crate) handle: Arc<TaskHandle>,
    pub(crate) events: mpsc::Sender<EngineEvent>,
    pub(crate) store: Option<Arc<TaskStore>>,
    pub(crate) log: MessageLog,
    pub(crate) transcript: Vec<ApiMessage>,
    pub(crate) context: ContextManager,
    pub(crate) state: TaskState,
    pub(crate) decoder: StreamDecoder,
    pub(crate) ignore: IgnoreController,
    pub(crate) auto_approval: AutoApprovalController,
    pub(crate) focus: Option<FocusChain>,
    pub(crate) tool_cx: ToolContext,
    pub(crate) system_prompt: String,
    pub(crate) parallel_tools: bool,
    pub(crate) native_tools: bool,
    pub(crate) turn_index: u32,
    pub(crate) last_usage: Option<UsageChunk>,
    pub(crate) command_timed_out: bool,
    pub(crate) completed: bool,
}

impl Task {
    /// Build a task.  Returns the task, the shared handle for cancellation
    /// and ask responses, and the engine event receiver.
    pub fn new(opts: TaskOptions) -> Result<(Self, Arc<TaskHandle>, mpsc::Receiver<EngineEvent>)> {
        let id = opts
            .task_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (events_tx, events_rx) = mpsc::channel(256);
        let store = if opts.persist {
            let root = opts.cfg.storage.resolved_tasks_dir();
            Some(Arc::new(
                TaskStore::open(&root, &id).context("opening task store")?,
            ))
        } else {
            None
        };

        let mut log = MessageLog::new(events_tx.clone(), store.clone());
        log.set_model_info(opts.provider.model_info());

        let focus = if opts.cfg.focus_chain.enabled {
            let path = match &store {
                Some(s) => s.focus_chain_path(),
                None => opts
                    .workspace_root
                    .join(format!("focus_chain_taskid_{id}.md")),
            };
            let mut fc = FocusChain::new(path, opts.cfg.focus_chain.clone());
            fc.watch();
            Some(fc)
        } else {
            None
        };

        let handle = Arc::new(TaskHandle::new());
        let parallel_tools =
            opts.cfg.engine.parallel_tool_calls || opts.provider.forces_parallel_tool_calls();
        let native_tools =
            opts.cfg.engine.native_tool_calling && opts.provider.supports_native_tools();
        let auto_approval = AutoApprovalController::new(opts.cfg.auto_approval.clone());
        let ignore = IgnoreController::load(&opts.workspace_root);
        let tool_cx = ToolContext {
            workspace_root: opts.workspace_root,
            command_timeout_ms: opts.cfg.engine.command_timeout_ms,
        };
        let context = ContextManager::new(opts.cfg.context.clone());

        info!(task_id = %id, parallel_tools, native_tools, "task created");
        let task = Self {
            id,
            provider: opts.provider,
            executor: opts.executor,
            checkpoints: opts.checkpoints,
            checkpoints_ready: false,
            pending_first_commit: None,
            latest_checkpoint_hash: None,
            env: opts.environment,
            handle: handle.clone(),
            events: events_tx,
            store,
            log,
            transcript: Vec::new(),
            context,
            state: TaskState::default(),
            decoder: StreamDecoder::new(native_tools),
            ignore,
            auto_approval,
            focus,
            tool_cx,
            system_prompt: opts
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            parallel_tools,
            native_tools,
            turn_index: 0,
            last_usage: None,
            command_timed_out: false,
            completed: false,
            cfg: opts.cfg,
        };
        Ok((task, handle, events_rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transcript(&self) -> &[ApiMessage] {
        &self.transcript
    }

    pub fn log_entries(&self) -> &[crate::message::DisplayEntry] {
        self.log.entries()
    }

    /// Pre-load conversation history into the transcript without running a
    /// turn.  Prior turns become context for the next [`run`] call.
    pub fn seed_transcript(&mut self, messages: Vec<ApiMessage>) {
        self.transcript = messages;
    }

    pub fn context_state(&self) -> &crate::context::ContextState {
        &self.context.state
    }

    /// Roll the task back to the state just before the entry at `ts`.
    ///
    /// `Task`/`Both` truncate the display log and transcript using the
    /// restore point snapshotted on the first removed entry; `Workspace`/
    /// `Both` additionally delegate to the checkpoint manager.
    pub async fn restore_to_message(&mut self, ts: u64, mode: RestoreMode) -> Result<()> {
        if matches!(mode, RestoreMode::Workspace | RestoreMode::Both) {
            if let Some(cp) = self.checkpoints.clone() {
                cp.restore(ts, mode, None).await?;
            }
        }
        if matches!(mode, RestoreMode::Task | RestoreMode::Both) {
            if let Some(point) = self.log.restore_to(ts) {
                self.transcript.truncate(point.conversation_history_index);
                self.context.state.deleted_range = point.deleted_range;
                self.persist_transcript();
                self.persist_context();
            }
        }
        Ok(())
    }

    // ── Entry points ─────────────────────────────────────────────────────────

    /// Start a fresh task from the user's text (plus optional image data
    /// URLs) and drive it to termination.
    pub async fn run(&mut self, task_text: &str, images: Vec<String>) -> Result<TaskOutcome> {
        info!(task_id = %self.id, "starting task");
        self.say(SayKind::Task, Some(task_text.to_string()), images.clone(), None)
            .await;
        let mut content = vec![ContentBlock::text(format!("<task>\n{task_text}\n</task>"))];
        for url in images {
            if let Some((media_type, data)) = split_data_url(&url) {
                content.push(ContentBlock::Image { media_type, data });
            }
        }
        self.drive(content, true).await
    }

    /// Reload a persisted task, trim stale tail entries, confirm with the
    /// user, and continue where it left off.
    pub async fn resume(&mut self) -> Result<TaskOutcome> {
        let store = self
            .store
            .clone()
            .context("resume requires a persisted task")?;
        let entries = trim_for_resume(store.load_display()?);
        let completed_before = entries
            .iter()
            .any(|e| e.is_say(SayKind::CompletionResult) || e.is_ask(AskKind::CompletionResult));
        self.log = MessageLog::from_entries(entries, self.events.clone(), Some(store.clone()));
        self.log.set_model_info(self.provider.model_info());
        self.transcript = reconcile_transcript_tail(store.load_transcript()?);
        self.context =
            ContextManager::with_state(self.cfg.context.clone(), store.load_context()?);
        store.save_display(self.log.entries())?;
        self.persist_transcript();

        let ask_kind = if completed_before {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        let response = match self.ask(ask_kind, None, None).await {
            Ok(AskOutcome::Resolved(resp)) => resp,
            Ok(AskOutcome::Ignored) => return Ok(TaskOutcome::Cancelled),
            Err(_) => return Ok(TaskOutcome::Cancelled),
        };
        if response.kind == AskResponseKind::Rejected {
            return Ok(TaskOutcome::Cancelled);
        }
        let mut resumption = String::from(
            "[TASK RESUMPTION] This task was interrupted. It may or may not be complete, so \
             please reassess the current state of the workspace before continuing. Retry the \
             last step if it did not finish, then proceed with the task.",
        );
        if let Some(feedback) = response.text {
            resumption.push_str(&format!(
                "\n\nNew instructions from the user:\n<user_message>\n{feedback}\n</user_message>"
            ));
        }
        self.drive(vec![ContentBlock::text(resumption)], true).await
    }

    async fn drive(
        &mut self,
        mut content: Vec<ContentBlock>,
        mut include_file_details: bool,
    ) -> Result<TaskOutcome> {
        loop {
            if self.handle.aborted() {
                return Ok(TaskOutcome::Cancelled);
            }
            match self.run_turn(content, include_file_details).await {
                Ok(TurnResult::Continue(next)) => {
                    let _ = self.events.send(EngineEvent::TurnCompleted).await;
                    content = next;
                    include_file_details = false;
                }
                Ok(TurnResult::Completed) => {
                    return Ok(if self.command_timed_out {
                        TaskOutcome::CommandTimedOut
                    } else {
                        TaskOutcome::Completed
                    });
                }
                Ok(TurnResult::Aborted) | Err(TaskAbort::Cancelled) => {
                    return Ok(TaskOutcome::Cancelled);
                }
                Err(TaskAbort::Abandoned) => return Ok(TaskOutcome::Cancelled),
                Ok(TurnResult::Failed(msg)) => return Ok(TaskOutcome::Failed(msg)),
            }
        }
    }

    // ── One turn ─────────────────────────────────────────────────────────────

    async fn run_turn(
        &mut self,
        mut user_content: Vec<ContentBlock>,
        include_file_details: bool,
    ) -> Result<TurnResult, TaskAbort> {
        self.turn_index += 1;

        // Mistake ceiling.
        if self.state.consecutive_mistake_count >= self.cfg.engine.max_consecutive_mistakes {
            if self.cfg.engine.yolo_mode {
                self.say(
                    SayKind::Error,
                    Some(
                        "Task failed: the model repeatedly replied without using any tool."
                            .to_string(),
                    ),
                    Vec::new(),
                    None,
                )
                .await;
                return Ok(TurnResult::Failed("mistake limit reached".into()));
            }
            match self
                .ask(
                    AskKind::MistakeLimitReached,
                    Some(MISTAKE_GUIDANCE.to_string()),
                    None,
                )
                .await?
            {
                AskOutcome::Resolved(resp) => {
                    if resp.kind == AskResponseKind::Rejected {
                        return Ok(TurnResult::Failed(
                            "user ended the task at the mistake limit".into(),
                        ));
                    }
                    self.state.consecutive_mistake_count = 0;
                    if let Some(feedback) = resp.text {
                        self.say(
                            SayKind::UserFeedback,
                            Some(feedback.clone()),
                            resp.images.clone(),
                            None,
                        )
                        .await;
                        user_content.push(ContentBlock::text(format!(
                            "The user has provided feedback:\n<feedback>\n{feedback}\n</feedback>"
                        )));
                    }
                }
                AskOutcome::Ignored => {}
            }
        }

        // Auto-approval ceiling.
        if self.auto_approval.enabled()
            && self.state.consecutive_auto_approved_requests >= self.auto_approval.max_requests()
        {
            match self
                .ask(
                    AskKind::AutoApprovalMaxReached,
                    Some(format!(
                        "{} auto-approved requests in a row. Reset the counter and keep going?",
                        self.state.consecutive_auto_approved_requests
                    )),
                    None,
                )
                .await?
            {
                AskOutcome::Resolved(resp) => {
                    if resp.kind == AskResponseKind::Rejected {
                        return Ok(TurnResult::Failed(
                            "user ended the task at the auto-approval ceiling".into(),
                        ));
                    }
                    self.state.consecutive_auto_approved_requests = 0;
                }
                AskOutcome::Ignored => {}
            }
        }
        if self.auto_approval.enabled() {
            self.state.consecutive_auto_approved_requests += 1;
        }

        // Placeholder request marker; filled in once the real request text
        // is known and again with final tallies after the stream ends.
        let request_index = self.transcript.len();
        let api_req_ts = self
            .say(
                SayKind::ApiReqStarted,
                Some(
                    ApiReqInfo {
                        request: Some("...".into()),
                        ..Default::default()
                    }
                    .to_text(),
                ),
                Vec::new(),
                None,
            )
            .await;

        if self.turn_index == 1 {
            self.kickoff_checkpoints().await;
        }

        // A summarization round-trip completed last turn: mask it out now.
        if self.context.currently_summarizing {
            self.context.currently_summarizing = false;
            self.context.advance_past_summary(self.transcript.len());
            self.persist_context();
            let _ = self.events.send(EngineEvent::ContextCompacted).await;
        }

        // Context assembly: compaction directive or environment details.
        let context_tokens = self.last_usage.map(|u| u.context_tokens()).unwrap_or(0);
        let window = self.provider.context_window();
        if self
            .context
            .should_compact(context_tokens, window, request_index)
        {
            if self.context.can_truncate(self.transcript.len()) {
                debug!(context_tokens, window, "requesting summarization turn");
                self.context.mark_compact_triggered(request_index);
                user_content.push(ContentBlock::text(SUMMARIZE_DIRECTIVE));
            } else {
                self.say(
                    SayKind::Error,
                    Some(BRICKED_CONTEXT_TEXT.to_string()),
                    Vec::new(),
                    None,
                )
                .await;
            }
        } else {
            let snap = self.env.snapshot(include_file_details).await;
            user_content.push(ContentBlock::text(build_environment_details(
                &snap,
                &self.ignore,
                include_file_details,
                context_tokens,
                window,
            )));
            if let Some(fc) = self.focus.as_mut() {
                if let Some(instructions) = fc.instructions_for_turn() {
                    user_content.push(ContentBlock::text(instructions));
                }
            }
        }

        // Transcript append, then fill in the real request text.
        self.transcript.push(ApiMessage::user(user_content.clone()));
        self.persist_transcript();
        let request_preview: String = user_content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        self.log
            .update_api_req(
                api_req_ts,
                &ApiReqInfo {
                    request: Some(request_preview),
                    ..Default::default()
                },
            )
            .await;

        // Request + stream, with a bounded retry loop for empty replies.
        let mut empty_attempts: u32 = 0;
        let turn = loop {
            let stream = match self.attempt_api_request(api_req_ts).await? {
                RequestResult::Stream(s) => s,
                RequestResult::Fatal(msg) => return Ok(TurnResult::Failed(msg)),
            };
            let turn = self.read_stream(stream).await?;

            match &turn.interruption {
                Some(Interruption::UserCancelled) => {
                    self.finalize_interrupted_turn(&turn, CancelReason::UserCancelled, api_req_ts)
                        .await;
                    return Ok(TurnResult::Aborted);
                }
                Some(Interruption::StreamError(msg)) => {
                    self.finalize_interrupted_turn(&turn, CancelReason::StreamingFailed, api_req_ts)
                        .await;
                    self.say(SayKind::Error, Some(msg.clone()), Vec::new(), None)
                        .await;
                    return Ok(TurnResult::Failed(format!("response stream failed: {msg}")));
                }
                None => {}
            }

            if turn.is_empty() {
                if empty_attempts < self.cfg.engine.max_retry_attempts {
                    empty_attempts += 1;
                    let delay = self.backoff_delay_ms(empty_attempts);
                    self.say(
                        SayKind::ApiReqRetried,
                        Some(format!(
                            "No assistant output received. Retrying in {delay} ms \
                             (attempt {empty_attempts}/{})",
                            self.cfg.engine.max_retry_attempts
                        )),
                        Vec::new(),
                        None,
                    )
                    .await;
                    self.sleep_cancellable(delay).await?;
                    continue;
                }
                self.transcript.push(ApiMessage::assistant(vec![ContentBlock::text(
                    "Failure: I did not provide a response.",
                )]));
                self.persist_transcript();
                self.say(
                    SayKind::Error,
                    Some(EMPTY_RESPONSE_TEXT.to_string()),
                    Vec::new(),
                    None,
                )
                .await;
                match self
                    .ask(AskKind::ApiReqFailed, Some(EMPTY_RESPONSE_TEXT.to_string()), None)
                    .await?
                {
                    AskOutcome::Resolved(resp) if resp.kind != AskResponseKind::Rejected => {
                        empty_attempts = 0;
                        continue;
                    }
                    _ => {
                        return Ok(TurnResult::Failed("model returned an empty response".into()))
                    }
                }
            }
            break turn;
        };

        // Post-stream reconciliation.
        self.reconcile_usage(&turn, api_req_ts).await;
        self.append_assistant_turn(&turn).await;

        if turn.tool_blocks.is_empty() {
            // The model replied in prose only: feed the correction back and
            // count the mistake.
            self.state.consecutive_mistake_count += 1;
            return Ok(TurnResult::Continue(vec![ContentBlock::text(
                NO_TOOLS_USED_FEEDBACK,
            )]));
        }

        self.wait_user_content_ready().await?;
        self.state.consecutive_mistake_count = 0;
        let next = std::mem::take(&mut self.state.user_message_content);
        if self.completed {
            return Ok(TurnResult::Completed);
        }
        Ok(TurnResult::Continue(next))
    }

    // ── Provider request with retry/backoff ──────────────────────────────────

    async fn attempt_api_request(
        &mut self,
        api_req_ts: u64,
    ) -> Result<RequestResult, TaskAbort> {
        let mut attempts: u32 = 0;
        loop {
            if self.handle.aborted() {
                return Err(TaskAbort::Cancelled);
            }
            let transcript = self.context.effective_transcript(&self.transcript);
            let native_functions;
            let tools = if self.native_tools {
                native_functions = tool_functions();
                Some(native_functions.as_slice())
            } else {
                None
            };

            debug!(attempt = attempts, "issuing provider request");
            self.state.is_waiting_for_first_chunk = true;
            let call = self
                .provider
                .create_message(&self.system_prompt, &transcript, tools)
                .await;

            let err = match call {
                Ok(mut stream) => {
                    let first = tokio::time::timeout(
                        Duration::from_millis(self.cfg.engine.first_chunk_timeout_ms),
                        stream.next(),
                    )
                    .await;
                    match first {
                        Ok(Some(Ok(chunk))) => {
                            self.state.is_waiting_for_first_chunk = false;
                            // The one-shot context recovery flag resets once
                            // a request succeeds, before any unrelated
                            // failure can occur.
                            self.state.did_automatically_retry_failed_api_request = false;
                            let rejoined: ChunkStream =
                                Box::pin(futures::stream::iter([Ok(chunk)]).chain(stream));
                            return Ok(RequestResult::Stream(rejoined));
                        }
                        Ok(Some(Err(e))) => e,
                        Ok(None) => {
                            // An empty stream is not a failure; the empty
                            // reply handling upstream takes over.
                            self.state.is_waiting_for_first_chunk = false;
                            return Ok(RequestResult::Stream(Box::pin(futures::stream::empty())));
                        }
                        Err(_) => {
                            ProviderError::other("timed out waiting for the first response chunk")
                        }
                    }
                }
                Err(e) => e,
            };
            self.state.is_waiting_for_first_chunk = false;

            match err.kind {
                ProviderErrorKind::ContextWindowExceeded
                    if !self.state.did_automatically_retry_failed_api_request =>
                {
                    if !self.context.can_truncate(self.transcript.len()) {
                        self.say(
                            SayKind::Error,
                            Some(BRICKED_CONTEXT_TEXT.to_string()),
                            Vec::new(),
                            None,
                        )
                        .await;
                        return Ok(RequestResult::Fatal(
                            "context window exhausted with too few messages to truncate".into(),
                        ));
                    }
                    warn!("context window exceeded; truncating and retrying once");
                    if let Some(range) = self
                        .context
                        .truncate(self.transcript.len(), TruncationStrategy::RemoveQuarter)
                    {
                        self.persist_context();
                        let _ = self
                            .events
                            .send(EngineEvent::ContextTruncated { deleted_range: range })
                            .await;
                    }
                    self.state.did_automatically_retry_failed_api_request = true;
                    continue;
                }
                ProviderErrorKind::Auth | ProviderErrorKind::Balance => {
                    // Never auto-retried; fall through to the ask.
                }
                _ if err.retryable && attempts < self.cfg.engine.max_retry_attempts => {
                    attempts += 1;
                    let delay = self.backoff_delay_ms(attempts);
                    warn!(attempt = attempts, delay_ms = delay, "provider request failed: {err}");
                    self.say(
                        SayKind::ApiReqRetried,
                        Some(format!(
                            "Request failed: {err}. Retrying in {delay} ms (attempt {attempts}/{})",
                            self.cfg.engine.max_retry_attempts
                        )),
                        Vec::new(),
                        None,
                    )
                    .await;
                    self.sleep_cancellable(delay).await?;
                    continue;
                }
                _ => {}
            }

            self.log
                .update_api_req(
                    api_req_ts,
                    &ApiReqInfo {
                        failure: Some(err.to_string()),
                        ..Default::default()
                    },
                )
                .await;
            match self
                .ask(AskKind::ApiReqFailed, Some(err.to_string()), None)
                .await?
            {
                AskOutcome::Resolved(resp) if resp.kind != AskResponseKind::Rejected => {
                    attempts = 0;
                    continue;
                }
                _ => return Ok(RequestResult::Fatal(format!("API request failed: {err}"))),
            }
        }
    }

    fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        self.cfg.engine.retry_base_delay_ms << (attempt.saturating_sub(1).min(8))
    }

    async fn sleep_cancellable(&self, ms: u64) -> Result<(), TaskAbort> {
        tokio::select! {
            biased;
            _ = self.handle.cancelled() => Err(TaskAbort::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }

    // ── Stream consumption ───────────────────────────────────────────────────

    async fn read_stream(&mut self, mut stream: ChunkStream) -> Result<StreamedTurn, TaskAbort> {
        self.state.reset_for_request();
        self.decoder = StreamDecoder::new(self.native_tools);
        self.state.is_streaming = true;
        let mut interruption: Option<Interruption> = None;

        loop {
            if self.handle.abandoned() {
                return Err(TaskAbort::Abandoned);
            }
            if self.handle.aborted() {
                interruption = Some(Interruption::UserCancelled);
                break;
            }
            let item = tokio::select! {
                biased;
                _ = self.handle.cancelled() => {
                    interruption = Some(Interruption::UserCancelled);
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            match item {
                Ok(chunk) => match self.process_chunk(chunk).await {
                    Ok(()) => {}
                    Err(TaskAbort::Cancelled) => {
                        interruption = Some(Interruption::UserCancelled);
                        break;
                    }
                    Err(TaskAbort::Abandoned) => return Err(TaskAbort::Abandoned),
                },
                Err(e) => {
                    warn!("mid-stream provider failure: {e}");
                    interruption = Some(Interruption::StreamError(e.to_string()));
                    break;
                }
            }
            if self.state.did_reject_tool
                || (!self.parallel_tools && self.state.did_already_use_tool)
            {
                // Nothing further in this turn may execute; stop paying for
                // tokens we will not use.
                self.provider.abort();
                break;
            }
        }

        self.state.is_streaming = false;
        self.state.did_complete_reading_stream = true;

        // Flush lingering partials to complete and run the presenter over
        // the finalized list.
        self.state.assistant_content = self.decoder.finalize();
        let reasoning_still_partial = self
            .log
            .last()
            .map(|e| e.partial && e.is_say(SayKind::Reasoning))
            .unwrap_or(false);
        if reasoning_still_partial {
            let body = self.decoder.reasoning().to_string();
            self.say(SayKind::Reasoning, Some(body), Vec::new(), Some(false))
                .await;
        }
        if interruption.is_none() {
            match self.present().await {
                Ok(()) => {}
                Err(TaskAbort::Cancelled) => interruption = Some(Interruption::UserCancelled),
                Err(TaskAbort::Abandoned) => return Err(TaskAbort::Abandoned),
            }
        }

        let tool_blocks: Vec<ToolUseBlock> = self
            .state
            .assistant_content
            .iter()
            .filter_map(|b| b.as_tool_use())
            .filter(|t| !t.partial)
            .cloned()
            .collect();
        Ok(StreamedTurn {
            text: self.decoder.raw_text().to_string(),
            reasoning: self.decoder.reasoning().to_string(),
            reasoning_signature: self.decoder.reasoning_signature().map(str::to_string),
            tool_blocks,
            usage: self.decoder.usage(),
            interruption,
        })
    }

    async fn process_chunk(&mut self, chunk: StreamChunk) -> Result<(), TaskAbort> {
        match chunk {
            StreamChunk::Usage(usage) => {
                self.decoder.set_usage(usage);
            }
            StreamChunk::Reasoning { text, signature } => {
                self.decoder.feed_reasoning(&text, signature);
                let body = self.decoder.reasoning().to_string();
                self.say(SayKind::Reasoning, Some(body), Vec::new(), Some(true))
                    .await;
            }
            StreamChunk::Text { text } => {
                if !text.is_empty()
                    && self.decoder.raw_text().is_empty()
                    && !self.decoder.reasoning().is_empty()
                {
                    // Reasoning ends when prose starts.
                    let body = self.decoder.reasoning().to_string();
                    self.say(SayKind::Reasoning, Some(body), Vec::new(), Some(false))
                        .await;
                }
                self.state.assistant_content = self.decoder.feed_text(&text);
                self.present().await?;
            }
            StreamChunk::ToolCall {
                index,
                call_id,
                name,
                arguments,
            } => {
                self.state.assistant_content =
                    self.decoder.feed_tool_call(index, &call_id, &name, &arguments);
                self.present().await?;
            }
        }
        Ok(())
    }

    // ── Post-stream reconciliation ───────────────────────────────────────────

    async fn reconcile_usage(&mut self, turn: &StreamedTurn, api_req_ts: u64) {
        let usage = match turn.usage {
            Some(u) => Some(u),
            // The stream ended without a usage chunk; try the provider's
            // out-of-band accounting endpoint.
            None => self.provider.fetch_stream_usage().await,
        };
        let Some(usage) = usage else { return };
        self.last_usage = Some(usage);
        let mut info = self.log.api_req_info(api_req_ts).unwrap_or_default();
        info.tokens_in = Some(usage.input_tokens);
        info.tokens_out = Some(usage.output_tokens);
        info.cache_writes = Some(usage.cache_write_tokens);
        info.cache_reads = Some(usage.cache_read_tokens);
        info.cost = Some(usage.total_cost.unwrap_or(0.0));
        self.log.update_api_req(api_req_ts, &info).await;
        let _ = self
            .events
            .send(EngineEvent::TokenUsage {
                input: usage.input_tokens,
                output: usage.output_tokens,
                cache_read: usage.cache_read_tokens,
                cache_write: usage.cache_write_tokens,
                total_cost: usage.total_cost,
                context_tokens: usage.context_tokens(),
                context_window: self.provider.context_window(),
            })
            .await;
    }

    /// Append the assistant's message to the transcript: reasoning first,
    /// then text, then structured tool-use blocks (native path only — on the
    /// text path the tool tags are already embodied in the text).
    async fn append_assistant_turn(&mut self, turn: &StreamedTurn) {
        let mut blocks = Vec::new();
        if !turn.reasoning.is_empty() {
            blocks.push(ContentBlock::Thinking {
                text: turn.reasoning.clone(),
                signature: turn.reasoning_signature.clone(),
            });
        }
        let mut text = turn.text.clone();
        if self.state.did_reject_tool {
            if text.is_empty() {
                text = "[Response interrupted by user feedback]".to_string();
            } else {
                text.push_str("\n\n[Response interrupted by user feedback]");
            }
        }
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
        if self.native_tools {
            for t in &turn.tool_blocks {
                blocks.push(ContentBlock::ToolUse {
                    id: t.id.clone().unwrap_or_default(),
                    name: t.name.as_str().to_string(),
                    input: t.input_json(),
                });
            }
        }
        let mut message = ApiMessage::assistant(blocks);
        message.model_info = Some(self.provider.model_info());
        message.metrics = turn.usage;
        self.transcript.push(message);
        self.persist_transcript();
    }

    /// The turn was cut short (user cancel or stream failure): record what
    /// arrived, mark the request entry, and persist — unless the task was
    /// abandoned, in which case late work must not touch anything.
    async fn finalize_interrupted_turn(
        &mut self,
        turn: &StreamedTurn,
        reason: CancelReason,
        api_req_ts: u64,
    ) {
        if self.handle.abandoned() {
            return;
        }
        let marker = match reason {
            CancelReason::UserCancelled => "[Response interrupted by user]",
            CancelReason::StreamingFailed => "[Response interrupted by API Error]",
        };
        let mut blocks = Vec::new();
        if !turn.reasoning.is_empty() {
            blocks.push(ContentBlock::Thinking {
                text: turn.reasoning.clone(),
                signature: turn.reasoning_signature.clone(),
            });
        }
        let text = if turn.text.is_empty() {
            marker.to_string()
        } else {
            format!("{}\n\n{marker}", turn.text)
        };
        blocks.push(ContentBlock::text(text));
        let mut message = ApiMessage::assistant(blocks);
        message.model_info = Some(self.provider.model_info());
        self.transcript.push(message);
        self.persist_transcript();

        let mut info = self.log.api_req_info(api_req_ts).unwrap_or_default();
        info.cancel_reason = Some(reason);
        if let Some(usage) = turn.usage.or(self.last_usage) {
            info.cost = Some(usage.total_cost.unwrap_or(0.0));
        }
        self.log.update_api_req(api_req_ts, &info).await;
        let _ = self
            .events
            .send(EngineEvent::Aborted {
                partial_text: turn.text.clone(),
            })
            .await;
    }

    async fn wait_user_content_ready(&mut self) -> Result<(), TaskAbort> {
        loop {
            if self.state.user_message_content_ready {
                return Ok(());
            }
            if self.handle.aborted() {
                return Err(TaskAbort::Cancelled);
            }
            self.present().await?;
            if self.state.user_message_content_ready {
                return Ok(());
            }
            self.handle
                .changed(self.cfg.engine.ask_poll_interval_ms)
                .await;
        }
    }

    // ── Checkpoints ──────────────────────────────────────────────────────────

    async fn kickoff_checkpoints(&mut self) {
        if !self.cfg.checkpoints.enabled {
            return;
        }
        let Some(cp) = self.checkpoints.clone() else {
            return;
        };
        let timeout = Duration::from_millis(self.cfg.checkpoints.init_timeout_ms);
        match tokio::time::timeout(timeout, cp.initialize()).await {
            Ok(Ok(())) => {
                self.checkpoints_ready = true;
                let committer = cp.clone();
                // The initial commit proceeds in the background; the first
                // non-read-only tool waits for it to land.
                self.pending_first_commit =
                    Some(tokio::spawn(async move { committer.commit().await.ok() }));
            }
            Ok(Err(e)) => {
                warn!("checkpoint initialization failed; checkpoints disabled: {e:#}");
                self.say(
                    SayKind::Error,
                    Some(format!("Checkpoints are unavailable for this task: {e}")),
                    Vec::new(),
                    None,
                )
                .await;
            }
            Err(_) => {
                warn!("checkpoint initialization timed out; checkpoints disabled");
                self.say(
                    SayKind::Error,
                    Some("Checkpoints are unavailable for this task: initialization timed out."
                        .to_string()),
                    Vec::new(),
                    None,
                )
                .await;
            }
        }
    }

    // ── Ask / say ────────────────────────────────────────────────────────────

    fn entry_meta(&self) -> EntryMeta {
        EntryMeta {
            conversation_history_index: self.transcript.len(),
            deleted_range: self.context.deleted_range(),
        }
    }

    /// Append (or coalesce) a say entry.
    pub(crate) async fn say(
        &mut self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
        partial: Option<bool>,
    ) -> u64 {
        let meta = self.entry_meta();
        self.log.say(kind, text, images, partial, meta).await
    }

    /// The ask rendezvous: append the prompt, then wait until the user
    /// responds, a newer message supersedes it, or the task aborts.
    pub(crate) async fn ask(
        &mut self,
        kind: AskKind,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<AskOutcome, TaskAbort> {
        if self.handle.aborted() {
            return Err(TaskAbort::Cancelled);
        }
        let meta = self.entry_meta();
        let (ts, _updated_in_place) = self.log.ask(kind, text.clone(), partial, meta).await;
        self.handle.set_last_message_ts(ts);
        if partial == Some(true) {
            // A streaming UI update on a pending ask never blocks; the
            // caller is racing a prior stream and unwinds.
            return Ok(AskOutcome::Ignored);
        }
        self.handle.clear_response();
        let _ = self
            .events
            .send(EngineEvent::AskPending { ts, kind, text })
            .await;
        loop {
            if self.handle.aborted() {
                return Err(TaskAbort::Cancelled);
            }
            if self.handle.last_message_ts() != ts {
                return Ok(AskOutcome::Ignored);
            }
            if let Some(resp) = self.handle.take_response() {
                return Ok(AskOutcome::Resolved(resp));
            }
            self.handle
                .changed(self.cfg.engine.ask_poll_interval_ms)
                .await;
        }
    }

    // ── Persistence helpers ──────────────────────────────────────────────────

    pub(crate) fn persist_transcript(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_transcript(&self.transcript) {
                warn!("failed to persist transcript: {e:#}");
            }
        }
    }

    pub(crate) fn persist_context(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_context(&self.context.state) {
                warn!("failed to persist context state: {e:#}");
            }
        }
    }
}

/// Split a `data:<mime>;base64,<data>` URL into its mime type and payload.
pub(crate) fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta);
    Some((mime.to_string(), data.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_splits_into_mime_and_payload() {
        let (mime, data) = split_data_url("data:image/png;base64,QUJD").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "QUJD");
    }

    #[test]
    fn non_data_url_is_rejected() {
        assert!(split_data_url("https://example.com/x.png").is_none());
    }

    #[test]
    fn backoff_doubles_from_base() {
        let cfg = Arc::new(Config::default());
        // 2 s, 4 s, 8 s with the default base delay.
        assert_eq!(cfg.engine.retry_base_delay_ms, 2_000);
        assert_eq!(cfg.engine.retry_base_delay_ms << 1, 4_000);
        assert_eq!(cfg.engine.retry_base_delay_ms << 2, 8_000);
    }
}
