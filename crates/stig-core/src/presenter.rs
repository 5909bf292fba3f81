// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Serialized consumer of the decoder's block list.
//!
//! At most one block is dispatched at a time: text goes to the UI in order,
//! completed tool blocks run through approval and the executor.  A
//! non-reentrancy lock plus a pending-updates flag coalesce wake-ups that
//! arrive while a dispatch is in flight; the cursor only ever moves forward.

use serde_json::json;
use tracing::debug;

use stig_model::ContentBlock;
use stig_tools::kind::{ParamName, ToolKind, ToolUseBlock};
use stig_tools::IgnoreController;

use crate::driver::{split_data_url, Task};
use crate::error::TaskAbort;
use crate::events::EngineEvent;
use crate::message::{AskKind, AskOutcome, AskResponseKind, EntryKind, SayKind};
use crate::parser::{clean_text_for_display, AssistantBlock, TextBlock};

impl Task {
    /// Wake the presenter.  Re-entrant calls set the pending flag and
    /// return; the running instance loops until the flag stays clear.
    pub(crate) async fn present(&mut self) -> Result<(), TaskAbort> {
        if self.state.present_locked {
            self.state.present_has_pending_updates = true;
            return Ok(());
        }
        self.state.present_locked = true;
        let mut result = self.present_inner().await;
        while result.is_ok() && self.state.present_has_pending_updates {
            self.state.present_has_pending_updates = false;
            result = self.present_inner().await;
        }
        self.state.present_locked = false;
        result
    }

    async fn present_inner(&mut self) -> Result<(), TaskAbort> {
        loop {
            let i = self.state.current_streaming_content_index;
            if i >= self.state.assistant_content.len() {
                if self.state.did_complete_reading_stream {
                    self.state.user_message_content_ready = true;
                }
                return Ok(());
            }
            let block = self.state.assistant_content[i].clone();
            self.dispatch_block(&block).await?;

            let cutoff = self.state.did_reject_tool
                || (!self.parallel_tools && self.state.did_already_use_tool);
            if block.partial() && !cutoff {
                // Wait for more bytes before advancing past a partial block.
                return Ok(());
            }
            if i == self.state.assistant_content.len() - 1
                && self.state.did_complete_reading_stream
            {
                self.state.user_message_content_ready = true;
            }
            self.state.current_streaming_content_index += 1;
        }
    }

    async fn dispatch_block(&mut self, block: &AssistantBlock) -> Result<(), TaskAbort> {
        match block {
            AssistantBlock::Text(t) => self.dispatch_text(t).await,
            AssistantBlock::ToolUse(t) => self.dispatch_tool(t).await,
        }
    }

    async fn dispatch_text(&mut self, block: &TextBlock) -> Result<(), TaskAbort> {
        if self.state.did_reject_tool
            || (!self.parallel_tools && self.state.did_already_use_tool)
        {
            // Prose after a rejection or the single-tool cutoff is never
            // shown; the turn is already over from the user's perspective.
            return Ok(());
        }
        let cleaned = clean_text_for_display(&block.content, block.partial);
        if cleaned.is_empty() {
            return Ok(());
        }
        self.say(SayKind::Text, Some(cleaned), Vec::new(), Some(block.partial))
            .await;
        Ok(())
    }

    async fn dispatch_tool(&mut self, block: &ToolUseBlock) -> Result<(), TaskAbort> {
        if self.state.did_reject_tool {
            if !block.partial {
                self.push_tool_result_text(
                    block,
                    format!(
                        "Skipping tool [{}] due to a previous tool being rejected by the user.",
                        block.name
                    ),
                );
            }
            return Ok(());
        }
        if !self.parallel_tools && self.state.did_already_use_tool {
            if !block.partial {
                self.push_tool_result_text(
                    block,
                    format!(
                        "Tool [{}] was not executed because a tool has already been used in \
                         this message. Only one tool may be used per message.",
                        block.name
                    ),
                );
            }
            return Ok(());
        }

        if block.partial {
            // Streaming preview; approval happens once the block completes.
            let desc = describe_tool(block);
            self.say(SayKind::Tool, Some(desc), Vec::new(), Some(true)).await;
            return Ok(());
        }

        match block.name {
            ToolKind::AttemptCompletion => return self.handle_completion(block).await,
            ToolKind::AskFollowupQuestion => return self.handle_followup(block).await,
            ToolKind::SummarizeTask => return self.handle_summarize(block).await,
            _ => {}
        }

        if !self.approve_tool(block).await? {
            return Ok(());
        }

        // Workspace-ignore gate for path-based tools.
        if let Some(path) = block.param(ParamName::Path) {
            if !self.ignore.is_allowed(path) {
                let denial = IgnoreController::denial_message(path);
                self.say(SayKind::Error, Some(denial.clone()), Vec::new(), None)
                    .await;
                self.push_tool_result(block, denial, Vec::new(), true);
                self.state.did_already_use_tool = true;
                return Ok(());
            }
        }

        // A mutating tool on the first turn waits for the initial workspace
        // snapshot to land.
        if !block.name.is_read_only() {
            self.await_initial_commit().await;
        }

        debug!(tool = %block.name, "executing tool");
        let outcome = self.executor.execute(block, &self.tool_cx).await;
        if outcome.timed_out {
            self.command_timed_out = true;
        }
        self.record_task_progress(block).await;
        let content = if outcome.content.is_empty() {
            format!("{} completed successfully.", block.name)
        } else {
            outcome.content.clone()
        };
        self.push_tool_result(block, content, outcome.images.clone(), outcome.is_error);
        self.state.did_already_use_tool = true;

        if !block.name.is_read_only() {
            self.save_checkpoint_after_mutation().await;
        }
        Ok(())
    }

    /// Run the approval gate: auto-approve when settings allow, otherwise
    /// raise the matching ask.  Returns false when the tool was denied.
    async fn approve_tool(&mut self, block: &ToolUseBlock) -> Result<bool, TaskAbort> {
        let desc = describe_tool(block);
        if self.auto_approval.should_auto_approve(block) {
            self.say(SayKind::Tool, Some(desc), Vec::new(), Some(false)).await;
            return Ok(true);
        }
        // The streamed preview say is replaced by the ask.
        self.log
            .drop_last_partial_if(EntryKind::Say, None, Some(SayKind::Tool));
        let ask_kind = match block.name {
            ToolKind::ExecuteCommand => AskKind::Command,
            ToolKind::BrowserAction => AskKind::BrowserActionLaunch,
            ToolKind::UseMcpTool | ToolKind::AccessMcpResource => AskKind::UseMcpServer,
            _ => AskKind::Tool,
        };
        match self.ask(ask_kind, Some(desc), None).await? {
            AskOutcome::Resolved(resp) => match resp.kind {
                AskResponseKind::Approved => Ok(true),
                AskResponseKind::Rejected | AskResponseKind::Message => {
                    self.state.did_reject_tool = true;
                    let mut denial = "The user denied this operation.".to_string();
                    if let Some(feedback) = resp.text {
                        self.say(
                            SayKind::UserFeedback,
                            Some(feedback.clone()),
                            resp.images.clone(),
                            None,
                        )
                        .await;
                        denial.push_str(&format!(
                            " The user provided the following feedback:\n<feedback>\n{feedback}\n</feedback>"
                        ));
                    }
                    self.push_tool_result(block, denial, Vec::new(), false);
                    Ok(false)
                }
            },
            AskOutcome::Ignored => Ok(false),
        }
    }

    // ── Engine-internal tools ────────────────────────────────────────────────

    async fn handle_completion(&mut self, block: &ToolUseBlock) -> Result<(), TaskAbort> {
        let result = block.param(ParamName::Result).unwrap_or_default().to_string();
        self.say(SayKind::CompletionResult, Some(result.clone()), Vec::new(), Some(false))
            .await;
        let _ = self
            .events
            .send(EngineEvent::TaskCompleted {
                result: result.clone(),
            })
            .await;
        if self.checkpoints_ready {
            if let Some(cp) = self.checkpoints.clone() {
                let _ = cp.save_checkpoint(true, None).await;
            }
        }
        self.record_task_progress(block).await;
        // Completion defers to the user: acceptance ends the task, feedback
        // threads back into the next turn.
        match self.ask(AskKind::CompletionResult, None, None).await? {
            AskOutcome::Resolved(resp) => match resp.kind {
                AskResponseKind::Message => {
                    let feedback = resp.text.unwrap_or_default();
                    self.say(
                        SayKind::UserFeedback,
                        Some(feedback.clone()),
                        resp.images.clone(),
                        None,
                    )
                    .await;
                    self.push_tool_result(
                        block,
                        format!(
                            "The user has provided feedback on the results:\n<feedback>\n{feedback}\n</feedback>"
                        ),
                        Vec::new(),
                        false,
                    );
                }
                AskResponseKind::Approved | AskResponseKind::Rejected => {
                    self.completed = true;
                    self.push_tool_result(
                        block,
                        "The user is satisfied with the result.".to_string(),
                        Vec::new(),
                        false,
                    );
                }
            },
            AskOutcome::Ignored => {}
        }
        self.state.did_already_use_tool = true;
        Ok(())
    }

    async fn handle_followup(&mut self, block: &ToolUseBlock) -> Result<(), TaskAbort> {
        let question = block
            .param(ParamName::Question)
            .unwrap_or_default()
            .to_string();
        match self.ask(AskKind::Followup, Some(question), None).await? {
            AskOutcome::Resolved(resp) => {
                let answer = resp.text.unwrap_or_default();
                self.say(SayKind::UserFeedback, Some(answer.clone()), resp.images.clone(), None)
                    .await;
                self.push_tool_result(
                    block,
                    format!("<answer>\n{answer}\n</answer>"),
                    Vec::new(),
                    false,
                );
            }
            AskOutcome::Ignored => {}
        }
        self.state.did_already_use_tool = true;
        Ok(())
    }

    async fn handle_summarize(&mut self, block: &ToolUseBlock) -> Result<(), TaskAbort> {
        let summary = block
            .param(ParamName::Context)
            .unwrap_or_default()
            .to_string();
        self.say(SayKind::CondenseContext, Some(summary), Vec::new(), Some(false))
            .await;
        // The masked range advances past this request/response pair at the
        // start of the next turn.
        self.context.currently_summarizing = true;
        self.push_tool_result(
            block,
            "The conversation history has been summarized. Continue the task using the summary \
             as your context; do not repeat work that is already recorded there."
                .to_string(),
            Vec::new(),
            false,
        );
        self.state.did_already_use_tool = true;
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn record_task_progress(&mut self, block: &ToolUseBlock) {
        let Some(progress) = block.param(ParamName::TaskProgress) else {
            return;
        };
        let Some(fc) = self.focus.as_mut() else {
            return;
        };
        let progress = progress.to_string();
        if let Err(e) = fc.update_from_progress(&progress) {
            tracing::warn!("failed to update focus chain: {e:#}");
            return;
        }
        let (total, completed) = crate::focus_chain::FocusChain::counts(&progress);
        self.say(
            SayKind::FocusChainUpdated,
            Some(format!("{completed}/{total} steps complete")),
            Vec::new(),
            None,
        )
        .await;
    }

    async fn await_initial_commit(&mut self) {
        let Some(pending) = self.pending_first_commit.take() else {
            return;
        };
        let timeout = std::time::Duration::from_millis(self.cfg.checkpoints.init_timeout_ms);
        if let Ok(Ok(Some(hash))) = tokio::time::timeout(timeout, pending).await {
            if !hash.is_empty() {
                self.latest_checkpoint_hash = Some(hash);
            }
        }
    }

    async fn save_checkpoint_after_mutation(&mut self) {
        if !self.checkpoints_ready {
            return;
        }
        let Some(cp) = self.checkpoints.clone() else {
            return;
        };
        if let Err(e) = cp.save_checkpoint(false, None).await {
            tracing::warn!("checkpoint save failed: {e:#}");
            return;
        }
        if let Ok(hash) = cp.commit().await {
            if !hash.is_empty() {
                self.latest_checkpoint_hash = Some(hash.clone());
                let ts = self.say(SayKind::Checkpoint, Some(hash.clone()), Vec::new(), None).await;
                self.log.set_checkpoint_hash(ts, hash).await;
            }
        }
    }

    /// Append exactly one tool-result entry for `block` to the content that
    /// becomes the next user message.
    pub(crate) fn push_tool_result(
        &mut self,
        block: &ToolUseBlock,
        content: String,
        images: Vec<String>,
        is_error: bool,
    ) {
        match &block.id {
            // Native tool call: a structured result referencing the call id.
            Some(id) => self.state.user_message_content.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content,
                is_error,
            }),
            // Text-path tool tag: a plain text result.
            None => self
                .state
                .user_message_content
                .push(ContentBlock::text(format!("[{}] Result:\n{}", block.name, content))),
        }
        for url in images {
            if let Some((media_type, data)) = split_data_url(&url) {
                self.state
                    .user_message_content
                    .push(ContentBlock::Image { media_type, data });
            }
        }
    }

    pub(crate) fn push_tool_result_text(&mut self, block: &ToolUseBlock, content: String) {
        self.push_tool_result(block, content, Vec::new(), false);
    }
}

/// Compact JSON description of a tool invocation for the UI.
fn describe_tool(block: &ToolUseBlock) -> String {
    let mut value = json!({ "tool": block.name.as_str() });
    if let serde_json::Value::Object(map) = &mut value {
        for (name, val) in &block.params {
            map.insert(name.as_str().to_string(), json!(val));
        }
    }
    value.to_string()
}
