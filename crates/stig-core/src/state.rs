// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use stig_model::ContentBlock;

use crate::message::AskResponse;
use crate::parser::AssistantBlock;

/// Per-turn and per-task mutable state owned by the driver.
///
/// All fields are touched only from the driver's own logical task, at
/// explicit await boundaries; cross-task inputs (cancellation, ask
/// responses) come in through [`TaskHandle`] instead.
#[derive(Debug, Default)]
pub struct TaskState {
    pub is_streaming: bool,
    pub is_waiting_for_first_chunk: bool,
    pub did_complete_reading_stream: bool,
    /// Presenter cursor into `assistant_content`.
    pub current_streaming_content_index: usize,
    /// Set when the turn's tool outputs are gathered and the driver may
    /// continue.
    pub user_message_content_ready: bool,
    /// Non-reentrancy guard on the presenter.
    pub present_locked: bool,
    /// Coalesces presenter wake-ups that arrive while it is running.
    pub present_has_pending_updates: bool,
    /// Once true, subsequent tool blocks in the same turn are skipped.
    pub did_reject_tool: bool,
    /// With parallel tool calling off, further tool blocks short-circuit
    /// after the first one executes.
    pub did_already_use_tool: bool,
    pub consecutive_mistake_count: u32,
    pub consecutive_auto_approved_requests: u32,
    /// One-shot flag for the automatic context-window-exceeded recovery.
    /// Distinct from the backoff retry counter, which is per-request.
    pub did_automatically_retry_failed_api_request: bool,
    /// The decoder's growing block list for the current turn.
    pub assistant_content: Vec<AssistantBlock>,
    /// Tool results and feedback accumulated for the next user message.
    pub user_message_content: Vec<ContentBlock>,
}

impl TaskState {
    /// Reset the per-request fields at the start of a provider request.
    pub fn reset_for_request(&mut self) {
        self.is_streaming = false;
        self.is_waiting_for_first_chunk = false;
        self.did_complete_reading_stream = false;
        self.current_streaming_content_index = 0;
        self.user_message_content_ready = false;
        self.present_locked = false;
        self.present_has_pending_updates = false;
        self.did_reject_tool = false;
        self.did_already_use_tool = false;
        self.assistant_content.clear();
        self.user_message_content.clear();
    }
}

/// Shared handle for the inputs that arrive from outside the driver's task:
/// cancellation and ask responses.  Waiters park on `notify`, with a bounded
/// fallback tick so a missed edge can never wedge the task.
#[derive(Debug, Default)]
pub struct TaskHandle {
    abort: AtomicBool,
    abandoned: AtomicBool,
    /// Identity of the currently-awaited ask; a newer message supersedes an
    /// older pending ask.
    last_message_ts: AtomicU64,
    ask_response: Mutex<Option<AskResponse>>,
    notify: Notify,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Every suspension point observes this within
    /// one poll interval.
    pub fn cancel(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Like [`cancel`], but also suppresses graceful-abort side effects —
    /// used when the driver has given up waiting and late work must no-op.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Deliver the user's response to the pending ask.
    pub fn respond(&self, response: AskResponse) {
        *self.ask_response.lock().unwrap() = Some(response);
        self.notify.notify_waiters();
    }

    pub(crate) fn take_response(&self) -> Option<AskResponse> {
        self.ask_response.lock().unwrap().take()
    }

    pub(crate) fn clear_response(&self) {
        self.ask_response.lock().unwrap().take();
    }

    pub(crate) fn set_last_message_ts(&self, ts: u64) {
        self.last_message_ts.store(ts, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn last_message_ts(&self) -> u64 {
        self.last_message_ts.load(Ordering::SeqCst)
    }

    /// Wait until something relevant may have changed: a response landed,
    /// a newer message superseded the ask, or the task was cancelled.
    pub(crate) async fn changed(&self, fallback_tick_ms: u64) {
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(fallback_tick_ms.max(1))) => {}
        }
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register the waiter before re-checking the flag:
            // `notify_waiters` stores no permit, so a cancel landing between
            // the check and the registration would otherwise never wake us.
            let notified = self.notify.notified();
            if self.aborted() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
