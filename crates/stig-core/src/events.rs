// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::message::{AskKind, DisplayEntry};

/// Events pushed to the UI transport during a task.
/// Consumers (CLI renderer, tests) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A display entry was appended or updated in place.  The same `ts`
    /// appearing twice means an in-place update of that entry.
    Message(DisplayEntry),
    /// An ask is pending and a response is expected through the task handle.
    AskPending {
        ts: u64,
        kind: AskKind,
        text: Option<String>,
    },
    /// Per-request token and cost accounting.
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        total_cost: Option<f64>,
        context_tokens: usize,
        context_window: usize,
    },
    /// The transcript's masked interval advanced.
    ContextTruncated {
        deleted_range: (usize, usize),
    },
    /// A summarization pass replaced older history.
    ContextCompacted,
    /// The model signalled task completion; the result text is final.
    TaskCompleted { result: String },
    /// One driver turn finished (tool results gathered or text-only reply).
    TurnCompleted,
    /// The task was cancelled; any partial text streamed so far is included.
    Aborted { partial_text: String },
}
