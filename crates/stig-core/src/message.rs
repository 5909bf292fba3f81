// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use stig_model::ModelInfo;

/// Prompts that block logical progress until the user responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CommandOutput,
    Tool,
    BrowserActionLaunch,
    UseMcpServer,
    ApiReqFailed,
    MistakeLimitReached,
    AutoApprovalMaxReached,
    CompletionResult,
    ResumeTask,
    ResumeCompletedTask,
}

/// Non-blocking messages from the assistant or the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqRetried,
    Tool,
    Command,
    CommandOutput,
    CompletionResult,
    UserFeedback,
    /// A user edit applied to a streamed diff before approval.
    UserFeedbackDiff,
    McpServerRequestStarted,
    McpServerResponse,
    Checkpoint,
    CondenseContext,
    FocusChainUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Ask,
    Say,
}

/// One entry in the UI-visible display log.
///
/// `ts` is assigned once at append time and never changes afterwards — it is
/// the stable identity the UI's virtualized list keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayEntry {
    pub ts: u64,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<AskKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<SayKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default)]
    pub partial: bool,
    /// Length of the provider transcript at append time; restore operations
    /// use it to reconstruct the transcript for this point in the log.
    pub conversation_history_index: usize,
    /// Snapshot of the masked transcript interval at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_range_snapshot: Option<(usize, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
}

impl DisplayEntry {
    /// Entries coalesce only within the same `(kind, subtype)` pair.
    pub fn same_subtype(&self, kind: EntryKind, ask: Option<AskKind>, say: Option<SayKind>) -> bool {
        self.kind == kind && self.ask == ask && self.say == say
    }

    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind == EntryKind::Ask && self.ask == Some(kind)
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == EntryKind::Say && self.say == Some(kind)
    }
}

/// Bookkeeping serialised into the text of an `ApiReqStarted` say entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiReqInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ApiReqInfo {
    pub fn from_entry(entry: &DisplayEntry) -> Option<Self> {
        if !entry.is_say(SayKind::ApiReqStarted) {
            return None;
        }
        entry
            .text
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// An entry that never produced a chunk: no cost tallied and no recorded
    /// cancel reason.  Such entries are trimmed on resume.
    pub fn never_produced_output(&self) -> bool {
        self.cost.is_none() && self.cancel_reason.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    StreamingFailed,
}

/// The user's reply to a pending ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub kind: AskResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl AskResponse {
    pub fn approved() -> Self {
        Self {
            kind: AskResponseKind::Approved,
            text: None,
            images: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn rejected() -> Self {
        Self {
            kind: AskResponseKind::Rejected,
            text: None,
            images: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: AskResponseKind::Message,
            text: Some(text.into()),
            images: Vec::new(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponseKind {
    Approved,
    Rejected,
    /// Free-form feedback; for tool asks this counts as a rejection with an
    /// attached explanation.
    Message,
}

/// How the ask rendezvous resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    Resolved(AskResponse),
    /// A newer message superseded this ask while it was pending; the caller
    /// was racing a prior stream and should unwind quietly.
    Ignored,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
