// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod checkpoint;
pub mod context;
pub mod decoder;
pub mod driver;
pub mod environment;
pub mod error;
pub mod events;
pub mod focus_chain;
pub mod log;
pub mod message;
pub mod parser;
pub mod persist;
mod presenter;
pub mod state;

pub use checkpoint::{CheckpointManager, NoopCheckpoints, RestoreMode};
pub use context::{ContextManager, ContextState, TruncationStrategy};
pub use decoder::StreamDecoder;
pub use driver::{Task, TaskOptions, TaskOutcome};
pub use environment::{
    build_environment_details, EnvironmentProvider, EnvironmentSnapshot, StaticEnvironment,
    TerminalSnapshot,
};
pub use error::TaskAbort;
pub use events::EngineEvent;
pub use focus_chain::FocusChain;
pub use log::{EntryMeta, MessageLog, RestorePoint};
pub use message::{
    ApiReqInfo, AskKind, AskOutcome, AskResponse, AskResponseKind, CancelReason, DisplayEntry,
    EntryKind, SayKind,
};
pub use parser::{clean_text_for_display, parse_assistant_message, AssistantBlock, TextBlock};
pub use persist::{list_tasks, reconcile_transcript_tail, trim_for_resume, TaskStore};
pub use state::{TaskHandle, TaskState};
