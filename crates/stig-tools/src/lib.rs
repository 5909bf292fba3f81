// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod approval;
pub mod executor;
pub mod ignore;
pub mod kind;

pub use approval::AutoApprovalController;
pub use executor::{StaticExecutor, ToolContext, ToolExecutor, ToolOutcome};
pub use ignore::IgnoreController;
pub use kind::{ParamName, ToolKind, ToolUseBlock};
