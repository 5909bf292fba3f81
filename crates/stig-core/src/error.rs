// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Raised from every suspension point once the task's abort flag is set.
///
/// `Abandoned` is the stronger form: the driver has given up waiting, so
/// graceful-abort side effects (interruption markers, final persistence)
/// must be suppressed — stray late work no-ops instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskAbort {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task was abandoned")]
    Abandoned,
}
