// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Coarse classification of a provider failure.  The task driver selects its
/// recovery policy from this kind alone, never from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Invalid or expired credentials — never auto-retried.
    Auth,
    /// Insufficient credits — never auto-retried.
    Balance,
    /// The request exceeded the model's context window.  Recovered once by
    /// aggressive truncation, then surfaced.
    ContextWindowExceeded,
    RateLimit,
    Other,
}

/// A tagged provider failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// HTTP status when the failure came from an HTTP response.
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ProviderErrorKind::RateLimit | ProviderErrorKind::Other
        );
        Self {
            kind,
            status: None,
            retryable,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn balance(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Balance, message)
    }

    pub fn context_window_exceeded(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ContextWindowExceeded, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    pub fn is_context_window_exceeded(&self) -> bool {
        self.kind == ProviderErrorKind::ContextWindowExceeded
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_balance_are_not_retryable() {
        assert!(!ProviderError::auth("bad key").retryable);
        assert!(!ProviderError::balance("no credits").retryable);
    }

    #[test]
    fn rate_limit_and_other_are_retryable() {
        assert!(ProviderError::rate_limit("429").retryable);
        assert!(ProviderError::other("boom").retryable);
    }

    #[test]
    fn context_window_kind_is_detected() {
        let e = ProviderError::context_window_exceeded("too long");
        assert!(e.is_context_window_exceeded());
        assert!(!e.retryable);
    }

    #[test]
    fn status_is_attached() {
        let e = ProviderError::rate_limit("slow down").with_status(429);
        assert_eq!(e.status, Some(429));
    }

    #[test]
    fn display_is_the_message() {
        let e = ProviderError::other("boom");
        assert_eq!(e.to_string(), "boom");
    }
}
