// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window accounting: decides when the conversation must shrink and
//! maintains the masked interval of the transcript that is no longer sent
//! to the provider.

use serde::{Deserialize, Serialize};
use tracing::debug;

use stig_config::ContextConfig;
use stig_model::ApiMessage;

/// How much of the active window a truncation pass removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStrategy {
    /// Remove a quarter of the active messages — the context-window-exceeded
    /// recovery pass.
    RemoveQuarter,
    /// Remove half of the active messages.
    RemoveHalf,
}

/// Persisted part of the context manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    /// Inclusive index range inside the transcript masked out when sending
    /// to the provider.  Starts at 1: the initial user message at index 0 is
    /// always preserved.
    pub deleted_range: Option<(usize, usize)>,
    /// Transcript index of the request that triggered the most recent
    /// compaction; prevents re-triggering on the same request.
    pub last_auto_compact_trigger_index: Option<usize>,
}

#[derive(Debug)]
pub struct ContextManager {
    cfg: ContextConfig,
    pub state: ContextState,
    /// Set while a summarize-task call is in flight; consulted on the next
    /// turn to advance the masked range past the request/response pair.
    pub currently_summarizing: bool,
}

impl ContextManager {
    pub fn new(cfg: ContextConfig) -> Self {
        Self {
            cfg,
            state: ContextState::default(),
            currently_summarizing: false,
        }
    }

    pub fn with_state(cfg: ContextConfig, state: ContextState) -> Self {
        Self {
            cfg,
            state,
            currently_summarizing: false,
        }
    }

    pub fn deleted_range(&self) -> Option<(usize, usize)> {
        self.state.deleted_range
    }

    /// The transcript as the provider sees it: the first message, then
    /// everything after the masked range.
    pub fn effective_transcript(&self, transcript: &[ApiMessage]) -> Vec<ApiMessage> {
        match self.state.deleted_range {
            None => transcript.to_vec(),
            Some((_, end)) => {
                let mut out = Vec::with_capacity(transcript.len().saturating_sub(end));
                if let Some(first) = transcript.first() {
                    out.push(first.clone());
                }
                if end + 1 < transcript.len() {
                    out.extend_from_slice(&transcript[end + 1..]);
                }
                out
            }
        }
    }

    /// Number of messages the provider currently sees.
    pub fn active_message_count(&self, transcript_len: usize) -> usize {
        match self.state.deleted_range {
            None => transcript_len,
            Some((_, end)) => 1 + transcript_len.saturating_sub(end + 1),
        }
    }

    /// Whether token pressure calls for a summarization pass on this turn.
    ///
    /// `request_index` is the transcript length at request time; a request
    /// that already triggered compaction never re-triggers it.
    pub fn should_compact(
        &self,
        context_tokens: usize,
        context_window: usize,
        request_index: usize,
    ) -> bool {
        if !self.cfg.auto_condense || context_tokens == 0 {
            return false;
        }
        if self.state.last_auto_compact_trigger_index == Some(request_index) {
            return false;
        }
        let usable = context_window.saturating_sub(self.cfg.guard_band_tokens);
        if usable == 0 {
            return true;
        }
        (context_tokens as f32) >= (usable as f32) * self.cfg.compact_threshold_fraction
    }

    pub fn mark_compact_triggered(&mut self, request_index: usize) {
        self.state.last_auto_compact_trigger_index = Some(request_index);
    }

    /// Whether a further truncation would leave enough active messages to be
    /// worth doing; below the floor, the conversation is surfaced to the
    /// user for manual intervention instead.
    pub fn can_truncate(&self, transcript_len: usize) -> bool {
        self.active_message_count(transcript_len) > self.cfg.min_active_messages
    }

    /// Compute and apply the next masked range.
    ///
    /// The range always starts at 1 and its end lands on an even index so
    /// that the message following the mask is an assistant message — the
    /// provider sees a user turn followed by an assistant turn, preserving
    /// alternation.  Returns the new range, or `None` when nothing could be
    /// removed.
    pub fn truncate(
        &mut self,
        transcript_len: usize,
        strategy: TruncationStrategy,
    ) -> Option<(usize, usize)> {
        let current_end = self.state.deleted_range.map(|(_, e)| e).unwrap_or(0);
        let active = transcript_len.saturating_sub(current_end + 1);
        let mut to_remove = match strategy {
            TruncationStrategy::RemoveQuarter => active / 4,
            TruncationStrategy::RemoveHalf => active / 2,
        };
        // Removal happens in user/assistant pairs.
        to_remove -= to_remove % 2;
        if to_remove == 0 {
            return None;
        }
        let mut new_end = current_end + to_remove;
        if new_end % 2 != 0 {
            new_end -= 1;
        }
        if new_end <= current_end || new_end >= transcript_len {
            return None;
        }
        let range = (1, new_end);
        debug!(?range, transcript_len, "advancing masked transcript range");
        self.state.deleted_range = Some(range);
        Some(range)
    }

    /// After a summarization round-trip, advance the mask past the
    /// summarize request/response pair.  The advance requires the candidate
    /// end to stay strictly inside the transcript (`end + 2 ≤ len − 1`);
    /// otherwise it is silently skipped and retried on a later turn.
    pub fn advance_past_summary(&mut self, transcript_len: usize) {
        let end = self.state.deleted_range.map(|(_, e)| e).unwrap_or(0);
        if transcript_len == 0 {
            return;
        }
        if end + 2 <= transcript_len - 1 {
            self.state.deleted_range = Some((1, end + 2));
            debug!(end = end + 2, "masked summarized request/response pair");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use stig_model::ApiMessage;

    use super::*;

    fn manager() -> ContextManager {
        ContextManager::new(ContextConfig::default())
    }

    fn transcript(n: usize) -> Vec<ApiMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ApiMessage::user_text(format!("u{i}"))
                } else {
                    ApiMessage::assistant(vec![stig_model::ContentBlock::text(format!("a{i}"))])
                }
            })
            .collect()
    }

    // ── Effective transcript ─────────────────────────────────────────────────

    #[test]
    fn no_range_passes_transcript_through() {
        let m = manager();
        let t = transcript(4);
        assert_eq!(m.effective_transcript(&t), t);
    }

    #[test]
    fn masked_range_keeps_first_and_tail() {
        let mut m = manager();
        m.state.deleted_range = Some((1, 4));
        let t = transcript(8);
        let eff = m.effective_transcript(&t);
        assert_eq!(eff.len(), 4); // index 0 plus indices 5..8
        assert_eq!(eff[0], t[0]);
        assert_eq!(eff[1], t[5]);
    }

    #[test]
    fn first_message_is_always_preserved() {
        let mut m = manager();
        m.state.deleted_range = Some((1, 6));
        let t = transcript(8);
        let eff = m.effective_transcript(&t);
        assert_eq!(eff[0].text(), "u0");
    }

    // ── Compaction trigger ───────────────────────────────────────────────────

    #[test]
    fn under_threshold_does_not_compact() {
        let m = manager();
        // usable = 200k - 27k = 173k; threshold 0.75 → 129 750
        assert!(!m.should_compact(100_000, 200_000, 5));
    }

    #[test]
    fn over_threshold_compacts() {
        let m = manager();
        assert!(m.should_compact(150_000, 200_000, 5));
    }

    #[test]
    fn same_request_index_does_not_retrigger() {
        let mut m = manager();
        assert!(m.should_compact(150_000, 200_000, 5));
        m.mark_compact_triggered(5);
        assert!(!m.should_compact(150_000, 200_000, 5));
        assert!(m.should_compact(150_000, 200_000, 7));
    }

    #[test]
    fn auto_condense_off_never_compacts() {
        let cfg = ContextConfig {
            auto_condense: false,
            ..Default::default()
        };
        let m = ContextManager::new(cfg);
        assert!(!m.should_compact(999_999, 200_000, 1));
    }

    // ── Truncation ───────────────────────────────────────────────────────────

    #[test]
    fn truncate_removes_quarter_in_pairs() {
        let mut m = manager();
        // 17 messages, none masked: active after index 0 = 16; quarter = 4.
        let range = m.truncate(17, TruncationStrategy::RemoveQuarter).unwrap();
        assert_eq!(range, (1, 4));
    }

    #[test]
    fn truncate_half_removes_more() {
        let mut m = manager();
        let range = m.truncate(17, TruncationStrategy::RemoveHalf).unwrap();
        assert_eq!(range, (1, 8));
    }

    #[test]
    fn truncate_advances_an_existing_range() {
        let mut m = manager();
        m.state.deleted_range = Some((1, 4));
        // active = 17 - 5 = 12; half = 6 → new end 10.
        let range = m.truncate(17, TruncationStrategy::RemoveHalf).unwrap();
        assert_eq!(range, (1, 10));
    }

    #[test]
    fn truncate_end_is_even_for_alternation() {
        let mut m = manager();
        for len in [9usize, 11, 13, 21, 33] {
            m.state.deleted_range = None;
            if let Some((_, end)) = m.truncate(len, TruncationStrategy::RemoveHalf) {
                assert_eq!(end % 2, 0, "odd range end for len {len}");
            }
        }
    }

    #[test]
    fn truncate_tiny_transcript_is_noop() {
        let mut m = manager();
        assert!(m.truncate(3, TruncationStrategy::RemoveQuarter).is_none());
        assert!(m.deleted_range().is_none());
    }

    // ── Summary advance ──────────────────────────────────────────────────────

    #[test]
    fn advance_skips_when_candidate_reaches_transcript_end() {
        let mut m = manager();
        // end+2 = 2; len-1 = 2 → equal, advance happens.
        m.advance_past_summary(3);
        assert_eq!(m.deleted_range(), Some((1, 2)));

        // end+2 = 4; len-1 = 3 → greater, silently skipped.
        let mut m2 = manager();
        m2.state.deleted_range = Some((1, 2));
        m2.advance_past_summary(4);
        assert_eq!(m2.deleted_range(), Some((1, 2)));
    }

    #[test]
    fn advance_moves_past_summary_pair() {
        let mut m = manager();
        m.state.deleted_range = Some((1, 2));
        m.advance_past_summary(8);
        assert_eq!(m.deleted_range(), Some((1, 4)));
    }

    // ── Active message floor ─────────────────────────────────────────────────

    #[test]
    fn can_truncate_respects_floor() {
        let mut m = manager();
        assert!(m.can_truncate(10));
        m.state.deleted_range = Some((1, 6));
        // Active = 1 + (10 - 7) = 4 > 3.
        assert!(m.can_truncate(10));
        m.state.deleted_range = Some((1, 8));
        // Active = 1 + (10 - 9) = 2 ≤ 3.
        assert!(!m.can_truncate(10));
    }

    #[test]
    fn context_state_round_trips() {
        let s = ContextState {
            deleted_range: Some((1, 6)),
            last_auto_compact_trigger_index: Some(9),
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: ContextState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
