// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The append-only display log.
//!
//! Mutations are serialised through the owning driver.  Every entry gets a
//! unique, strictly increasing `ts` at append time and keeps it forever —
//! in-place updates patch content, never identity.  Partial chunks are
//! broadcast to the UI on every update but written to disk only at each
//! partial→complete transition, an intentional I/O reduction: a crash
//! replays from the last whole message.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use stig_model::ModelInfo;

use crate::events::EngineEvent;
use crate::message::{ApiReqInfo, AskKind, DisplayEntry, EntryKind, SayKind};
use crate::persist::TaskStore;

/// Context stamped onto every appended entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryMeta {
    pub conversation_history_index: usize,
    pub deleted_range: Option<(usize, usize)>,
}

/// State reconstructed from the entry that a restore truncated at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestorePoint {
    pub conversation_history_index: usize,
    pub deleted_range: Option<(usize, usize)>,
}

pub struct MessageLog {
    entries: Vec<DisplayEntry>,
    last_ts: u64,
    model_info: Option<ModelInfo>,
    events: mpsc::Sender<EngineEvent>,
    store: Option<Arc<TaskStore>>,
}

impl MessageLog {
    pub fn new(events: mpsc::Sender<EngineEvent>, store: Option<Arc<TaskStore>>) -> Self {
        Self {
            entries: Vec::new(),
            last_ts: 0,
            model_info: None,
            events,
            store,
        }
    }

    /// Rebuild a log from persisted entries (resume path).
    pub fn from_entries(
        entries: Vec<DisplayEntry>,
        events: mpsc::Sender<EngineEvent>,
        store: Option<Arc<TaskStore>>,
    ) -> Self {
        let last_ts = entries.iter().map(|e| e.ts).max().unwrap_or(0);
        Self {
            entries,
            last_ts,
            model_info: None,
            events,
            store,
        }
    }

    pub fn set_model_info(&mut self, info: ModelInfo) {
        self.model_info = Some(info);
    }

    pub fn entries(&self) -> &[DisplayEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&DisplayEntry> {
        self.entries.last()
    }

    /// Unique, strictly increasing timestamp in milliseconds.  Appends in
    /// the same millisecond are disambiguated by bumping past the previous
    /// value — identity stability matters more than wall-clock accuracy.
    fn next_ts(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    async fn broadcast(&self, entry: &DisplayEntry) {
        let _ = self.events.send(EngineEvent::Message(entry.clone())).await;
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_display(&self.entries) {
                warn!("failed to persist display log: {e:#}");
            }
        }
    }

    fn push_entry(&mut self, mut entry: DisplayEntry) -> u64 {
        entry.ts = self.next_ts();
        entry.model_info = self.model_info.clone();
        let ts = entry.ts;
        self.entries.push(entry);
        ts
    }

    /// Append a say entry.  When `partial` is `Some`, the entry coalesces
    /// with a matching partial tail instead of appending (preserving its
    /// `ts`), and is persisted only once it completes.
    pub async fn say(
        &mut self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
        partial: Option<bool>,
        meta: EntryMeta,
    ) -> u64 {
        self.coalesce(EntryKind::Say, None, Some(kind), text, images, partial, meta)
            .await
    }

    /// Append an ask entry, with the same coalescing rules as [`say`].
    /// Returns `(ts, updated_in_place)`.
    pub async fn ask(
        &mut self,
        kind: AskKind,
        text: Option<String>,
        partial: Option<bool>,
        meta: EntryMeta,
    ) -> (u64, bool) {
        let tail_matches = self
            .entries
            .last()
            .map(|e| e.partial && e.same_subtype(EntryKind::Ask, Some(kind), None))
            .unwrap_or(false);
        let ts = self
            .coalesce(EntryKind::Ask, Some(kind), None, text, Vec::new(), partial, meta)
            .await;
        (ts, partial.is_some() && tail_matches)
    }

    async fn coalesce(
        &mut self,
        kind: EntryKind,
        ask: Option<AskKind>,
        say: Option<SayKind>,
        text: Option<String>,
        images: Vec<String>,
        partial: Option<bool>,
        meta: EntryMeta,
    ) -> u64 {
        let incoming_partial = partial.unwrap_or(false);
        if partial.is_some() {
            let tail_matches = self
                .entries
                .last()
                .map(|e| e.partial && e.same_subtype(kind, ask, say))
                .unwrap_or(false);
            if tail_matches {
                // Update in place: ts is preserved, content replaced.
                let completing = !incoming_partial;
                let entry = self.entries.last_mut().expect("tail checked above");
                entry.text = text;
                entry.images = images;
                entry.partial = incoming_partial;
                let snapshot = entry.clone();
                self.broadcast(&snapshot).await;
                if completing {
                    self.persist();
                }
                return snapshot.ts;
            }
        }
        let entry = DisplayEntry {
            ts: 0, // assigned in push_entry
            kind,
            ask,
            say,
            text,
            images,
            files: Vec::new(),
            partial: incoming_partial,
            conversation_history_index: meta.conversation_history_index,
            deleted_range_snapshot: meta.deleted_range,
            checkpoint_hash: None,
            model_info: None,
        };
        let ts = self.push_entry(entry);
        let snapshot = self.entries.last().expect("just pushed").clone();
        self.broadcast(&snapshot).await;
        if !incoming_partial {
            self.persist();
        }
        ts
    }

    /// Read back the bookkeeping JSON of an `ApiReqStarted` entry.
    pub fn api_req_info(&self, ts: u64) -> Option<ApiReqInfo> {
        self.entries
            .iter()
            .find(|e| e.ts == ts)
            .and_then(ApiReqInfo::from_entry)
    }

    /// Patch the bookkeeping JSON of an `ApiReqStarted` entry.  `ts` is
    /// never part of the patch.
    pub async fn update_api_req(&mut self, ts: u64, info: &ApiReqInfo) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.ts == ts) else {
            warn!(ts, "no api request entry to update");
            return;
        };
        if !entry.is_say(SayKind::ApiReqStarted) {
            warn!(ts, "entry is not an api request marker");
            return;
        }
        entry.text = Some(info.to_text());
        let snapshot = entry.clone();
        self.broadcast(&snapshot).await;
        self.persist();
    }

    /// Stamp a checkpoint hash onto a completed entry.
    pub async fn set_checkpoint_hash(&mut self, ts: u64, hash: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ts == ts) {
            entry.checkpoint_hash = Some(hash);
            let snapshot = entry.clone();
            self.broadcast(&snapshot).await;
            self.persist();
        }
    }

    /// Remove the tail iff it is a partial of the given subtype; used when a
    /// tool rejects a streamed edit.
    pub fn drop_last_partial_if(
        &mut self,
        kind: EntryKind,
        ask: Option<AskKind>,
        say: Option<SayKind>,
    ) -> bool {
        let matches = self
            .entries
            .last()
            .map(|e| e.partial && e.same_subtype(kind, ask, say))
            .unwrap_or(false);
        if matches {
            self.entries.pop();
        }
        matches
    }

    /// Truncate the log to the state before `ts` (the entry with `ts` and
    /// everything after it are removed).  Returns the transcript restore
    /// point snapshotted on the first removed entry.
    pub fn restore_to(&mut self, ts: u64) -> Option<RestorePoint> {
        let cut = self.entries.iter().position(|e| e.ts >= ts)?;
        let point = RestorePoint {
            conversation_history_index: self.entries[cut].conversation_history_index,
            deleted_range: self.entries[cut].deleted_range_snapshot,
        };
        self.entries.truncate(cut);
        self.persist();
        Some(point)
    }

    /// Count of partial entries for the given subtype — at most one may
    /// exist, and only at the tail.
    #[cfg(test)]
    pub fn partial_count(&self, kind: EntryKind, ask: Option<AskKind>, say: Option<SayKind>) -> usize {
        self.entries
            .iter()
            .filter(|e| e.partial && e.same_subtype(kind, ask, say))
            .count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
