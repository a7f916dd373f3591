//! Operation-log events and event diffs.

use crate::blob::BlobSummary;
use crate::types::{RecNo, ServerId, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of change recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Blob content was written (or removed, which writes a tombstone).
    Write,
    /// Blob lifetime was extended without touching content.
    Prolong,
}

/// A single record of the operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Record number in the log of the server holding this event.
    pub rec_no: RecNo,
    /// Kind of change.
    pub event_type: EventType,
    /// Slot of the blob.
    pub slot: SlotId,
    /// Blob key.
    pub key: String,
    /// Server where the change originated.
    pub orig_server: ServerId,
    /// Record number on the originating server.
    pub orig_rec_no: RecNo,
    /// Time the event was recorded locally, in microseconds.
    pub local_time: u64,
    /// Summary of the blob version after the change.
    pub summary: BlobSummary,
}

impl SyncEvent {
    /// Creates a write event.
    pub fn write(
        rec_no: RecNo,
        slot: SlotId,
        key: impl Into<String>,
        orig_server: ServerId,
        summary: BlobSummary,
    ) -> Self {
        Self {
            rec_no,
            event_type: EventType::Write,
            slot,
            key: key.into(),
            orig_server,
            orig_rec_no: rec_no,
            local_time: summary.create_time,
            summary,
        }
    }

    /// Creates a prolong event.
    pub fn prolong(
        rec_no: RecNo,
        slot: SlotId,
        key: impl Into<String>,
        orig_server: ServerId,
        summary: BlobSummary,
    ) -> Self {
        Self {
            event_type: EventType::Prolong,
            ..Self::write(rec_no, slot, key, orig_server, summary)
        }
    }

    /// Returns true if this event changes blob content.
    pub fn is_write(&self) -> bool {
        self.event_type == EventType::Write
    }
}

/// The latest content change and the latest prolong of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEventPair {
    /// Latest write event for the key.
    pub write: Option<SyncEvent>,
    /// Latest prolong event for the key, if newer than the write.
    pub prolong: Option<SyncEvent>,
}

impl RemoteEventPair {
    /// Returns the most recent event of the pair.
    pub fn latest(&self) -> Option<&SyncEvent> {
        match (&self.write, &self.prolong) {
            (Some(w), Some(p)) => Some(if p.rec_no > w.rec_no { p } else { w }),
            (Some(w), None) => Some(w),
            (None, Some(p)) => Some(p),
            (None, None) => None,
        }
    }

    /// Returns the highest record number in the pair.
    pub fn max_rec_no(&self) -> RecNo {
        self.latest().map_or(0, |e| e.rec_no)
    }
}

/// Events of one slot reduced to at most one write and one prolong per key.
///
/// This is what a passive peer ships back in reply to a start-sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducedEvents {
    entries: BTreeMap<String, RemoteEventPair>,
}

impl ReducedEvents {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduces a sequence of events in log order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a SyncEvent>) -> Self {
        let mut reduced = Self::new();
        for event in events {
            reduced.push(event.clone());
        }
        reduced
    }

    /// Adds an event, replacing older events of the same kind for its key.
    ///
    /// A write supersedes any earlier prolong of the same key.
    pub fn push(&mut self, event: SyncEvent) {
        let pair = self.entries.entry(event.key.clone()).or_default();
        match event.event_type {
            EventType::Write => {
                if pair.prolong.as_ref().is_some_and(|p| p.rec_no < event.rec_no) {
                    pair.prolong = None;
                }
                pair.write = Some(event);
            }
            EventType::Prolong => pair.prolong = Some(event),
        }
    }

    /// Returns the pair recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&RemoteEventPair> {
        self.entries.get(key)
    }

    /// Iterates pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RemoteEventPair)> {
        self.entries.iter()
    }

    /// Returns the number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no events were recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the highest record number over all keys.
    pub fn max_rec_no(&self) -> RecNo {
        self.entries
            .values()
            .map(RemoteEventPair::max_rec_no)
            .max()
            .unwrap_or(0)
    }
}

/// Result of comparing local and remote event logs since the last sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDiff {
    /// Local events the peer is missing, in log order.
    pub to_send: Vec<SyncEvent>,
    /// Remote events we are missing, in log order.
    pub to_fetch: Vec<SyncEvent>,
    /// Local record number covered once the diff is applied.
    pub local_synced: RecNo,
    /// Remote record number covered once the diff is applied.
    pub remote_synced: RecNo,
    /// False when the log no longer reaches back to the watermark and
    /// the session has to fall back to blob-list comparison.
    pub found: bool,
}

impl EventDiff {
    /// A diff that signals a blob-list fallback.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Returns the number of transfers the diff implies.
    pub fn len(&self) -> usize {
        self.to_send.len() + self.to_fetch.len()
    }

    /// Returns true if nothing needs to be transferred.
    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty() && self.to_fetch.is_empty()
    }
}
