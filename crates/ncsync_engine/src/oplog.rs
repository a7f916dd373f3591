//! Operation log collaborator.
//!
//! The engine never inspects log records itself; it asks the log for diffs,
//! sizes and cleans through [`OperationLog`]. [`MemoryOpLog`] keeps
//! everything in memory and is used by the loopback cluster and the tests.

use ncsync_protocol::{
    BlobSummary, EventDiff, RecNo, ReducedEvents, ServerId, SlotId, SyncEvent,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// Access to the per-slot operation log and the sync watermarks.
pub trait OperationLog: Send + Sync {
    /// Reduced local events after `local_start` for the passive side of a
    /// session. The flag is false when the log no longer reaches back to
    /// `local_start`.
    fn get_events_list(
        &self,
        server_id: ServerId,
        slot: SlotId,
        local_start: RecNo,
        remote_start: RecNo,
    ) -> (ReducedEvents, bool);

    /// Diffs local events against the peer's reduced events.
    fn get_event_diff(
        &self,
        server_id: ServerId,
        slot: SlotId,
        local_start: RecNo,
        remote_start: RecNo,
        remote: &ReducedEvents,
    ) -> EventDiff;

    /// Number of records kept for `slot`.
    fn log_size(&self, slot: SlotId) -> u64;

    /// Highest record number assigned so far.
    fn current_rec_no(&self, slot: SlotId) -> RecNo;

    /// Returns true if `slot` holds more records than allowed.
    fn is_over_limit(&self, slot: SlotId) -> bool;

    /// Drops records no longer needed and returns the bytes reclaimed.
    fn clean(&self, slot: SlotId) -> u64;

    /// Stores the watermarks reached with `server_id` on `slot`.
    fn set_watermarks(&self, server_id: ServerId, slot: SlotId, local: RecNo, remote: RecNo);

    /// Watermarks reached with `server_id` on `slot`, `(0, 0)` if never synced.
    fn watermarks(&self, server_id: ServerId, slot: SlotId) -> (RecNo, RecNo);
}

/// Approximate bytes per record, used to report reclaimed space.
const RECORD_OVERHEAD: u64 = 64;

#[derive(Debug, Default)]
struct SlotLog {
    events: VecDeque<SyncEvent>,
    cleaned_up_to: RecNo,
}

#[derive(Debug, Default)]
struct LogState {
    last_rec_no: RecNo,
    slots: HashMap<SlotId, SlotLog>,
    watermarks: HashMap<(ServerId, SlotId), (RecNo, RecNo)>,
}

/// In-memory operation log.
#[derive(Debug)]
pub struct MemoryOpLog {
    self_id: ServerId,
    max_records_per_slot: usize,
    state: RwLock<LogState>,
}

impl MemoryOpLog {
    /// Creates an empty log owned by server `self_id`.
    pub fn new(self_id: ServerId, max_records_per_slot: usize) -> Self {
        Self {
            self_id,
            max_records_per_slot,
            state: RwLock::new(LogState::default()),
        }
    }

    /// Appends a local write of `key`.
    pub fn record_write(&self, slot: SlotId, key: &str, summary: BlobSummary) -> RecNo {
        self.append(SyncEvent::write(0, slot, key, self.self_id, summary))
    }

    /// Appends a local lifetime extension of `key`.
    pub fn record_prolong(&self, slot: SlotId, key: &str, summary: BlobSummary) -> RecNo {
        self.append(SyncEvent::prolong(0, slot, key, self.self_id, summary))
    }

    /// Appends a change received from `origin` during a sync.
    pub fn record_synced(&self, origin: ServerId, mut event: SyncEvent) -> RecNo {
        event.orig_server = origin;
        self.append(event)
    }

    fn append(&self, mut event: SyncEvent) -> RecNo {
        let mut state = self.state.write();
        state.last_rec_no += 1;
        let rec_no = state.last_rec_no;
        event.rec_no = rec_no;
        if event.orig_server == self.self_id {
            event.orig_rec_no = rec_no;
        }
        state.slots.entry(event.slot).or_default().events.push_back(event);
        rec_no
    }

    /// Reduces records after `start` that did not originate from `server_id`.
    fn reduced_since(log: &SlotLog, server_id: ServerId, start: RecNo) -> ReducedEvents {
        ReducedEvents::from_events(
            log.events
                .iter()
                .filter(|e| e.rec_no > start && e.orig_server != server_id),
        )
    }

    fn reaches_back(log: Option<&SlotLog>, start: RecNo) -> bool {
        start > 0 && log.map_or(0, |l| l.cleaned_up_to) <= start
    }
}

impl OperationLog for MemoryOpLog {
    fn get_events_list(
        &self,
        server_id: ServerId,
        slot: SlotId,
        local_start: RecNo,
        _remote_start: RecNo,
    ) -> (ReducedEvents, bool) {
        let state = self.state.read();
        let log = state.slots.get(&slot);
        if !Self::reaches_back(log, local_start) {
            return (ReducedEvents::new(), false);
        }
        let events = log
            .map(|l| Self::reduced_since(l, server_id, local_start))
            .unwrap_or_default();
        (events, true)
    }

    fn get_event_diff(
        &self,
        server_id: ServerId,
        slot: SlotId,
        local_start: RecNo,
        remote_start: RecNo,
        remote: &ReducedEvents,
    ) -> EventDiff {
        let state = self.state.read();
        let log = state.slots.get(&slot);
        if !Self::reaches_back(log, local_start) {
            return EventDiff::not_found();
        }
        let local = log
            .map(|l| Self::reduced_since(l, server_id, local_start))
            .unwrap_or_default();

        let mut diff = EventDiff {
            local_synced: state.last_rec_no,
            remote_synced: remote_start.max(remote.max_rec_no()),
            found: true,
            ..EventDiff::default()
        };

        for (key, ours) in local.iter() {
            let Some(theirs) = remote.get(key) else {
                diff.to_send.extend(ours.write.iter().chain(&ours.prolong).cloned());
                continue;
            };
            let (Some(mine), Some(other)) = (ours.latest(), theirs.latest()) else {
                continue;
            };
            if mine.summary.is_equal(&other.summary) {
                continue;
            }
            if mine.summary.is_older(&other.summary) {
                diff.to_fetch.extend(theirs.write.iter().chain(&theirs.prolong).cloned());
            } else {
                diff.to_send.extend(ours.write.iter().chain(&ours.prolong).cloned());
            }
        }
        for (key, theirs) in remote.iter() {
            if local.get(key).is_none() {
                diff.to_fetch.extend(theirs.write.iter().chain(&theirs.prolong).cloned());
            }
        }

        diff.to_send.sort_by_key(|e| e.rec_no);
        diff.to_fetch.sort_by_key(|e| e.rec_no);
        diff
    }

    fn log_size(&self, slot: SlotId) -> u64 {
        self.state
            .read()
            .slots
            .get(&slot)
            .map_or(0, |l| l.events.len() as u64)
    }

    fn current_rec_no(&self, _slot: SlotId) -> RecNo {
        self.state.read().last_rec_no
    }

    fn is_over_limit(&self, slot: SlotId) -> bool {
        self.log_size(slot) > self.max_records_per_slot as u64
    }

    fn clean(&self, slot: SlotId) -> u64 {
        let mut state = self.state.write();
        let acknowledged = state
            .watermarks
            .iter()
            .filter(|((_, s), _)| *s == slot)
            .map(|(_, (local, _))| *local)
            .min()
            .unwrap_or(0);
        let max_records = self.max_records_per_slot;
        let Some(log) = state.slots.get_mut(&slot) else {
            return 0;
        };

        let mut reclaimed = 0;
        while let Some(front) = log.events.front() {
            if front.rec_no > acknowledged && log.events.len() <= max_records {
                break;
            }
            let Some(event) = log.events.pop_front() else {
                break;
            };
            log.cleaned_up_to = log.cleaned_up_to.max(event.rec_no);
            reclaimed += event.key.len() as u64 + RECORD_OVERHEAD;
        }
        reclaimed
    }

    fn set_watermarks(&self, server_id: ServerId, slot: SlotId, local: RecNo, remote: RecNo) {
        self.state
            .write()
            .watermarks
            .insert((server_id, slot), (local, remote));
    }

    fn watermarks(&self, server_id: ServerId, slot: SlotId) -> (RecNo, RecNo) {
        self.state
            .read()
            .watermarks
            .get(&(server_id, slot))
            .copied()
            .unwrap_or((0, 0))
    }
}
