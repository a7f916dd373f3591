//! Per-session state shared between a sync driver and its connection.
//!
//! The driver owns the session and waits on it; connections hold an
//! `Arc<ActiveSession>` for every command they run and report back via
//! [`ActiveSession::cmd_finished`]. A late callback on a session the
//! driver already finished only touches the orphaned session object.

use ncsync_protocol::{
    ActionKind, BlobList, ReducedEvents, ServerId, SlotId, SyncId, SyncMode, SyncOutcome,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Success and failure counts per action kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounters {
    /// Blobs fetched from the peer.
    pub read_ok: u64,
    /// Failed fetches.
    pub read_err: u64,
    /// Blobs sent to the peer.
    pub write_ok: u64,
    /// Failed sends.
    pub write_err: u64,
    /// Lifetime extensions.
    pub prolong_ok: u64,
    /// Failed lifetime extensions.
    pub prolong_err: u64,
    /// Copies removed.
    pub remove_ok: u64,
    /// Failed removals.
    pub remove_err: u64,
}

impl ActionCounters {
    fn record(&mut self, action: ActionKind, ok: bool) {
        let (good, bad) = match action {
            ActionKind::None => return,
            ActionKind::Read => (&mut self.read_ok, &mut self.read_err),
            ActionKind::Write => (&mut self.write_ok, &mut self.write_err),
            ActionKind::Prolong => (&mut self.prolong_ok, &mut self.prolong_err),
            ActionKind::Remove => (&mut self.remove_ok, &mut self.remove_err),
        };
        if ok {
            *good += 1;
        } else {
            *bad += 1;
        }
    }

    /// Total number of recorded actions.
    pub fn total(&self) -> u64 {
        self.read_ok
            + self.read_err
            + self.write_ok
            + self.write_err
            + self.prolong_ok
            + self.prolong_err
            + self.remove_ok
            + self.remove_err
    }
}

#[derive(Debug)]
struct Progress {
    in_flight: usize,
    result: SyncOutcome,
    counters: ActionCounters,
    peer_mode: Option<SyncMode>,
    remote_events: ReducedEvents,
    remote_blobs: BlobList,
}

/// An active sync session as seen by its connection.
#[derive(Debug)]
pub struct ActiveSession {
    server_id: ServerId,
    slot: SlotId,
    sync_id: SyncId,
    started_at: Instant,
    progress: Mutex<Progress>,
    wake: Notify,
}

impl ActiveSession {
    /// Creates a session for `(slot, server_id)` with the given generation.
    pub fn new(server_id: ServerId, slot: SlotId, sync_id: SyncId) -> Self {
        Self {
            server_id,
            slot,
            sync_id,
            started_at: Instant::now(),
            progress: Mutex::new(Progress {
                in_flight: 0,
                result: SyncOutcome::Ok,
                counters: ActionCounters::default(),
                peer_mode: None,
                remote_events: ReducedEvents::new(),
                remote_blobs: BlobList::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Peer server of this session.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Slot being synced.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Local session generation.
    pub fn sync_id(&self) -> SyncId {
        self.sync_id
    }

    /// When the session was claimed.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    // === Connection callbacks ===

    /// Stores the peer's reply to a start command choosing event mode.
    pub fn reply_events(&self, events: ReducedEvents) {
        let mut progress = self.progress.lock();
        progress.peer_mode = Some(SyncMode::Events);
        progress.remote_events = events;
    }

    /// Stores the peer's reply to a start command choosing blob-list mode.
    pub fn reply_blobs(&self, blobs: BlobList) {
        let mut progress = self.progress.lock();
        progress.peer_mode = Some(SyncMode::Blobs);
        progress.remote_blobs = blobs;
    }

    /// Stores the peer's blob list requested after a failed event diff.
    pub fn blob_list_received(&self, blobs: BlobList) {
        self.progress.lock().remote_blobs = blobs;
    }

    /// Completes one outstanding command and wakes the driver.
    pub fn cmd_finished(&self, outcome: SyncOutcome, action: ActionKind) {
        // Any failed data transfer fails the session.
        let outcome = if action != ActionKind::None && !outcome.is_ok() {
            outcome.merge(SyncOutcome::NetworkError)
        } else {
            outcome
        };
        {
            let mut progress = self.progress.lock();
            progress.counters.record(action, outcome.is_ok());
            progress.result = progress.result.merge(outcome);
            if progress.in_flight == 0 {
                warn!(
                    server_id = self.server_id,
                    slot = self.slot,
                    "command finished with nothing in flight"
                );
            } else {
                progress.in_flight -= 1;
            }
        }
        self.wake.notify_one();
    }

    // === Driver side ===

    pub(crate) fn begin_command(&self) {
        self.progress.lock().in_flight += 1;
    }

    /// Number of commands still outstanding.
    pub fn in_flight(&self) -> usize {
        self.progress.lock().in_flight
    }

    /// Accumulated session result.
    pub fn result(&self) -> SyncOutcome {
        self.progress.lock().result
    }

    pub(crate) fn merge_result(&self, outcome: SyncOutcome) {
        let mut progress = self.progress.lock();
        progress.result = progress.result.merge(outcome);
    }

    /// Mode chosen by the peer in its start reply.
    pub fn peer_mode(&self) -> Option<SyncMode> {
        self.progress.lock().peer_mode
    }

    /// Action counters so far.
    pub fn counters(&self) -> ActionCounters {
        self.progress.lock().counters
    }

    pub(crate) fn take_remote_events(&self) -> ReducedEvents {
        std::mem::take(&mut self.progress.lock().remote_events)
    }

    pub(crate) fn take_remote_blobs(&self) -> BlobList {
        std::mem::take(&mut self.progress.lock().remote_blobs)
    }

    /// Waits until a callback arrives. Notifications sent while nobody
    /// waits are kept, so no completion is lost.
    pub(crate) async fn changed(&self) {
        self.wake.notified().await;
    }
}
