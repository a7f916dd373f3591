//! Session arbitration.
//!
//! [`SyncArbiter`] is called by the inbound request layer on behalf of a
//! remote peer. The claim and release helpers at the bottom of this module
//! are shared with the sync driver, so both directions go through the same
//! check-and-set under the slot lock followed by the pair lock.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::registry::{PeerState, PeerSyncState, SlotState, SlotSyncState};
use ncsync_protocol::{RecNo, ReducedEvents, ServerId, SlotId, SyncId, SyncMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A granted passive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiation {
    /// Generation of the new session.
    pub sync_id: SyncId,
    /// How the session will reconcile the slot.
    pub mode: SyncMode,
    /// Local events for the peer, empty in blob-list mode.
    pub events: ReducedEvents,
}

/// Entry points for sessions initiated by a peer.
#[derive(Clone)]
pub struct SyncArbiter {
    ctx: Arc<SyncContext>,
}

impl SyncArbiter {
    /// Creates an arbiter over `ctx`.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Claims `(slot, server_id)` for a passive session.
    ///
    /// `local_start` and `remote_start` are the watermarks the peer reported,
    /// already translated to our point of view.
    pub fn initiate(
        &self,
        server_id: ServerId,
        slot: SlotId,
        local_start: RecNo,
        remote_start: RecNo,
    ) -> SyncResult<Initiation> {
        let ctx = &self.ctx;
        let Some((slot_state, peer_state)) = ctx.registry.find_peer_state(server_id, slot) else {
            debug!(server_id, slot, "sync request for unknown pair");
            return Err(SyncError::Busy);
        };
        peer_state.peer().register_conn_success();

        if ctx.is_shutting_down() {
            return Err(SyncError::Busy);
        }
        if ctx.initial_sync.has_servers_for_init_sync() {
            let slot_guard = slot_state.lock();
            let peer_guard = peer_state.lock();
            if peer_guard.completed_full_sync_once || slot_guard.active_sync_count != 0 {
                ctx.stats.record_busy();
                return Err(SyncError::Busy);
            }
        }

        let sync_id = start_session(ctx, &slot_state, &peer_state, true)?;

        let (events, found) = ctx
            .oplog
            .get_events_list(server_id, slot, local_start, remote_start);
        let log_empty = ctx.oplog.log_size(slot) == 0;

        let _slot_guard = slot_state.lock();
        let mut peer_guard = peer_state.lock();
        let by_events = found || (log_empty && peer_guard.completed_blob_sync);
        if peer_guard.sync_in_progress && peer_guard.sync_generation == sync_id {
            peer_guard.used_blob_list_mode = !by_events;
        }
        let mode = if by_events {
            SyncMode::Events
        } else {
            SyncMode::Blobs
        };
        debug!(server_id, slot, sync_id, %mode, "passive sync started");
        Ok(Initiation {
            sync_id,
            mode,
            events: if by_events {
                events
            } else {
                ReducedEvents::new()
            },
        })
    }

    /// Admits one more command of the running passive session.
    ///
    /// Fails as busy if a clean is pending and `allow_abort` is set, and
    /// with a network error if no passive session is running.
    pub fn can_start_sync_command(
        &self,
        server_id: ServerId,
        slot: SlotId,
        allow_abort: bool,
    ) -> SyncResult<SyncId> {
        let Some((slot_state, peer_state)) = self.ctx.registry.find_peer_state(server_id, slot)
        else {
            return Err(SyncError::network("unknown pair"));
        };
        let slot_guard = slot_state.lock();
        if slot_guard.clean_required && allow_abort {
            return Err(SyncError::Busy);
        }
        let mut peer_guard = peer_state.lock();
        if !peer_guard.sync_in_progress || !peer_guard.is_passive {
            return Err(SyncError::network("no passive session"));
        }
        peer_guard.active_task_count += 1;
        peer_guard.ops_in_session += 1;
        Ok(peer_guard.sync_generation)
    }

    /// Records that the passive session fell back to blob-list mode.
    pub fn mark_blob_list_mode(&self, server_id: ServerId, slot: SlotId, sync_id: SyncId) {
        self.with_passive_session(server_id, slot, sync_id, |_, _, peer| {
            peer.used_blob_list_mode = true;
        });
    }

    /// Records the end of one command of the passive session.
    pub fn command_finished(&self, server_id: ServerId, slot: SlotId, sync_id: SyncId) {
        self.with_passive_session(server_id, slot, sync_id, |_, _, peer| {
            if peer.active_task_count == 0 {
                warn!(server_id, slot, "command finished with no command running");
                return;
            }
            peer.active_task_count -= 1;
            if peer.active_task_count == 0 {
                peer.last_activity_time = Instant::now();
            }
        });
    }

    /// Commits the passive session `sync_id` and persists the watermarks.
    ///
    /// Returns false, changing nothing, if `sync_id` is not the running
    /// session.
    pub fn commit(
        &self,
        server_id: ServerId,
        slot: SlotId,
        sync_id: SyncId,
        local_synced: RecNo,
        remote_synced: RecNo,
    ) -> bool {
        let ctx = &self.ctx;
        self.with_passive_session(server_id, slot, sync_id, |slot_guard, peer_state, peer| {
            ctx.oplog
                .set_watermarks(server_id, slot, local_synced, remote_synced);
            ctx.storage.save_max_sync_rec_no();
            peer.ops_in_session = peer.ops_in_session.saturating_sub(1);
            commit_session(ctx, slot_guard, peer_state, peer);
        })
    }

    /// Cancels the passive session `sync_id`. The local driver may retry the
    /// pair after `retry_delay`, immediately if `None`.
    pub fn cancel(
        &self,
        server_id: ServerId,
        slot: SlotId,
        sync_id: SyncId,
        retry_delay: Option<Duration>,
    ) -> bool {
        let ctx = &self.ctx;
        self.with_passive_session(server_id, slot, sync_id, |slot_guard, peer_state, peer| {
            peer.ops_in_session = peer.ops_in_session.saturating_sub(1);
            cancel_session(
                ctx,
                slot_guard,
                peer_state,
                peer,
                retry_delay.unwrap_or(Duration::ZERO),
            );
        })
    }

    /// Runs `f` under both locks if `sync_id` is the running passive
    /// session of the pair.
    fn with_passive_session(
        &self,
        server_id: ServerId,
        slot: SlotId,
        sync_id: SyncId,
        f: impl FnOnce(&mut SlotState, &PeerSyncState, &mut PeerState),
    ) -> bool {
        let Some((slot_state, peer_state)) = self.ctx.registry.find_peer_state(server_id, slot)
        else {
            return false;
        };
        let mut slot_guard = slot_state.lock();
        let mut peer_guard = peer_state.lock();
        if !peer_guard.sync_in_progress
            || !peer_guard.is_passive
            || peer_guard.sync_generation != sync_id
        {
            debug!(server_id, slot, sync_id, "ignoring stale session command");
            return false;
        }
        f(&mut slot_guard, &peer_state, &mut peer_guard);
        true
    }
}

// === Claim and release, shared with the sync driver ===

/// Claims the pair for a new session and returns its generation.
pub(crate) fn start_session(
    ctx: &SyncContext,
    slot_state: &SlotSyncState,
    peer_state: &PeerSyncState,
    is_passive: bool,
) -> SyncResult<SyncId> {
    let server_id = peer_state.server_id();
    let slot = slot_state.slot();

    let mut slot_guard = slot_state.lock();
    if slot_guard.is_cleaning || slot_guard.clean_required {
        ctx.stats.record_busy();
        return Err(SyncError::Busy);
    }
    let mut peer = peer_state.lock();
    let mut superseded = false;
    if peer.sync_in_progress {
        if !(is_passive && peer.is_passive && peer.active_task_count == 0) {
            ctx.stats.record_cross_synced();
            return Err(SyncError::CrossSynced);
        }
        info!(
            server_id,
            slot,
            sync_id = peer.sync_generation,
            ops = peer.ops_in_session,
            "superseding idle passive session"
        );
        ctx.stats.record_superseded();
        ctx.stats.record_session_finished(peer.ops_in_session, false);
        peer_state.peer().register_sync_stop(true);
        superseded = true;
    }
    if !is_passive && !peer_state.peer().start_active_sync() {
        ctx.stats.record_busy();
        return Err(SyncError::Busy);
    }

    let now = Instant::now();
    peer.sync_in_progress = true;
    peer.is_passive = is_passive;
    peer.ops_in_session = 0;
    peer.active_task_count = u32::from(is_passive);
    peer.used_blob_list_mode = false;
    peer.last_activity_time = now;
    peer.sync_generation += 1;
    if !superseded {
        slot_guard.active_sync_count += 1;
    }
    ctx.stats.record_session_start(is_passive);
    Ok(peer.sync_generation)
}

/// Releases the pair and schedules the next local attempt.
fn stop_session(
    ctx: &SyncContext,
    slot: &mut SlotState,
    peer_state: &PeerSyncState,
    peer: &mut PeerState,
    next_delay: Duration,
) {
    peer_state.peer().register_sync_stop(peer.is_passive);
    peer.sync_in_progress = false;
    peer.active_task_count = 0;
    peer.next_retry_time = Instant::now() + next_delay;

    if slot.active_sync_count == 0 {
        warn!(
            server_id = peer_state.server_id(),
            "session stopped on a slot with no active sessions"
        );
    } else {
        slot.active_sync_count -= 1;
    }
    if slot.active_sync_count == 0 && slot.clean_required {
        ctx.wake_compactor();
    }
}

/// Ends the session as committed.
pub(crate) fn commit_session(
    ctx: &SyncContext,
    slot: &mut SlotState,
    peer_state: &PeerSyncState,
    peer: &mut PeerState,
) {
    ctx.stats.record_session_finished(peer.ops_in_session, true);
    if peer.used_blob_list_mode {
        peer.completed_blob_sync = true;
    }
    if !peer.completed_full_sync_once {
        peer.completed_full_sync_once = true;
        ctx.initial_sync.slot_synced(peer_state.server_id());
    }
    stop_session(
        ctx,
        slot,
        peer_state,
        peer,
        ctx.config.periodic_sync_interval,
    );
}

/// Ends the session as failed.
pub(crate) fn cancel_session(
    ctx: &SyncContext,
    slot: &mut SlotState,
    peer_state: &PeerSyncState,
    peer: &mut PeerState,
    retry_delay: Duration,
) {
    ctx.stats.record_session_finished(peer.ops_in_session, false);
    stop_session(ctx, slot, peer_state, peer, retry_delay);
}
