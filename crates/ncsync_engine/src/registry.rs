//! Registry of slots and of the peers sharing each slot.
//!
//! The registry is built once at startup and never changes shape. All
//! mutable sync state lives behind two levels of locks: one per slot and
//! one per (slot, peer) pair. When both are needed the slot lock is always
//! taken first.

use crate::error::{SyncError, SyncResult};
use crate::transport::PeerControl;
use ncsync_protocol::{ServerId, SlotId, SyncId};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

/// Mutable per-slot state, guarded by the slot lock.
#[derive(Default)]
pub struct SlotState {
    peers: BTreeMap<u16, Arc<PeerSyncState>>,
    /// Sessions (active or passive) currently running on this slot.
    pub active_sync_count: u32,
    /// Set while the operation log of this slot is being cleaned.
    pub is_cleaning: bool,
    /// A clean is pending until all sessions on this slot finish.
    pub clean_required: bool,
}

impl SlotState {
    /// Peers of this slot in their current iteration order.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<PeerSyncState>> {
        self.peers.values()
    }

    /// Copies the peer list so it can be walked without the slot lock.
    pub fn peers_snapshot(&self) -> Vec<Arc<PeerSyncState>> {
        self.peers.values().cloned().collect()
    }

    /// Moves the first peer to a new random position.
    pub fn reshuffle_first_peer(&mut self) {
        let Some((_, peer)) = self.peers.pop_first() else {
            return;
        };
        let key = unused_key(&self.peers);
        self.peers.insert(key, peer);
    }

    fn insert_peer(&mut self, peer: Arc<PeerSyncState>) {
        let key = unused_key(&self.peers);
        self.peers.insert(key, peer);
    }
}

/// One slot and its lock.
pub struct SlotSyncState {
    slot: SlotId,
    state: Mutex<SlotState>,
}

impl SlotSyncState {
    fn new(slot: SlotId) -> Self {
        Self {
            slot,
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Slot number.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Takes the slot lock.
    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }
}

/// Mutable per-pair state, guarded by the pair lock.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// A session (active or passive) is running.
    pub sync_in_progress: bool,
    /// The running session was initiated by the peer.
    pub is_passive: bool,
    /// Bumped on every session start; completions carrying an older value
    /// are ignored.
    pub sync_generation: SyncId,
    /// Commands of the current session still executing.
    pub active_task_count: u32,
    /// Sync operations performed in the current session.
    pub ops_in_session: u64,
    /// Earliest time the local driver may start the next session.
    pub next_retry_time: Instant,
    /// Last time a passive session made progress.
    pub last_activity_time: Instant,
    /// The current session fell back to blob-list comparison.
    pub used_blob_list_mode: bool,
    /// Some session on this pair completed in blob-list mode.
    pub completed_blob_sync: bool,
    /// Some session on this pair completed since startup.
    pub completed_full_sync_once: bool,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        Self {
            sync_in_progress: false,
            is_passive: false,
            sync_generation: 0,
            active_task_count: 0,
            ops_in_session: 0,
            next_retry_time: now,
            last_activity_time: now,
            used_blob_list_mode: false,
            completed_blob_sync: false,
            completed_full_sync_once: false,
        }
    }
}

/// One (slot, peer) pair and its lock.
pub struct PeerSyncState {
    peer: Arc<dyn PeerControl>,
    state: Mutex<PeerState>,
}

impl PeerSyncState {
    fn new(peer: Arc<dyn PeerControl>) -> Self {
        Self {
            peer,
            state: Mutex::new(PeerState::new(Instant::now())),
        }
    }

    /// Peer server id.
    pub fn server_id(&self) -> ServerId {
        self.peer.server_id()
    }

    /// The peer's control surface.
    pub fn peer(&self) -> &Arc<dyn PeerControl> {
        &self.peer
    }

    /// Takes the pair lock. Never call while holding another pair lock,
    /// and never take a slot lock while holding this one.
    pub fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock()
    }

    /// Earliest time a session with this peer is allowed, combining the
    /// local retry delay with connection backoff.
    pub fn next_due(&self, state: &PeerState) -> Instant {
        match self.peer.connection_backoff_until() {
            Some(backoff) => state.next_retry_time.max(backoff),
            None => state.next_retry_time,
        }
    }
}

/// All slots served by this server.
#[derive(Default)]
pub struct SlotRegistry {
    order: BTreeMap<u16, Arc<SlotSyncState>>,
    by_slot: HashMap<SlotId, Arc<SlotSyncState>>,
}

impl SlotRegistry {
    /// Creates a registry for `slots` in a random iteration order.
    pub fn new(slots: impl IntoIterator<Item = SlotId>) -> Self {
        let mut registry = Self::default();
        for slot in slots {
            if registry.by_slot.contains_key(&slot) {
                continue;
            }
            let state = Arc::new(SlotSyncState::new(slot));
            let key = unused_key(&registry.order);
            registry.order.insert(key, Arc::clone(&state));
            registry.by_slot.insert(slot, state);
        }
        registry
    }

    /// Registers `peer` as sharing every slot in `slots`.
    pub fn register_slots_for_peer(
        &mut self,
        peer: Arc<dyn PeerControl>,
        slots: &[SlotId],
    ) -> SyncResult<()> {
        for &slot in slots {
            let state = self.by_slot.get(&slot).ok_or(SyncError::UnknownPeerSlot {
                server_id: peer.server_id(),
                slot,
            })?;
            state
                .lock()
                .insert_peer(Arc::new(PeerSyncState::new(Arc::clone(&peer))));
        }
        Ok(())
    }

    /// Looks up the state of the pair `(slot, server_id)`.
    pub fn find_peer_state(
        &self,
        server_id: ServerId,
        slot: SlotId,
    ) -> Option<(Arc<SlotSyncState>, Arc<PeerSyncState>)> {
        let slot_state = self.by_slot.get(&slot)?;
        let peers = slot_state.lock().peers_snapshot();
        peers
            .into_iter()
            .find(|p| p.server_id() == server_id)
            .map(|p| (Arc::clone(slot_state), p))
    }

    /// Looks up one slot.
    pub fn slot(&self, slot: SlotId) -> Option<&Arc<SlotSyncState>> {
        self.by_slot.get(&slot)
    }

    /// Slots in their randomized scan order.
    pub fn scan_order(&self) -> Vec<Arc<SlotSyncState>> {
        self.order.values().cloned().collect()
    }

    /// Number of shared slots per peer.
    pub fn slots_per_peer(&self) -> HashMap<ServerId, usize> {
        let mut counts = HashMap::new();
        for slot in self.order.values() {
            for peer in slot.lock().peers() {
                *counts.entry(peer.server_id()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no slot is served.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn unused_key<V>(map: &BTreeMap<u16, V>) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let key: u16 = rng.gen();
        if !map.contains_key(&key) {
            return key;
        }
    }
}
