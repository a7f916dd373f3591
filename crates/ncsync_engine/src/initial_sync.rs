//! Tracking of the initial bulk synchronization after startup.
//!
//! Until every peer has completed at least one session on every slot it
//! shares with this server, the server is in the initial-sync phase.

use ncsync_protocol::ServerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Counts slots per peer that have not been synced since startup.
#[derive(Debug)]
pub struct InitialSyncTracker {
    pending: Mutex<HashMap<ServerId, usize>>,
    complete: AtomicBool,
}

impl InitialSyncTracker {
    /// Creates a tracker from the number of shared slots per peer.
    ///
    /// Peers sharing no slots are ignored. With no such peer at all the
    /// server is initially synced right away.
    pub fn new(slots_per_peer: impl IntoIterator<Item = (ServerId, usize)>) -> Self {
        let pending: HashMap<_, _> = slots_per_peer
            .into_iter()
            .filter(|(_, slots)| *slots > 0)
            .collect();
        let complete = pending.is_empty();
        Self {
            pending: Mutex::new(pending),
            complete: AtomicBool::new(complete),
        }
    }

    /// Returns true while some peer still has slots to sync initially.
    pub fn has_servers_for_init_sync(&self) -> bool {
        !self.complete.load(Ordering::Acquire)
    }

    /// Returns true once all peers completed their initial sync.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Returns the number of peers still in the initial phase.
    pub fn servers_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Records the first successful session of one (slot, peer) pair.
    pub fn slot_synced(&self, server_id: ServerId) {
        let mut pending = self.pending.lock();
        if let Some(left) = pending.get_mut(&server_id) {
            *left = left.saturating_sub(1);
            if *left == 0 {
                pending.remove(&server_id);
                info!(server_id, "peer completed initial sync");
            }
        }
        if pending.is_empty() && !self.complete.swap(true, Ordering::AcqRel) {
            info!("initial sync complete");
        }
    }
}
