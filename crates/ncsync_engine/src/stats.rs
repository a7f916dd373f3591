//! Synchronization statistics.
//!
//! All counters are atomic and can be read while workers are running.
//!
//! ```rust,ignore
//! let stats = node.context().stats.snapshot();
//! println!("committed: {}", stats.sessions_committed);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all sync components of one server.
#[derive(Debug, Default)]
pub struct SyncStats {
    // Session counters
    /// Sessions started by the local driver.
    active_started: AtomicU64,
    /// Sessions started on request of a peer.
    passive_started: AtomicU64,
    /// Sessions that ended with a commit.
    committed: AtomicU64,
    /// Sessions that ended with a cancel.
    cancelled: AtomicU64,
    /// Passive sessions replaced by a fresh request from the same peer.
    superseded: AtomicU64,
    /// Passive sessions reclaimed after the peer went silent.
    stale_reclaimed: AtomicU64,

    // Operation counters
    /// Sync operations performed in committed sessions.
    ops_committed: AtomicU64,
    /// Sync operations performed in failed sessions.
    ops_failed: AtomicU64,

    // Arbitration counters
    /// Claims rejected because of a cross-sync.
    cross_synced: AtomicU64,
    /// Claims rejected because the pair or slot was busy.
    busy: AtomicU64,

    // Compaction counters
    /// Operation-log cleans performed.
    log_cleans: AtomicU64,
    /// Bytes reclaimed by cleans.
    bytes_reclaimed: AtomicU64,
    /// Deferred cleans requested for oversized logs.
    forced_cleans: AtomicU64,
}

impl SyncStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_session_start(&self, is_passive: bool) {
        if is_passive {
            self.passive_started.fetch_add(1, Ordering::Relaxed);
        } else {
            self.active_started.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_session_finished(&self, ops: u64, success: bool) {
        if success {
            self.committed.fetch_add(1, Ordering::Relaxed);
            self.ops_committed.fetch_add(ops, Ordering::Relaxed);
        } else {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            self.ops_failed.fetch_add(ops, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_reclaimed(&self) {
        self.stale_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cross_synced(&self) {
        self.cross_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clean(&self, bytes: u64) {
        self.log_cleans.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_forced_clean(&self) {
        self.forced_cleans.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of sessions ended with a commit.
    pub fn sessions_committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions ended with a cancel.
    pub fn sessions_cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns the number of operation-log cleans.
    pub fn log_cleans(&self) -> u64 {
        self.log_cleans.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_sessions_started: self.active_started.load(Ordering::Relaxed),
            passive_sessions_started: self.passive_started.load(Ordering::Relaxed),
            sessions_committed: self.committed.load(Ordering::Relaxed),
            sessions_cancelled: self.cancelled.load(Ordering::Relaxed),
            sessions_superseded: self.superseded.load(Ordering::Relaxed),
            stale_sessions_reclaimed: self.stale_reclaimed.load(Ordering::Relaxed),
            ops_in_committed_sessions: self.ops_committed.load(Ordering::Relaxed),
            ops_in_failed_sessions: self.ops_failed.load(Ordering::Relaxed),
            cross_sync_rejections: self.cross_synced.load(Ordering::Relaxed),
            busy_rejections: self.busy.load(Ordering::Relaxed),
            log_cleans: self.log_cleans.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            forced_cleans_requested: self.forced_cleans.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Sessions started by the local driver.
    pub active_sessions_started: u64,
    /// Sessions started on request of a peer.
    pub passive_sessions_started: u64,
    /// Sessions that ended with a commit.
    pub sessions_committed: u64,
    /// Sessions that ended with a cancel.
    pub sessions_cancelled: u64,
    /// Passive sessions replaced by a fresh request.
    pub sessions_superseded: u64,
    /// Passive sessions reclaimed after the peer went silent.
    pub stale_sessions_reclaimed: u64,
    /// Sync operations performed in committed sessions.
    pub ops_in_committed_sessions: u64,
    /// Sync operations performed in failed sessions.
    pub ops_in_failed_sessions: u64,
    /// Claims rejected because of a cross-sync.
    pub cross_sync_rejections: u64,
    /// Claims rejected because the pair or slot was busy.
    pub busy_rejections: u64,
    /// Operation-log cleans performed.
    pub log_cleans: u64,
    /// Bytes reclaimed by cleans.
    pub bytes_reclaimed: u64,
    /// Deferred cleans requested for oversized logs.
    pub forced_cleans_requested: u64,
}
