//! Operation-log compaction.
//!
//! The compactor visits one slot per tick. A slot with no running session
//! is cleaned right away. A slot whose log grew past its bound while
//! sessions are running gets `clean_required`, which blocks new sessions
//! and aborts running ones; the last session to stop wakes the compactor.

use crate::context::SyncContext;
use crate::registry::SlotSyncState;
use ncsync_protocol::SlotId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// What a single compactor tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorStep {
    /// The cursor wrapped around; nothing was examined.
    RoundComplete,
    /// The slot log was cleaned.
    Cleaned {
        /// Slot cleaned.
        slot: SlotId,
        /// Bytes reclaimed.
        bytes: u64,
    },
    /// A deferred clean was requested for the slot.
    Deferred {
        /// Slot marked.
        slot: SlotId,
    },
    /// Nothing to do for the slot.
    Skipped {
        /// Slot examined.
        slot: SlotId,
    },
}

/// Round-robin cleaner of per-slot operation logs.
pub struct LogCompactor {
    ctx: Arc<SyncContext>,
    slots: Vec<Arc<SlotSyncState>>,
    cursor: usize,
    last_forced: HashMap<SlotId, Instant>,
}

impl LogCompactor {
    /// Creates a compactor. Its first tick only arms the cursor.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let slots = ctx.registry.scan_order();
        let cursor = slots.len();
        Self {
            ctx,
            slots,
            cursor,
            last_forced: HashMap::new(),
        }
    }

    /// Examines the next slot.
    pub fn tick(&mut self) -> CompactorStep {
        let Some(slot_state) = self.slots.get(self.cursor).cloned() else {
            self.cursor = 0;
            return CompactorStep::RoundComplete;
        };
        self.cursor += 1;
        let slot = slot_state.slot();
        let ctx = &self.ctx;

        let mut guard = slot_state.lock();
        if guard.active_sync_count == 0 {
            guard.is_cleaning = true;
            drop(guard);

            let bytes = ctx.oplog.clean(slot);
            ctx.stats.record_clean(bytes);

            let mut guard = slot_state.lock();
            guard.is_cleaning = false;
            if guard.clean_required {
                guard.clean_required = false;
                self.last_forced.insert(slot, Instant::now());
                info!(slot, bytes, "forced log clean done");
            } else {
                debug!(slot, bytes, "log cleaned");
            }
            return CompactorStep::Cleaned { slot, bytes };
        }

        if !guard.clean_required
            && !ctx.initial_sync.has_servers_for_init_sync()
            && ctx.oplog.is_over_limit(slot)
            && self
                .last_forced
                .get(&slot)
                .map_or(true, |at| at.elapsed() >= ctx.config.min_forced_clean_period)
        {
            guard.clean_required = true;
            ctx.stats.record_forced_clean();
            info!(
                slot,
                active = guard.active_sync_count,
                "log over limit, clean deferred until sessions stop"
            );
            return CompactorStep::Deferred { slot };
        }
        CompactorStep::Skipped { slot }
    }

    /// Runs until shutdown, pausing between rounds.
    pub async fn run(mut self) {
        let ctx = Arc::clone(&self.ctx);
        while !ctx.is_shutting_down() {
            match self.tick() {
                CompactorStep::RoundComplete => {
                    tokio::select! {
                        _ = sleep(ctx.config.clean_attempt_interval) => {}
                        _ = ctx.compactor_woken() => {}
                        _ = ctx.shutdown_signalled() => {}
                    }
                }
                _ => tokio::task::yield_now().await,
            }
        }
        debug!("log compactor stopped");
    }
}
