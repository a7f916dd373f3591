//! Lifecycle of one server's sync components.

use crate::arbiter::SyncArbiter;
use crate::compactor::LogCompactor;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::driver::SyncDriver;
use crate::error::SyncResult;
use crate::oplog::OperationLog;
use crate::registry::SlotRegistry;
use crate::stats::StatsSnapshot;
use crate::storage::BlobStorage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owns the sync drivers and the log compactor of one server.
pub struct SyncNode {
    ctx: Arc<SyncContext>,
    arbiter: SyncArbiter,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    /// Creates a node. Peers must already be registered in `registry`.
    pub fn new(
        config: SyncConfig,
        registry: SlotRegistry,
        oplog: Arc<dyn OperationLog>,
        storage: Arc<dyn BlobStorage>,
    ) -> SyncResult<Self> {
        let ctx = Arc::new(SyncContext::new(config, registry, oplog, storage)?);
        Ok(Self {
            arbiter: SyncArbiter::new(Arc::clone(&ctx)),
            ctx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Shared state of the node.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Entry points for peer-initiated sessions.
    pub fn arbiter(&self) -> &SyncArbiter {
        &self.arbiter
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Spawns the sync drivers and the compactor on the current runtime.
    /// Calling it again while workers run does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!(self_id = self.ctx.config.self_id, "sync node already started");
            return;
        }
        let count = self.ctx.config.active_sync_workers;
        for worker in 0..count {
            let driver = SyncDriver::new(Arc::clone(&self.ctx), worker);
            workers.push(tokio::spawn(driver.run()));
        }
        workers.push(tokio::spawn(LogCompactor::new(Arc::clone(&self.ctx)).run()));
        info!(
            self_id = self.ctx.config.self_id,
            slots = self.ctx.registry.len(),
            workers = count,
            "sync node started"
        );
    }

    /// Signals shutdown and waits for all workers to stop.
    pub async fn shutdown(&self) {
        self.ctx.begin_shutdown();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(%err, "sync worker failed");
            }
        }
        info!(self_id = self.ctx.config.self_id, "sync node stopped");
    }
}
