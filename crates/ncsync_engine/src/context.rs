//! State shared by the arbiter, the sync drivers and the log compactor.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::initial_sync::InitialSyncTracker;
use crate::oplog::OperationLog;
use crate::registry::SlotRegistry;
use crate::report::SessionReportLog;
use crate::stats::SyncStats;
use crate::storage::BlobStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Everything one server's sync components share.
pub struct SyncContext {
    /// Engine configuration.
    pub config: SyncConfig,
    /// Slots and pairs.
    pub registry: SlotRegistry,
    /// Operation log.
    pub oplog: Arc<dyn OperationLog>,
    /// Blob storage.
    pub storage: Arc<dyn BlobStorage>,
    /// Counters.
    pub stats: SyncStats,
    /// Initial-sync progress.
    pub initial_sync: InitialSyncTracker,
    /// Finished-session records.
    pub reports: SessionReportLog,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    compactor_wake: Notify,
}

impl SyncContext {
    /// Builds the context. Peers must already be registered in `registry`.
    pub fn new(
        config: SyncConfig,
        registry: SlotRegistry,
        oplog: Arc<dyn OperationLog>,
        storage: Arc<dyn BlobStorage>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let reports = SessionReportLog::open(config.report_path.as_deref())?;
        let initial_sync = InitialSyncTracker::new(registry.slots_per_peer());
        Ok(Self {
            config,
            registry,
            oplog,
            storage,
            stats: SyncStats::new(),
            initial_sync,
            reports,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            compactor_wake: Notify::new(),
        })
    }

    /// Returns true once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Starts shutdown and wakes every waiting worker.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        self.compactor_wake.notify_one();
    }

    /// Resolves once shutdown has begun.
    pub async fn shutdown_signalled(&self) {
        let notified = self.shutdown_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Wakes the compactor early.
    pub fn wake_compactor(&self) {
        self.compactor_wake.notify_one();
    }

    pub(crate) async fn compactor_woken(&self) {
        self.compactor_wake.notified().await;
    }
}
