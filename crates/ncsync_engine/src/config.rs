//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use ncsync_protocol::ServerId;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for periodic synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Id of this server.
    pub self_id: ServerId,
    /// Delay before re-syncing a pair after a committed session. Also caps
    /// the wait between two scan rounds.
    pub periodic_sync_interval: Duration,
    /// Idle time after which a passive session with no running commands
    /// is considered abandoned by its peer.
    pub periodic_sync_timeout: Duration,
    /// Delay before retrying a pair after a cancelled session.
    pub failed_sync_retry_delay: Duration,
    /// Pause between two full compactor rounds.
    pub clean_attempt_interval: Duration,
    /// Minimum time between two forced cleans of the same slot.
    pub min_forced_clean_period: Duration,
    /// Number of sync driver workers.
    pub active_sync_workers: usize,
    /// Maximum number of outstanding tasks per session.
    pub max_pipelined_tasks: usize,
    /// Upper bound of the random wait used when a pair is already due.
    pub max_scan_jitter: Duration,
    /// File receiving one JSON line per finished active session.
    pub report_path: Option<PathBuf>,
}

impl SyncConfig {
    /// Creates a configuration with default timings for `self_id`.
    pub fn new(self_id: ServerId) -> Self {
        Self {
            self_id,
            periodic_sync_interval: Duration::from_secs(10),
            periodic_sync_timeout: Duration::from_secs(10),
            failed_sync_retry_delay: Duration::from_secs(1),
            clean_attempt_interval: Duration::from_secs(1),
            min_forced_clean_period: Duration::from_secs(10),
            active_sync_workers: 2,
            max_pipelined_tasks: 8,
            max_scan_jitter: Duration::from_millis(10),
            report_path: None,
        }
    }

    /// Sets the periodic sync interval.
    pub fn with_periodic_sync_interval(mut self, interval: Duration) -> Self {
        self.periodic_sync_interval = interval;
        self
    }

    /// Sets the passive session staleness timeout.
    pub fn with_periodic_sync_timeout(mut self, timeout: Duration) -> Self {
        self.periodic_sync_timeout = timeout;
        self
    }

    /// Sets the retry delay after a failed session.
    pub fn with_failed_sync_retry_delay(mut self, delay: Duration) -> Self {
        self.failed_sync_retry_delay = delay;
        self
    }

    /// Sets the pause between compactor rounds.
    pub fn with_clean_attempt_interval(mut self, interval: Duration) -> Self {
        self.clean_attempt_interval = interval;
        self
    }

    /// Sets the minimum period between forced cleans.
    pub fn with_min_forced_clean_period(mut self, period: Duration) -> Self {
        self.min_forced_clean_period = period;
        self
    }

    /// Sets the number of sync driver workers.
    pub fn with_active_sync_workers(mut self, workers: usize) -> Self {
        self.active_sync_workers = workers;
        self
    }

    /// Sets the maximum number of outstanding tasks per session.
    pub fn with_max_pipelined_tasks(mut self, tasks: usize) -> Self {
        self.max_pipelined_tasks = tasks;
        self
    }

    /// Sets the scan jitter bound.
    pub fn with_max_scan_jitter(mut self, jitter: Duration) -> Self {
        self.max_scan_jitter = jitter;
        self
    }

    /// Enables the session report file.
    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Checks that the configuration can drive the engine.
    pub fn validate(&self) -> SyncResult<()> {
        if self.periodic_sync_interval.is_zero() {
            return Err(SyncError::Config(
                "periodic_sync_interval must be positive".into(),
            ));
        }
        if self.periodic_sync_timeout.is_zero() {
            return Err(SyncError::Config(
                "periodic_sync_timeout must be positive".into(),
            ));
        }
        if self.clean_attempt_interval.is_zero() {
            return Err(SyncError::Config(
                "clean_attempt_interval must be positive".into(),
            ));
        }
        if self.active_sync_workers == 0 {
            return Err(SyncError::Config(
                "at least one sync worker is required".into(),
            ));
        }
        if self.max_pipelined_tasks == 0 {
            return Err(SyncError::Config(
                "max_pipelined_tasks must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Returns a random wait in `[0, max_scan_jitter]`.
    pub fn scan_jitter(&self) -> Duration {
        let max = self.max_scan_jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
