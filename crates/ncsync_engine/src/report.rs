//! Per-session report records.
//!
//! Every finished active session produces one [`SessionReport`]. It is
//! always emitted as a structured `tracing` event and, when a report path
//! is configured, appended as one JSON line to the report file.

use crate::error::SyncResult;
use crate::session::ActionCounters;
use ncsync_protocol::{ServerId, SlotId, SyncMode, SyncOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of one active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Server that drove the session.
    pub self_id: ServerId,
    /// Peer server.
    pub peer_id: ServerId,
    /// Slot synced.
    pub slot: SlotId,
    /// Reconciliation mode used.
    pub mode: SyncMode,
    /// Session result.
    pub result: SyncOutcome,
    /// Session start as milliseconds since the Unix epoch.
    pub started_unix_ms: u64,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
    /// Records in the slot log when the session ended.
    pub log_size: u64,
    /// Watermark at session start.
    pub local_start: u64,
    /// Peer watermark at session start.
    pub remote_start: u64,
    /// Action counters.
    pub counters: ActionCounters,
}

impl SessionReport {
    /// Emits the report as a `tracing` event.
    pub fn log(&self) {
        tracing::info!(
            target: "ncsync::session",
            self_id = self.self_id,
            peer_id = self.peer_id,
            slot = self.slot,
            mode = %self.mode,
            result = %self.result,
            started_unix_ms = self.started_unix_ms,
            duration_ms = self.duration_ms,
            log_size = self.log_size,
            read_ok = self.counters.read_ok,
            read_err = self.counters.read_err,
            write_ok = self.counters.write_ok,
            write_err = self.counters.write_err,
            prolong_ok = self.counters.prolong_ok,
            prolong_err = self.counters.prolong_err,
            remove_ok = self.counters.remove_ok,
            remove_err = self.counters.remove_err,
            "sync session finished"
        );
    }
}

/// Milliseconds since the Unix epoch at `elapsed` before now.
pub(crate) fn unix_millis_before(elapsed: Duration) -> u64 {
    SystemTime::now()
        .checked_sub(elapsed)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

/// Appends session reports to a JSON-lines file.
#[derive(Debug, Default)]
pub struct SessionReportLog {
    file: Option<Mutex<BufWriter<File>>>,
}

impl SessionReportLog {
    /// Opens `path` for appending, or returns a disabled log for `None`.
    pub fn open(path: Option<&Path>) -> SyncResult<Self> {
        let file = match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self { file })
    }

    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns true if records are written somewhere.
    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Appends one record.
    pub fn append(&self, report: &SessionReport) -> SyncResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let line = serde_json::to_string(report)?;
        let mut writer = file.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    /// Reads every record from a report file.
    pub fn read_all(path: &Path) -> SyncResult<Vec<SessionReport>> {
        let reader = BufReader::new(File::open(path)?);
        let mut reports = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            reports.push(serde_json::from_str(&line)?);
        }
        Ok(reports)
    }
}
