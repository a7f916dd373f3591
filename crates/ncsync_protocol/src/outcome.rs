//! Session modes, task outcomes and action kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a sync session reconciles the two replicas of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Replay the operation-log diff.
    Events,
    /// Compare full per-slot blob lists.
    Blobs,
}

impl SyncMode {
    /// Short name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Events => "events",
            SyncMode::Blobs => "blobs",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result classification of a single sync command or of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Completed successfully.
    Ok,
    /// Connection failure or the session was superseded on the peer.
    NetworkError,
    /// Shutdown or a pending log clean cut the session short.
    Aborted,
    /// The peer was already running its own active session for the pair.
    CrossSynced,
    /// The peer refused because it is busy.
    ServerBusy,
}

impl SyncOutcome {
    /// Returns true for [`SyncOutcome::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, SyncOutcome::Ok)
    }

    /// Returns true if no further tasks may be issued in the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncOutcome::NetworkError | SyncOutcome::Aborted)
    }

    /// Folds a command result into the accumulated session result.
    ///
    /// A fatal result is kept once reached; only an abort may still be
    /// raised to a network error.
    #[must_use]
    pub fn merge(self, command: SyncOutcome) -> SyncOutcome {
        match (self, command) {
            (_, SyncOutcome::Ok) | (SyncOutcome::NetworkError, _) => self,
            (SyncOutcome::Aborted, SyncOutcome::NetworkError) => command,
            (SyncOutcome::Aborted, _) => self,
            _ => command,
        }
    }

    /// Short name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Ok => "ok",
            SyncOutcome::NetworkError => "network_error",
            SyncOutcome::Aborted => "aborted",
            SyncOutcome::CrossSynced => "cross_synced",
            SyncOutcome::ServerBusy => "server_busy",
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of data movement a finished command performed, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Control command (start, blob list, commit, cancel).
    None,
    /// Blob fetched from the peer.
    Read,
    /// Blob sent to the peer.
    Write,
    /// Lifetime of a copy extended.
    Prolong,
    /// Copy removed.
    Remove,
}
