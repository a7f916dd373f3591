//! Error types for the sync engine.

use ncsync_protocol::{ServerId, SlotId, SyncOutcome};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Another session owns the pair, the slot is being cleaned, or the
    /// server is shutting down. Nothing was changed.
    #[error("server busy")]
    Busy,

    /// Both sides tried to actively sync the same pair. Nothing was changed.
    #[error("cross-synced with peer")]
    CrossSynced,

    /// Connection failure or a stale session generation.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Shutdown observed mid-session.
    #[error("sync aborted")]
    Aborted,

    /// The slot is not shared with the given server.
    #[error("slot {slot} is not shared with server {server_id}")]
    UnknownPeerSlot {
        /// Peer server.
        server_id: ServerId,
        /// Slot number.
        slot: SlotId,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Session report encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError(message.into())
    }

    /// Returns true if the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Busy | SyncError::CrossSynced | SyncError::NetworkError(_)
        )
    }

    /// Maps the error to the outcome reported back to a peer.
    pub fn outcome(&self) -> SyncOutcome {
        match self {
            SyncError::Busy => SyncOutcome::ServerBusy,
            SyncError::CrossSynced => SyncOutcome::CrossSynced,
            SyncError::Aborted => SyncOutcome::Aborted,
            _ => SyncOutcome::NetworkError,
        }
    }
}
