//! # ncsync engine
//!
//! Peer-to-peer blob synchronization for a slot-partitioned cache cluster.
//!
//! This crate provides:
//! - Slot and pair registry with two-level locking
//! - Session arbitration for peer-initiated syncs
//! - The active sync driver (event replay or blob-list merge)
//! - Deferred operation-log compaction
//! - In-memory collaborators and an in-process loopback cluster
//!
//! ## Architecture
//!
//! Every server runs several [`SyncDriver`] workers and one
//! [`LogCompactor`]. Drivers scan all slots, claim due (slot, peer) pairs
//! and run one session per claim against the peer's connection. Requests
//! from peers enter through [`SyncArbiter`]. Drivers, the arbiter and the
//! compactor share one [`SyncContext`] and coordinate only through the
//! slot and pair locks of the [`SlotRegistry`].
//!
//! ## Key Invariants
//!
//! - At most one session per (slot, peer) pair at any time
//! - A slot's active count equals its pairs with a running session
//! - Completions for a superseded session generation change nothing
//! - A slot log is never cleaned while a session runs on the slot
//! - Commit or cancel is sent only after every task of the session ended

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arbiter;
mod compactor;
mod config;
mod context;
mod driver;
mod error;
mod initial_sync;
mod loopback;
mod node;
mod oplog;
mod registry;
mod report;
mod scheduler;
mod session;
mod stats;
mod storage;
mod transport;

pub use arbiter::{Initiation, SyncArbiter};
pub use compactor::{CompactorStep, LogCompactor};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use driver::{DriverState, Step, SyncDriver};
pub use error::{SyncError, SyncResult};
pub use initial_sync::InitialSyncTracker;
pub use loopback::{
    ClusterBuilder, LoopbackCluster, LoopbackEndpoint, LoopbackNode, LoopbackPeer,
    DEFAULT_MAX_ACTIVE_SYNCS,
};
pub use node::SyncNode;
pub use oplog::{MemoryOpLog, OperationLog};
pub use registry::{PeerState, PeerSyncState, SlotRegistry, SlotState, SlotSyncState};
pub use report::{SessionReport, SessionReportLog};
pub use scheduler::{Task, TaskScheduler};
pub use session::{ActionCounters, ActiveSession};
pub use stats::{StatsSnapshot, SyncStats};
pub use storage::{BlobStorage, MemoryBlobStorage, StoredBlob};
pub use transport::{PeerConnection, PeerControl};
