//! Identifier aliases.

/// Identifier of a cache server (host and port packed by the topology layer).
pub type ServerId = u64;

/// Keyspace partition number.
pub type SlotId = u16;

/// Operation-log record number.
pub type RecNo = u64;

/// Generation number of a sync session on one (slot, peer) pair.
pub type SyncId = u64;
