//! Blob summaries used for full blob-list comparison.

use crate::types::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All blobs of one slot keyed by blob key, in key order.
///
/// Ordering by key is what makes the blob-list merge-join possible.
pub type BlobList = BTreeMap<String, BlobSummary>;

/// Version metadata of a stored blob.
///
/// Two summaries are compared field by field in a fixed order; the first
/// differing field decides which copy is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlobSummary {
    /// Creation time in microseconds since the epoch.
    pub create_time: u64,
    /// Server that created this version.
    pub create_server: ServerId,
    /// Creation id, unique within the creating server.
    pub create_id: u32,
    /// Time after which the blob is removed from storage.
    pub dead_time: u64,
    /// Expiration time of the blob.
    pub expire: u64,
    /// Expiration time of this particular version.
    pub ver_expire: u64,
    /// Blob size in bytes. Not part of version comparison.
    pub size: u64,
}

impl BlobSummary {
    /// Creates a summary for a version created by `create_server`.
    pub fn new(create_time: u64, create_server: ServerId, create_id: u32) -> Self {
        Self {
            create_time,
            create_server,
            create_id,
            ..Self::default()
        }
    }

    /// Sets the lifetime fields.
    #[must_use]
    pub fn with_lifetime(mut self, dead_time: u64, expire: u64, ver_expire: u64) -> Self {
        self.dead_time = dead_time;
        self.expire = expire;
        self.ver_expire = ver_expire;
        self
    }

    /// Sets the blob size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    fn version_key(&self) -> (u64, ServerId, u32, u64, u64, u64) {
        (
            self.create_time,
            self.create_server,
            self.create_id,
            self.dead_time,
            self.expire,
            self.ver_expire,
        )
    }

    /// Returns true if this copy should be replaced by `other`.
    pub fn is_older(&self, other: &BlobSummary) -> bool {
        self.version_key() < other.version_key()
    }

    /// Returns true if both summaries describe the same content.
    ///
    /// Copies with the same data may still differ in lifetime metadata,
    /// in which case only a prolong is needed.
    pub fn is_same_data(&self, other: &BlobSummary) -> bool {
        self.create_time == other.create_time
            && self.create_server == other.create_server
            && self.create_id == other.create_id
    }

    /// Returns true if both copies are fully equivalent and need no sync.
    pub fn is_equal(&self, other: &BlobSummary) -> bool {
        self.version_key() == other.version_key()
    }
}
