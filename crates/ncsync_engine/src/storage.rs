//! Blob storage collaborator.

use ncsync_protocol::{BlobList, BlobSummary, SlotId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage queries needed by the sync engine.
pub trait BlobStorage: Send + Sync {
    /// Summaries of every blob stored in `slot`, ordered by key.
    fn full_blob_list(&self, slot: SlotId) -> BlobList;

    /// Persists the sync watermarks to durable storage.
    fn save_max_sync_rec_no(&self);
}

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Version and lifetime.
    pub summary: BlobSummary,
    /// Content.
    pub data: Vec<u8>,
}

/// In-memory blob storage.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    slots: RwLock<HashMap<SlotId, BTreeMap<String, StoredBlob>>>,
    checkpoints: AtomicU64,
}

impl MemoryBlobStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `key` unconditionally.
    pub fn put(&self, slot: SlotId, key: &str, summary: BlobSummary, data: Vec<u8>) {
        self.slots
            .write()
            .entry(slot)
            .or_default()
            .insert(key.to_string(), StoredBlob { summary, data });
    }

    /// Stores a copy received from a peer unless ours is at least as new.
    /// Returns true if the copy was stored.
    pub fn store_synced(&self, slot: SlotId, key: &str, blob: StoredBlob) -> bool {
        let mut slots = self.slots.write();
        let entries = slots.entry(slot).or_default();
        match entries.get(key) {
            Some(existing) if !existing.summary.is_older(&blob.summary) => false,
            _ => {
                entries.insert(key.to_string(), blob);
                true
            }
        }
    }

    /// Returns a copy of `key`.
    pub fn get(&self, slot: SlotId, key: &str) -> Option<StoredBlob> {
        self.slots.read().get(&slot)?.get(key).cloned()
    }

    /// Removes `key`. Returns true if it existed.
    pub fn remove(&self, slot: SlotId, key: &str) -> bool {
        self.slots
            .write()
            .get_mut(&slot)
            .is_some_and(|entries| entries.remove(key).is_some())
    }

    /// Takes over the lifetime of `source` if it describes the same data
    /// and lives longer. Returns true if the lifetime changed.
    pub fn prolong(&self, slot: SlotId, key: &str, source: &BlobSummary) -> bool {
        let mut slots = self.slots.write();
        let Some(blob) = slots.get_mut(&slot).and_then(|e| e.get_mut(key)) else {
            return false;
        };
        if !blob.summary.is_same_data(source) || !blob.summary.is_older(source) {
            return false;
        }
        blob.summary.dead_time = source.dead_time;
        blob.summary.expire = source.expire;
        blob.summary.ver_expire = source.ver_expire;
        true
    }

    /// Number of blobs in `slot`.
    pub fn blob_count(&self, slot: SlotId) -> usize {
        self.slots.read().get(&slot).map_or(0, BTreeMap::len)
    }

    /// Number of watermark checkpoints taken.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn full_blob_list(&self, slot: SlotId) -> BlobList {
        self.slots
            .read()
            .get(&slot)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, blob)| (key.clone(), blob.summary))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn save_max_sync_rec_no(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }
}
