//! In-process peers for simulation and testing.
//!
//! A [`LoopbackPeer`] is the connection from one node to another node in
//! the same process. Every verb calls straight into the remote node's
//! [`SyncArbiter`] and memory storage and completes inline, so a whole
//! cluster can run on one runtime. [`LoopbackCluster`] wires a set of
//! nodes together by their shared slots.

use crate::arbiter::SyncArbiter;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::node::SyncNode;
use crate::oplog::{MemoryOpLog, OperationLog};
use crate::registry::SlotRegistry;
use crate::session::ActiveSession;
use crate::storage::{BlobStorage, MemoryBlobStorage, StoredBlob};
use crate::transport::{PeerConnection, PeerControl};
use ncsync_protocol::{
    ActionKind, BlobList, BlobSummary, RecNo, ServerId, SlotId, SyncEvent, SyncId, SyncMode,
    SyncOutcome,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Active sessions allowed per peer unless configured otherwise.
pub const DEFAULT_MAX_ACTIVE_SYNCS: usize = 4;

/// Backoff after a failed connection attempt.
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// What a loopback peer can reach on the remote node.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    /// Remote server id.
    pub server_id: ServerId,
    /// Remote arbiter.
    pub arbiter: SyncArbiter,
    /// Remote storage.
    pub storage: Arc<MemoryBlobStorage>,
    /// Remote operation log.
    pub oplog: Arc<MemoryOpLog>,
}

/// Connection from a local node to a remote node in the same process.
pub struct LoopbackPeer {
    me: Weak<LoopbackPeer>,
    local_id: ServerId,
    remote_id: ServerId,
    local_storage: Arc<MemoryBlobStorage>,
    local_oplog: Arc<MemoryOpLog>,
    remote: RwLock<Option<LoopbackEndpoint>>,
    reachable: AtomicBool,
    fail_transfers: AtomicBool,
    backoff_until: Mutex<Option<Instant>>,
    max_active: usize,
    active: AtomicUsize,
    remote_sessions: Mutex<HashMap<SlotId, SyncId>>,
}

impl LoopbackPeer {
    /// Creates a peer of `local_id` pointing at `remote_id`. It stays
    /// unreachable until [`LoopbackPeer::connect`] is called.
    pub fn new(
        local_id: ServerId,
        remote_id: ServerId,
        local_storage: Arc<MemoryBlobStorage>,
        local_oplog: Arc<MemoryOpLog>,
        max_active: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id,
            remote_id,
            local_storage,
            local_oplog,
            remote: RwLock::new(None),
            reachable: AtomicBool::new(true),
            fail_transfers: AtomicBool::new(false),
            backoff_until: Mutex::new(None),
            max_active,
            active: AtomicUsize::new(0),
            remote_sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Attaches the remote node.
    pub fn connect(&self, endpoint: LoopbackEndpoint) {
        *self.remote.write() = Some(endpoint);
    }

    /// Simulates the remote node going away or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Makes every blob transfer fail with a network error.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::Release);
    }

    /// Number of active sessions currently admitted.
    pub fn active_syncs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<LoopbackEndpoint> {
        if !self.reachable.load(Ordering::Acquire) {
            return None;
        }
        self.remote.read().clone()
    }

    /// Runs one command inside the remote passive session.
    fn passive_command(
        &self,
        session: &ActiveSession,
        allow_abort: bool,
        action: ActionKind,
        f: impl FnOnce(&LoopbackEndpoint, SyncId) -> SyncResult<ActionKind>,
    ) {
        let slot = session.slot();
        let result = match self.endpoint() {
            None => Err(SyncError::network("peer unreachable")),
            Some(remote) => {
                match remote
                    .arbiter
                    .can_start_sync_command(self.local_id, slot, allow_abort)
                {
                    Err(err) => Err(err),
                    Ok(sync_id) => {
                        let expected = self.remote_sessions.lock().get(&slot).copied();
                        let result = if expected == Some(sync_id) {
                            f(&remote, sync_id)
                        } else {
                            Err(SyncError::network("remote session superseded"))
                        };
                        remote.arbiter.command_finished(self.local_id, slot, sync_id);
                        result
                    }
                }
            }
        };
        match result {
            Ok(done) => session.cmd_finished(SyncOutcome::Ok, done),
            Err(err) => {
                debug!(remote_id = self.remote_id, slot, %err, "loopback command failed");
                session.cmd_finished(err.outcome(), action);
            }
        }
    }

    fn check_transfer(&self) -> SyncResult<()> {
        if self.fail_transfers.load(Ordering::Acquire) {
            return Err(SyncError::network("transfer failed"));
        }
        Ok(())
    }
}

impl PeerControl for LoopbackPeer {
    fn server_id(&self) -> ServerId {
        self.remote_id
    }

    fn connection_backoff_until(&self) -> Option<Instant> {
        *self.backoff_until.lock()
    }

    fn start_active_sync(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_active).then_some(n + 1)
            })
            .is_ok()
    }

    fn register_sync_stop(&self, is_passive: bool) {
        if !is_passive {
            let _ = self
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn register_conn_success(&self) {
        *self.backoff_until.lock() = None;
    }

    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        if self.endpoint().is_none() {
            *self.backoff_until.lock() = Some(Instant::now() + CONNECT_BACKOFF);
            return None;
        }
        let me: Arc<dyn PeerConnection> = self.me.upgrade()?;
        Some(me)
    }
}

impl PeerConnection for LoopbackPeer {
    fn start_sync(&self, session: Arc<ActiveSession>, local_start: RecNo, remote_start: RecNo) {
        let slot = session.slot();
        let Some(remote) = self.endpoint() else {
            session.cmd_finished(SyncOutcome::NetworkError, ActionKind::None);
            return;
        };
        match remote
            .arbiter
            .initiate(self.local_id, slot, remote_start, local_start)
        {
            Ok(init) => {
                self.remote_sessions.lock().insert(slot, init.sync_id);
                match init.mode {
                    SyncMode::Events => session.reply_events(init.events),
                    SyncMode::Blobs => session.reply_blobs(remote.storage.full_blob_list(slot)),
                }
                remote
                    .arbiter
                    .command_finished(self.local_id, slot, init.sync_id);
                session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
            }
            Err(err) => {
                debug!(remote_id = self.remote_id, slot, %err, "start refused");
                session.cmd_finished(err.outcome(), ActionKind::None);
            }
        }
    }

    fn request_blob_list(&self, session: Arc<ActiveSession>) {
        let slot = session.slot();
        self.passive_command(&session, true, ActionKind::None, |remote, sync_id| {
            remote
                .arbiter
                .mark_blob_list_mode(self.local_id, slot, sync_id);
            session.blob_list_received(remote.storage.full_blob_list(slot));
            Ok(ActionKind::None)
        });
    }

    fn send_blob(&self, session: Arc<ActiveSession>, key: &str, _known_create_time: Option<u64>) {
        let slot = session.slot();
        self.passive_command(&session, true, ActionKind::Write, |remote, _| {
            self.check_transfer()?;
            let Some(blob) = self.local_storage.get(slot, key) else {
                remote.storage.remove(slot, key);
                return Ok(ActionKind::Remove);
            };
            let summary = blob.summary;
            if remote.storage.store_synced(slot, key, blob) {
                remote
                    .oplog
                    .record_synced(self.local_id, SyncEvent::write(0, slot, key, 0, summary));
            }
            Ok(ActionKind::Write)
        });
    }

    fn fetch_blob(&self, session: Arc<ActiveSession>, key: &str, _create_time: u64) {
        let slot = session.slot();
        self.passive_command(&session, true, ActionKind::Read, |remote, _| {
            self.check_transfer()?;
            if let Some(blob) = remote.storage.get(slot, key) {
                let summary = blob.summary;
                if self.local_storage.store_synced(slot, key, blob) {
                    self.local_oplog
                        .record_synced(self.remote_id, SyncEvent::write(0, slot, key, 0, summary));
                }
            }
            Ok(ActionKind::Read)
        });
    }

    fn prolong_local_copy(&self, session: Arc<ActiveSession>, key: &str, remote: &BlobSummary) {
        let slot = session.slot();
        let summary = *remote;
        self.passive_command(&session, true, ActionKind::Prolong, |_, _| {
            if self.local_storage.prolong(slot, key, &summary) {
                self.local_oplog.record_synced(
                    self.remote_id,
                    SyncEvent::prolong(0, slot, key, 0, summary),
                );
            }
            Ok(ActionKind::Prolong)
        });
    }

    fn prolong_peer_copy(&self, session: Arc<ActiveSession>, key: &str, local: &BlobSummary) {
        let slot = session.slot();
        let summary = *local;
        self.passive_command(&session, true, ActionKind::Prolong, |remote, _| {
            if remote.storage.prolong(slot, key, &summary) {
                remote
                    .oplog
                    .record_synced(self.local_id, SyncEvent::prolong(0, slot, key, 0, summary));
            }
            Ok(ActionKind::Prolong)
        });
    }

    fn commit(&self, session: Arc<ActiveSession>, local_synced: RecNo, remote_synced: RecNo) {
        let slot = session.slot();
        self.passive_command(&session, false, ActionKind::None, |remote, sync_id| {
            if remote
                .arbiter
                .commit(self.local_id, slot, sync_id, remote_synced, local_synced)
            {
                Ok(ActionKind::None)
            } else {
                Err(SyncError::network("remote session gone"))
            }
        });
        self.remote_sessions.lock().remove(&slot);
    }

    fn cancel(&self, session: Arc<ActiveSession>) {
        let slot = session.slot();
        self.passive_command(&session, false, ActionKind::None, |remote, sync_id| {
            remote.arbiter.cancel(self.local_id, slot, sync_id, None);
            Ok(ActionKind::None)
        });
        self.remote_sessions.lock().remove(&slot);
    }
}

/// One node of a [`LoopbackCluster`].
pub struct LoopbackNode {
    node: SyncNode,
    slots: Vec<SlotId>,
    oplog: Arc<MemoryOpLog>,
    storage: Arc<MemoryBlobStorage>,
    peers: BTreeMap<ServerId, Arc<LoopbackPeer>>,
}

impl LoopbackNode {
    /// Server id.
    pub fn id(&self) -> ServerId {
        self.node.context().config.self_id
    }

    /// The sync node.
    pub fn node(&self) -> &SyncNode {
        &self.node
    }

    /// Slots served.
    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Operation log.
    pub fn oplog(&self) -> &Arc<MemoryOpLog> {
        &self.oplog
    }

    /// Blob storage.
    pub fn storage(&self) -> &Arc<MemoryBlobStorage> {
        &self.storage
    }

    /// Connection to `server_id`, if the nodes share a slot.
    pub fn peer(&self, server_id: ServerId) -> Option<&Arc<LoopbackPeer>> {
        self.peers.get(&server_id)
    }

    /// Stores a blob written by a client of this node and logs the write.
    pub fn put_blob(&self, slot: SlotId, key: &str, summary: BlobSummary, data: Vec<u8>) -> RecNo {
        self.storage.put(slot, key, summary, data);
        self.oplog.record_write(slot, key, summary)
    }

    /// Summaries of every blob in `slot`.
    pub fn blob_list(&self, slot: SlotId) -> BlobList {
        self.storage.full_blob_list(slot)
    }

    /// Stored copy of `key`.
    pub fn blob(&self, slot: SlotId, key: &str) -> Option<StoredBlob> {
        self.storage.get(slot, key)
    }

    fn endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint {
            server_id: self.id(),
            arbiter: self.node.arbiter().clone(),
            storage: Arc::clone(&self.storage),
            oplog: Arc::clone(&self.oplog),
        }
    }
}

/// Builder for [`LoopbackCluster`].
pub struct ClusterBuilder {
    nodes: Vec<(SyncConfig, Vec<SlotId>)>,
    max_records_per_slot: usize,
    max_active_syncs: usize,
}

impl ClusterBuilder {
    /// Adds a node serving `slots`.
    pub fn node(mut self, config: SyncConfig, slots: impl IntoIterator<Item = SlotId>) -> Self {
        self.nodes.push((config, slots.into_iter().collect()));
        self
    }

    /// Sets the per-slot log bound of every node.
    pub fn max_records_per_slot(mut self, records: usize) -> Self {
        self.max_records_per_slot = records;
        self
    }

    /// Sets the active sessions allowed per peer.
    pub fn max_active_syncs(mut self, syncs: usize) -> Self {
        self.max_active_syncs = syncs;
        self
    }

    /// Creates every node and connects the peers.
    pub fn build(self) -> SyncResult<LoopbackCluster> {
        let mut ids = BTreeSet::new();
        for (config, _) in &self.nodes {
            if !ids.insert(config.self_id) {
                return Err(SyncError::Config(format!(
                    "duplicate server id {}",
                    config.self_id
                )));
            }
        }

        let stores: Vec<_> = self
            .nodes
            .iter()
            .map(|(config, _)| {
                (
                    Arc::new(MemoryOpLog::new(config.self_id, self.max_records_per_slot)),
                    Arc::new(MemoryBlobStorage::new()),
                )
            })
            .collect();

        let mut nodes = BTreeMap::new();
        for (i, (config, slots)) in self.nodes.iter().enumerate() {
            let (oplog, storage) = &stores[i];
            let mut registry = SlotRegistry::new(slots.iter().copied());
            let mut peers = BTreeMap::new();
            for (other, other_slots) in &self.nodes {
                if other.self_id == config.self_id {
                    continue;
                }
                let shared: Vec<_> = slots
                    .iter()
                    .filter(|s| other_slots.contains(s))
                    .copied()
                    .collect();
                if shared.is_empty() {
                    continue;
                }
                let peer = LoopbackPeer::new(
                    config.self_id,
                    other.self_id,
                    Arc::clone(storage),
                    Arc::clone(oplog),
                    self.max_active_syncs,
                );
                let control = Arc::clone(&peer) as Arc<dyn PeerControl>;
                registry.register_slots_for_peer(control, &shared)?;
                peers.insert(other.self_id, peer);
            }
            let node = SyncNode::new(
                config.clone(),
                registry,
                Arc::clone(oplog) as Arc<dyn OperationLog>,
                Arc::clone(storage) as Arc<dyn BlobStorage>,
            )?;
            nodes.insert(
                config.self_id,
                LoopbackNode {
                    node,
                    slots: slots.clone(),
                    oplog: Arc::clone(oplog),
                    storage: Arc::clone(storage),
                    peers,
                },
            );
        }

        let endpoints: HashMap<_, _> = nodes.iter().map(|(id, n)| (*id, n.endpoint())).collect();
        for node in nodes.values() {
            for (remote_id, peer) in &node.peers {
                if let Some(endpoint) = endpoints.get(remote_id) {
                    peer.connect(endpoint.clone());
                }
            }
        }
        Ok(LoopbackCluster { nodes })
    }
}

/// A set of nodes syncing with each other in one process.
pub struct LoopbackCluster {
    nodes: BTreeMap<ServerId, LoopbackNode>,
}

impl LoopbackCluster {
    /// Starts building a cluster.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder {
            nodes: Vec::new(),
            max_records_per_slot: 10_000,
            max_active_syncs: DEFAULT_MAX_ACTIVE_SYNCS,
        }
    }

    /// Looks up a node.
    pub fn node(&self, id: ServerId) -> Option<&LoopbackNode> {
        self.nodes.get(&id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &LoopbackNode> {
        self.nodes.values()
    }

    /// Starts the workers of every node.
    pub fn start(&self) {
        for node in self.nodes.values() {
            node.node.start();
        }
    }

    /// Stops every node.
    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.node.shutdown().await;
        }
    }

    /// Returns true if every node serving `slot` holds the same blobs.
    pub fn is_converged(&self, slot: SlotId) -> bool {
        let mut lists = self
            .nodes
            .values()
            .filter(|n| n.slots.contains(&slot))
            .map(|n| n.blob_list(slot));
        let Some(first) = lists.next() else {
            return true;
        };
        lists.all(|list| list == first)
    }
}
