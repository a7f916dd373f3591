//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use ncsync_engine::{
    ActiveSession, BlobStorage, MemoryBlobStorage, MemoryOpLog, OperationLog, PeerConnection,
    PeerControl, SlotRegistry, SyncArbiter, SyncConfig, SyncContext,
};
use ncsync_protocol::{
    ActionKind, BlobList, BlobSummary, EventDiff, RecNo, ReducedEvents, ServerId, SlotId,
    SyncOutcome,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Routes engine logs to the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Peer control with a swappable connection.
pub struct StubPeer {
    id: ServerId,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    admit: AtomicBool,
    pub stops: AtomicUsize,
}

impl StubPeer {
    pub fn new(id: ServerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection: Mutex::new(None),
            admit: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn with_connection(id: ServerId, connection: Arc<dyn PeerConnection>) -> Arc<Self> {
        let peer = Self::new(id);
        peer.set_connection(Some(connection));
        peer
    }

    pub fn set_connection(&self, connection: Option<Arc<dyn PeerConnection>>) {
        *self.connection.lock() = connection;
    }

    pub fn set_admit(&self, admit: bool) {
        self.admit.store(admit, Ordering::SeqCst);
    }
}

impl PeerControl for StubPeer {
    fn server_id(&self) -> ServerId {
        self.id
    }

    fn connection_backoff_until(&self) -> Option<Instant> {
        None
    }

    fn start_active_sync(&self) -> bool {
        self.admit.load(Ordering::SeqCst)
    }

    fn register_sync_stop(&self, _is_passive: bool) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn register_conn_success(&self) {}

    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.lock().clone()
    }
}

/// A verb received by [`ManualConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start { local: RecNo, remote: RecNo },
    BlobList,
    Send(String),
    Fetch(String),
    ProlongLocal(String),
    ProlongPeer(String),
    Commit { local: RecNo, remote: RecNo },
    Cancel,
}

/// How [`ManualConnection`] answers a start command.
#[derive(Debug, Clone)]
pub enum StartReply {
    Events(ReducedEvents),
    Blobs(BlobList),
    Fail(SyncOutcome),
}

/// Connection that answers control verbs inline and holds every task
/// until the test completes it.
pub struct ManualConnection {
    calls: Mutex<Vec<Call>>,
    start_reply: Mutex<StartReply>,
    blob_list: Mutex<BlobList>,
    pending: Mutex<VecDeque<(Arc<ActiveSession>, ActionKind)>>,
    in_flight_at_finalize: Mutex<Vec<usize>>,
}

impl ManualConnection {
    pub fn new(start_reply: StartReply) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            start_reply: Mutex::new(start_reply),
            blob_list: Mutex::new(BlobList::new()),
            pending: Mutex::new(VecDeque::new()),
            in_flight_at_finalize: Mutex::new(Vec::new()),
        })
    }

    pub fn set_blob_list(&self, list: BlobList) {
        *self.blob_list.lock() = list;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// In-flight counts observed when commit or cancel was dispatched. The
    /// finalize command itself is counted, so a clean session shows 1.
    pub fn in_flight_at_finalize(&self) -> Vec<usize> {
        self.in_flight_at_finalize.lock().clone()
    }

    /// Completes the pending task at `index`.
    pub fn complete(&self, index: usize, outcome: SyncOutcome) -> bool {
        let Some((session, action)) = self.pending.lock().remove(index) else {
            return false;
        };
        session.cmd_finished(outcome, action);
        true
    }

    /// Completes every pending task, newest first.
    pub fn complete_all_reversed(&self) {
        while let Some((session, action)) = self.pending.lock().pop_back() {
            session.cmd_finished(SyncOutcome::Ok, action);
        }
    }

    fn hold(&self, call: Call, session: Arc<ActiveSession>, action: ActionKind) {
        self.calls.lock().push(call);
        self.pending.lock().push_back((session, action));
    }

    fn finalize(&self, call: Call, session: Arc<ActiveSession>) {
        self.in_flight_at_finalize.lock().push(session.in_flight());
        self.calls.lock().push(call);
        session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
    }
}

impl PeerConnection for ManualConnection {
    fn start_sync(&self, session: Arc<ActiveSession>, local_start: RecNo, remote_start: RecNo) {
        self.calls.lock().push(Call::Start {
            local: local_start,
            remote: remote_start,
        });
        let reply = self.start_reply.lock().clone();
        match reply {
            StartReply::Events(events) => {
                session.reply_events(events);
                session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
            }
            StartReply::Blobs(blobs) => {
                session.reply_blobs(blobs);
                session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
            }
            StartReply::Fail(outcome) => session.cmd_finished(outcome, ActionKind::None),
        }
    }

    fn request_blob_list(&self, session: Arc<ActiveSession>) {
        self.calls.lock().push(Call::BlobList);
        session.blob_list_received(self.blob_list.lock().clone());
        session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
    }

    fn send_blob(&self, session: Arc<ActiveSession>, key: &str, _known: Option<u64>) {
        self.hold(Call::Send(key.to_string()), session, ActionKind::Write);
    }

    fn fetch_blob(&self, session: Arc<ActiveSession>, key: &str, _create_time: u64) {
        self.hold(Call::Fetch(key.to_string()), session, ActionKind::Read);
    }

    fn prolong_local_copy(&self, session: Arc<ActiveSession>, key: &str, _r: &BlobSummary) {
        self.hold(Call::ProlongLocal(key.to_string()), session, ActionKind::Prolong);
    }

    fn prolong_peer_copy(&self, session: Arc<ActiveSession>, key: &str, _l: &BlobSummary) {
        self.hold(Call::ProlongPeer(key.to_string()), session, ActionKind::Prolong);
    }

    fn commit(&self, session: Arc<ActiveSession>, local_synced: RecNo, remote_synced: RecNo) {
        self.finalize(
            Call::Commit {
                local: local_synced,
                remote: remote_synced,
            },
            session,
        );
    }

    fn cancel(&self, session: Arc<ActiveSession>) {
        self.finalize(Call::Cancel, session);
    }
}

/// Operation log returning a fixed diff at fixed watermarks.
pub struct FixedOpLog {
    pub diff: Mutex<EventDiff>,
    size: AtomicU64,
    watermarks: Mutex<HashMap<(ServerId, SlotId), (RecNo, RecNo)>>,
    pub cleans: AtomicUsize,
}

impl FixedOpLog {
    pub fn new(diff: EventDiff) -> Arc<Self> {
        Arc::new(Self {
            diff: Mutex::new(diff),
            size: AtomicU64::new(10),
            watermarks: Mutex::new(HashMap::new()),
            cleans: AtomicUsize::new(0),
        })
    }

    pub fn set_log_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }
}

impl OperationLog for FixedOpLog {
    fn get_events_list(
        &self,
        _server_id: ServerId,
        _slot: SlotId,
        _local_start: RecNo,
        _remote_start: RecNo,
    ) -> (ReducedEvents, bool) {
        (ReducedEvents::new(), true)
    }

    fn get_event_diff(
        &self,
        _server_id: ServerId,
        _slot: SlotId,
        _local_start: RecNo,
        _remote_start: RecNo,
        _remote: &ReducedEvents,
    ) -> EventDiff {
        self.diff.lock().clone()
    }

    fn log_size(&self, _slot: SlotId) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn current_rec_no(&self, _slot: SlotId) -> RecNo {
        500
    }

    fn is_over_limit(&self, _slot: SlotId) -> bool {
        false
    }

    fn clean(&self, _slot: SlotId) -> u64 {
        self.cleans.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn set_watermarks(&self, server_id: ServerId, slot: SlotId, local: RecNo, remote: RecNo) {
        self.watermarks
            .lock()
            .insert((server_id, slot), (local, remote));
    }

    fn watermarks(&self, server_id: ServerId, slot: SlotId) -> (RecNo, RecNo) {
        self.watermarks
            .lock()
            .get(&(server_id, slot))
            .copied()
            .unwrap_or((0, 0))
    }
}

/// Connection whose start command reaches the remote arbiter only when
/// the test delivers it. Every other verb completes inline.
pub struct QueuedLink {
    local_id: ServerId,
    remote: Mutex<Option<SyncArbiter>>,
    queue: Mutex<VecDeque<(Arc<ActiveSession>, RecNo, RecNo)>>,
}

impl QueuedLink {
    pub fn new(local_id: ServerId) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            remote: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn attach(&self, remote: SyncArbiter) {
        *self.remote.lock() = Some(remote);
    }

    /// Delivers every queued start command to the remote side.
    pub fn deliver(&self) {
        let queued: Vec<_> = self.queue.lock().drain(..).collect();
        let Some(remote) = self.remote.lock().clone() else {
            return;
        };
        for (session, local_start, remote_start) in queued {
            match remote.initiate(self.local_id, session.slot(), remote_start, local_start) {
                Ok(init) => {
                    session.reply_events(init.events);
                    session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
                }
                Err(err) => session.cmd_finished(err.outcome(), ActionKind::None),
            }
        }
    }
}

impl PeerConnection for QueuedLink {
    fn start_sync(&self, session: Arc<ActiveSession>, local_start: RecNo, remote_start: RecNo) {
        self.queue
            .lock()
            .push_back((session, local_start, remote_start));
    }

    fn request_blob_list(&self, session: Arc<ActiveSession>) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
    }

    fn send_blob(&self, session: Arc<ActiveSession>, _key: &str, _known: Option<u64>) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::Write);
    }

    fn fetch_blob(&self, session: Arc<ActiveSession>, _key: &str, _create_time: u64) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::Read);
    }

    fn prolong_local_copy(&self, session: Arc<ActiveSession>, _key: &str, _r: &BlobSummary) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::Prolong);
    }

    fn prolong_peer_copy(&self, session: Arc<ActiveSession>, _key: &str, _l: &BlobSummary) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::Prolong);
    }

    fn commit(&self, session: Arc<ActiveSession>, _local: RecNo, _remote: RecNo) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
    }

    fn cancel(&self, session: Arc<ActiveSession>) {
        session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
    }
}

/// Default test configuration for server `self_id`.
pub fn config(self_id: ServerId) -> SyncConfig {
    SyncConfig::new(self_id)
        .with_periodic_sync_interval(Duration::from_secs(10))
        .with_periodic_sync_timeout(Duration::from_secs(5))
        .with_failed_sync_retry_delay(Duration::from_secs(1))
        .with_max_scan_jitter(Duration::ZERO)
}

/// Builds a context serving `slots` with the given peers.
pub fn context_with(
    config: SyncConfig,
    slots: &[SlotId],
    peers: &[(Arc<StubPeer>, Vec<SlotId>)],
    oplog: Arc<dyn OperationLog>,
    storage: Arc<dyn BlobStorage>,
) -> Arc<SyncContext> {
    let mut registry = SlotRegistry::new(slots.iter().copied());
    for (peer, peer_slots) in peers {
        let control: Arc<dyn PeerControl> = Arc::clone(peer) as Arc<dyn PeerControl>;
        registry
            .register_slots_for_peer(control, peer_slots)
            .expect("register peer");
    }
    Arc::new(
        SyncContext::new(config, registry, oplog, storage).expect("context"),
    )
}

/// Builds a context backed by an in-memory log.
pub fn context(
    self_id: ServerId,
    slots: &[SlotId],
    peers: &[(Arc<StubPeer>, Vec<SlotId>)],
) -> Arc<SyncContext> {
    context_with(
        config(self_id),
        slots,
        peers,
        Arc::new(MemoryOpLog::new(self_id, 1000)),
        Arc::new(MemoryBlobStorage::new()),
    )
}

/// Marks every pair as initially synced so steady-state rules apply.
pub fn finish_initial_sync(ctx: &SyncContext) {
    for (server_id, slots) in ctx.registry.slots_per_peer() {
        for _ in 0..slots {
            ctx.initial_sync.slot_synced(server_id);
        }
    }
    assert!(ctx.initial_sync.is_complete());
}

/// Active count of `slot` and the number of its pairs in a session.
pub fn slot_counts(ctx: &SyncContext, slot: SlotId) -> (u32, u32) {
    let slot_state = ctx.registry.slot(slot).expect("slot");
    let guard = slot_state.lock();
    let running = guard
        .peers()
        .filter(|p| p.lock().sync_in_progress)
        .count() as u32;
    (guard.active_sync_count, running)
}

/// Runs driver steps until it has to wait or sleep.
pub fn pump(driver: &mut ncsync_engine::SyncDriver) -> ncsync_engine::Step {
    loop {
        match driver.step() {
            ncsync_engine::Step::Next | ncsync_engine::Step::Yield => {}
            other => return other,
        }
    }
}
