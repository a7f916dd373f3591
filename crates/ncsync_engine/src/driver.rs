//! The active side of synchronization.
//!
//! A [`SyncDriver`] scans all slots in rounds. For every slot it looks for
//! a peer that is due, claims the pair, runs one session against the
//! peer's connection, and finally checks the slot for passive sessions
//! whose peer went silent. Several drivers may scan the same registry
//! concurrently; they coordinate only through the slot and pair locks.
//!
//! The state machine never blocks. Whenever it waits for a connection
//! callback [`SyncDriver::step`] returns [`Step::Wait`] and the async
//! runner parks on the session until the next completion arrives.

use crate::arbiter::{cancel_session, commit_session, start_session};
use crate::context::SyncContext;
use crate::registry::{PeerSyncState, SlotSyncState};
use crate::report::{unix_millis_before, SessionReport};
use crate::scheduler::{Task, TaskScheduler};
use crate::session::ActiveSession;
use crate::transport::PeerConnection;
use ncsync_protocol::{ActionKind, EventType, RecNo, SyncMode, SyncOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

/// States of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Reset round bookkeeping.
    ScanStart,
    /// Look for a due peer on the current slot.
    CheckOurTurn,
    /// Reclaim stale passive sessions on the current slot.
    CheckTheirTurn,
    /// Claim the pair and send the start command.
    RunSync,
    /// Wait for the start reply.
    AwaitStart,
    /// Diff the operation logs.
    PrepareEvents,
    /// Wait for the peer's blob list.
    AwaitBlobList,
    /// Set up the blob-list merge.
    PrepareBlobs,
    /// Dispatch tasks.
    ExecuteTasks,
    /// Wait for task completions.
    AwaitTasks,
    /// Send commit or cancel.
    Finalize,
    /// Wait for the commit or cancel reply.
    AwaitFinalize,
    /// Release the pair and report.
    Finish,
    /// Compute the pause before the next round.
    ScanEnd,
}

/// What the runner should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Continue with the next step right away.
    Next,
    /// Give other tasks a chance, then continue.
    Yield,
    /// Wait for a session callback, then continue.
    Wait,
    /// Sleep, then start the next round.
    Sleep(Duration),
    /// Shutdown observed; stop the driver.
    Stop,
}

#[derive(Debug)]
struct Round {
    started: Instant,
    did_sync: bool,
    min_next_time: Option<Instant>,
}

impl Round {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            did_sync: false,
            min_next_time: None,
        }
    }
}

/// The running session of a driver. Owns everything received from the
/// peer; dropping it releases the remote lists.
struct SessionWork {
    session: Arc<ActiveSession>,
    slot_state: Arc<SlotSyncState>,
    peer_state: Arc<PeerSyncState>,
    mode: SyncMode,
    scheduler: Option<TaskScheduler>,
    pending: Option<Task>,
    local_start: RecNo,
    remote_start: RecNo,
    local_synced: RecNo,
    remote_synced: RecNo,
}

impl SessionWork {
    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer_state.peer().connection()
    }
}

/// One active-sync worker.
pub struct SyncDriver {
    ctx: Arc<SyncContext>,
    worker: usize,
    state: DriverState,
    round: Round,
    slots: Vec<Arc<SlotSyncState>>,
    slot_idx: usize,
    candidate: Option<Arc<PeerSyncState>>,
    work: Option<SessionWork>,
    force_init_sync: bool,
    need_rehash: bool,
}

impl SyncDriver {
    /// Creates driver number `worker`.
    pub fn new(ctx: Arc<SyncContext>, worker: usize) -> Self {
        Self {
            ctx,
            worker,
            state: DriverState::ScanStart,
            round: Round::new(),
            slots: Vec::new(),
            slot_idx: 0,
            candidate: None,
            work: None,
            force_init_sync: false,
            need_rehash: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// The session being driven, if any.
    pub fn session(&self) -> Option<&Arc<ActiveSession>> {
        self.work.as_ref().map(|w| &w.session)
    }

    /// Runs until shutdown.
    pub async fn run(mut self) {
        debug!(worker = self.worker, "sync driver started");
        while let Some(pause) = self.run_round().await {
            let ctx = Arc::clone(&self.ctx);
            tokio::select! {
                _ = sleep(pause) => {}
                _ = ctx.shutdown_signalled() => {}
            }
        }
        debug!(worker = self.worker, "sync driver stopped");
    }

    /// Runs one full scan round and returns the pause before the next
    /// one, or `None` once shutdown was observed.
    pub async fn run_round(&mut self) -> Option<Duration> {
        loop {
            match self.step() {
                Step::Next => {}
                Step::Yield => tokio::task::yield_now().await,
                Step::Wait => self.wait_for_callback().await,
                Step::Sleep(pause) => return Some(pause),
                Step::Stop => return None,
            }
        }
    }

    async fn wait_for_callback(&self) {
        let Some(work) = &self.work else {
            return;
        };
        let session = Arc::clone(&work.session);
        tokio::select! {
            _ = session.changed() => {}
            _ = self.ctx.shutdown_signalled() => {}
        }
    }

    /// Executes one state transition.
    pub fn step(&mut self) -> Step {
        trace!(worker = self.worker, state = ?self.state, "driver step");
        match self.state {
            DriverState::ScanStart => self.scan_start(),
            DriverState::CheckOurTurn => self.check_our_turn(),
            DriverState::CheckTheirTurn => self.check_their_turn(),
            DriverState::RunSync => self.run_sync(),
            DriverState::AwaitStart => self.await_start(),
            DriverState::PrepareEvents => self.prepare_events(),
            DriverState::AwaitBlobList => self.await_blob_list(),
            DriverState::PrepareBlobs => self.prepare_blobs(),
            DriverState::ExecuteTasks => self.execute_tasks(),
            DriverState::AwaitTasks => self.await_tasks(),
            DriverState::Finalize => self.finalize(),
            DriverState::AwaitFinalize => self.await_finalize(),
            DriverState::Finish => self.finish(),
            DriverState::ScanEnd => self.scan_end(),
        }
    }

    fn goto(&mut self, state: DriverState) -> Step {
        self.state = state;
        Step::Next
    }

    // === Scanning ===

    fn scan_start(&mut self) -> Step {
        self.round = Round::new();
        self.slots = self.ctx.registry.scan_order();
        self.slot_idx = 0;
        self.goto(DriverState::CheckOurTurn)
    }

    fn check_our_turn(&mut self) -> Step {
        if self.ctx.is_shutting_down() {
            return Step::Stop;
        }
        let Some(slot_state) = self.slots.get(self.slot_idx).cloned() else {
            return self.goto(DriverState::ScanEnd);
        };

        let peers = {
            let mut slot = slot_state.lock();
            if slot.active_sync_count != 0 && !self.force_init_sync {
                None
            } else {
                if self.need_rehash {
                    slot.reshuffle_first_peer();
                }
                Some(slot.peers_snapshot())
            }
        };

        if let Some(peers) = peers {
            let now = Instant::now();
            let init_phase = self.ctx.initial_sync.has_servers_for_init_sync();
            for peer_state in peers {
                let (due, done_once) = {
                    let peer = peer_state.lock();
                    (peer_state.next_due(&peer), peer.completed_full_sync_once)
                };
                if due <= now && (!init_phase || !done_once) {
                    self.candidate = Some(peer_state);
                    return self.goto(DriverState::RunSync);
                }
            }
        }
        self.goto(DriverState::CheckTheirTurn)
    }

    fn check_their_turn(&mut self) -> Step {
        if self.ctx.is_shutting_down() {
            return Step::Stop;
        }
        let Some(slot_state) = self.slots.get(self.slot_idx).cloned() else {
            return self.goto(DriverState::ScanEnd);
        };
        let ctx = Arc::clone(&self.ctx);
        let timeout = ctx.config.periodic_sync_timeout;
        let now = Instant::now();

        let mut slot = slot_state.lock();
        for peer_state in slot.peers_snapshot() {
            let mut peer = peer_state.lock();
            if !peer.sync_in_progress {
                let due = peer_state.next_due(&peer);
                self.round.min_next_time = Some(match self.round.min_next_time {
                    Some(min) => min.min(due),
                    None => due,
                });
                continue;
            }
            if peer.is_passive
                && peer.active_task_count == 0
                && now.saturating_duration_since(peer.last_activity_time) >= timeout
            {
                warn!(
                    server_id = peer_state.server_id(),
                    slot = slot_state.slot(),
                    sync_id = peer.sync_generation,
                    "cancelling stale passive session"
                );
                ctx.stats.record_stale_reclaimed();
                cancel_session(&ctx, &mut slot, &peer_state, &mut peer, Duration::ZERO);
            }
        }
        drop(slot);

        self.slot_idx += 1;
        self.state = DriverState::CheckOurTurn;
        Step::Yield
    }

    fn scan_end(&mut self) -> Step {
        let config = &self.ctx.config;
        let interval = config.periodic_sync_interval;
        let now = Instant::now();

        self.force_init_sync =
            self.ctx.initial_sync.has_servers_for_init_sync() && !self.round.did_sync;
        self.need_rehash = now.saturating_duration_since(self.round.started) >= interval;

        let pause = match self.round.min_next_time {
            None => interval,
            Some(next) if next > now => (next - now).min(interval),
            Some(_) => config.scan_jitter(),
        };
        trace!(worker = self.worker, ?pause, "scan round done");
        self.state = DriverState::ScanStart;
        Step::Sleep(pause)
    }

    // === Session ===

    fn run_sync(&mut self) -> Step {
        let Some(peer_state) = self.candidate.take() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let Some(slot_state) = self.slots.get(self.slot_idx).cloned() else {
            return self.goto(DriverState::ScanEnd);
        };
        let server_id = peer_state.server_id();
        let slot = slot_state.slot();

        let sync_id = match start_session(&self.ctx, &slot_state, &peer_state, false) {
            Ok(sync_id) => sync_id,
            Err(err) => {
                debug!(server_id, slot, %err, "could not claim pair");
                return self.goto(DriverState::CheckTheirTurn);
            }
        };

        let (local_start, remote_start) = self.ctx.oplog.watermarks(server_id, slot);
        let session = Arc::new(ActiveSession::new(server_id, slot, sync_id));
        debug!(server_id, slot, sync_id, local_start, remote_start, "active sync started");

        let work = SessionWork {
            session: Arc::clone(&session),
            slot_state,
            peer_state,
            mode: SyncMode::Events,
            scheduler: None,
            pending: None,
            local_start,
            remote_start,
            local_synced: local_start,
            remote_synced: remote_start,
        };
        let connection = work.connection();
        self.work = Some(work);

        let Some(connection) = connection else {
            session.merge_result(SyncOutcome::NetworkError);
            return self.goto(DriverState::Finish);
        };
        session.begin_command();
        connection.start_sync(session, local_start, remote_start);
        self.goto(DriverState::AwaitStart)
    }

    /// Shared head of every await state. Returns `Some` if the caller must
    /// keep waiting or leave for `Finish`.
    fn settle(&mut self) -> Option<Step> {
        let session = Arc::clone(&self.work.as_ref()?.session);
        if session.in_flight() > 0 {
            if !self.ctx.is_shutting_down() {
                return Some(Step::Wait);
            }
            session.merge_result(SyncOutcome::Aborted);
            return Some(self.goto(DriverState::Finish));
        }
        if self.ctx.is_shutting_down() {
            session.merge_result(SyncOutcome::Aborted);
        }
        None
    }

    fn await_start(&mut self) -> Step {
        if let Some(step) = self.settle() {
            return step;
        }
        let Some(work) = &self.work else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        if !work.session.result().is_ok() {
            return self.goto(DriverState::Finish);
        }
        match work.session.peer_mode() {
            Some(SyncMode::Blobs) => self.goto(DriverState::PrepareBlobs),
            Some(SyncMode::Events) => self.goto(DriverState::PrepareEvents),
            None => {
                warn!(
                    server_id = work.session.server_id(),
                    slot = work.session.slot(),
                    "start command completed without a reply"
                );
                work.session.merge_result(SyncOutcome::NetworkError);
                self.goto(DriverState::Finish)
            }
        }
    }

    fn prepare_events(&mut self) -> Step {
        let ctx = Arc::clone(&self.ctx);
        let Some(work) = self.work.as_mut() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let server_id = work.session.server_id();
        let slot = work.session.slot();

        let remote_events = work.session.take_remote_events();
        let diff = ctx.oplog.get_event_diff(
            server_id,
            slot,
            work.local_start,
            work.remote_start,
            &remote_events,
        );
        drop(remote_events);
        let completed_blob_sync = work.peer_state.lock().completed_blob_sync;

        work.local_synced = diff.local_synced.max(work.local_start);
        work.remote_synced = diff.remote_synced.max(work.remote_start);
        if diff.found || (ctx.oplog.log_size(slot) == 0 && completed_blob_sync) {
            debug!(
                server_id,
                slot,
                to_send = diff.to_send.len(),
                to_fetch = diff.to_fetch.len(),
                "syncing by events"
            );
            work.mode = SyncMode::Events;
            work.scheduler = Some(TaskScheduler::for_events(diff.to_send, diff.to_fetch));
            return self.goto(DriverState::ExecuteTasks);
        }

        debug!(server_id, slot, "event log incomplete, requesting blob list");
        work.mode = SyncMode::Blobs;
        work.peer_state.lock().used_blob_list_mode = true;
        let Some(connection) = work.connection() else {
            work.session.merge_result(SyncOutcome::NetworkError);
            return self.goto(DriverState::Finish);
        };
        let session = Arc::clone(&work.session);
        session.begin_command();
        connection.request_blob_list(session);
        self.goto(DriverState::AwaitBlobList)
    }

    fn await_blob_list(&mut self) -> Step {
        if let Some(step) = self.settle() {
            return step;
        }
        match &self.work {
            Some(work) if work.session.result().is_ok() => self.goto(DriverState::PrepareBlobs),
            _ => self.goto(DriverState::Finish),
        }
    }

    fn prepare_blobs(&mut self) -> Step {
        let ctx = Arc::clone(&self.ctx);
        let Some(work) = self.work.as_mut() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let slot = work.session.slot();

        work.local_synced = ctx.oplog.current_rec_no(slot);
        work.remote_synced = work.remote_start;
        let local = ctx.storage.full_blob_list(slot);
        let remote = work.session.take_remote_blobs();
        debug!(
            server_id = work.session.server_id(),
            slot,
            local = local.len(),
            remote = remote.len(),
            "syncing by blob lists"
        );
        work.mode = SyncMode::Blobs;
        work.peer_state.lock().used_blob_list_mode = true;
        work.scheduler = Some(TaskScheduler::for_blobs(local, remote));
        self.goto(DriverState::ExecuteTasks)
    }

    fn execute_tasks(&mut self) -> Step {
        let ctx = Arc::clone(&self.ctx);
        let max_in_flight = ctx.config.max_pipelined_tasks;
        let Some(work) = self.work.as_mut() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let session = Arc::clone(&work.session);

        loop {
            let clean_required = work.slot_state.lock().clean_required;
            if clean_required || ctx.is_shutting_down() {
                session.merge_result(SyncOutcome::Aborted);
            }
            let failed = session.result().is_fatal();
            if failed {
                // A task picked before the failure is never sent.
                work.pending = Some(Task::Finalize);
            }
            if work.pending.is_none() {
                let task = match work.scheduler.as_mut() {
                    Some(scheduler) => scheduler.next_task(clean_required, failed),
                    None => Task::Finalize,
                };
                work.pending = Some(task);
            }

            let in_flight = session.in_flight();
            if work.pending == Some(Task::Finalize) {
                if in_flight > 0 {
                    self.state = DriverState::AwaitTasks;
                    return Step::Wait;
                }
                work.pending = None;
                return self.goto(DriverState::Finalize);
            }
            if in_flight >= max_in_flight {
                self.state = DriverState::AwaitTasks;
                return Step::Wait;
            }

            let Some(connection) = work.connection() else {
                if in_flight > 0 {
                    self.state = DriverState::AwaitTasks;
                    return Step::Wait;
                }
                session.merge_result(SyncOutcome::NetworkError);
                return self.goto(DriverState::Finish);
            };
            let Some(task) = work.pending.take() else {
                continue;
            };
            work.peer_state.lock().ops_in_session += 1;
            session.begin_command();
            dispatch(connection.as_ref(), &session, task);
        }
    }

    fn await_tasks(&mut self) -> Step {
        let Some(work) = &self.work else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let session = Arc::clone(&work.session);
        let in_flight = session.in_flight();
        if self.ctx.is_shutting_down() && in_flight > 0 {
            session.merge_result(SyncOutcome::Aborted);
            return self.goto(DriverState::Finish);
        }
        let blocked = match work.pending {
            Some(Task::Finalize) => in_flight > 0,
            _ => in_flight >= self.ctx.config.max_pipelined_tasks,
        };
        if blocked {
            return Step::Wait;
        }
        self.goto(DriverState::ExecuteTasks)
    }

    fn finalize(&mut self) -> Step {
        let ctx = Arc::clone(&self.ctx);
        let Some(work) = self.work.as_mut() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let session = Arc::clone(&work.session);
        debug_assert_eq!(session.in_flight(), 0);

        let Some(connection) = work.connection() else {
            session.merge_result(SyncOutcome::NetworkError);
            return self.goto(DriverState::Finish);
        };
        session.begin_command();
        if session.result().is_ok() {
            ctx.oplog.set_watermarks(
                session.server_id(),
                session.slot(),
                work.local_synced,
                work.remote_synced,
            );
            connection.commit(session, work.local_synced, work.remote_synced);
        } else {
            connection.cancel(session);
        }
        self.goto(DriverState::AwaitFinalize)
    }

    fn await_finalize(&mut self) -> Step {
        if let Some(step) = self.settle() {
            return step;
        }
        self.goto(DriverState::Finish)
    }

    fn finish(&mut self) -> Step {
        let Some(work) = self.work.take() else {
            return self.goto(DriverState::CheckTheirTurn);
        };
        let ctx = Arc::clone(&self.ctx);
        let SessionWork {
            session,
            slot_state,
            peer_state,
            mode,
            scheduler,
            local_start,
            remote_start,
            ..
        } = work;
        drop(scheduler);
        let result = session.result();
        let remote_events = session.take_remote_events();
        let remote_blobs = session.take_remote_blobs();
        drop((remote_events, remote_blobs));

        if result.is_ok() {
            ctx.storage.save_max_sync_rec_no();
        }

        let elapsed = session.started_at().elapsed();
        let report = SessionReport {
            self_id: ctx.config.self_id,
            peer_id: session.server_id(),
            slot: session.slot(),
            mode,
            result,
            started_unix_ms: unix_millis_before(elapsed),
            duration_ms: elapsed.as_millis() as u64,
            log_size: ctx.oplog.log_size(session.slot()),
            local_start,
            remote_start,
            counters: session.counters(),
        };
        report.log();
        if let Err(err) = ctx.reports.append(&report) {
            warn!(%err, "failed to append session report");
        }

        {
            let mut slot = slot_state.lock();
            let mut peer = peer_state.lock();
            if peer.sync_in_progress
                && !peer.is_passive
                && peer.sync_generation == session.sync_id()
            {
                if result.is_ok() {
                    commit_session(&ctx, &mut slot, &peer_state, &mut peer);
                } else {
                    cancel_session(
                        &ctx,
                        &mut slot,
                        &peer_state,
                        &mut peer,
                        ctx.config.failed_sync_retry_delay,
                    );
                }
            } else {
                warn!(
                    server_id = session.server_id(),
                    slot = session.slot(),
                    "active session was released elsewhere"
                );
            }
        }

        self.round.did_sync |= result.is_ok();
        self.goto(DriverState::CheckTheirTurn)
    }
}

/// Sends one task over `connection`.
fn dispatch(connection: &dyn PeerConnection, session: &Arc<ActiveSession>, task: Task) {
    let session = Arc::clone(session);
    match task {
        Task::SendEvent(event) => match event.event_type {
            EventType::Write => {
                connection.send_blob(session, &event.key, Some(event.summary.create_time))
            }
            EventType::Prolong => connection.prolong_peer_copy(session, &event.key, &event.summary),
        },
        Task::FetchEvent(event) => match event.event_type {
            EventType::Write => {
                connection.fetch_blob(session, &event.key, event.summary.create_time)
            }
            EventType::Prolong => {
                connection.prolong_local_copy(session, &event.key, &event.summary)
            }
        },
        Task::UpdateOurs { key, local, remote } => {
            if local.is_same_data(&remote) {
                connection.prolong_local_copy(session, &key, &remote);
            } else {
                connection.fetch_blob(session, &key, remote.create_time);
            }
        }
        Task::UpdatePeer { key, local, remote } => {
            if local.is_same_data(&remote) {
                connection.prolong_peer_copy(session, &key, &local);
            } else {
                connection.send_blob(session, &key, None);
            }
        }
        Task::SendBlob { key } => connection.send_blob(session, &key, None),
        Task::FetchBlob { key, create_time } => connection.fetch_blob(session, &key, create_time),
        Task::Finalize => {
            warn!("finalize is never dispatched as a task");
            session.cmd_finished(SyncOutcome::Ok, ActionKind::None);
        }
    }
}
