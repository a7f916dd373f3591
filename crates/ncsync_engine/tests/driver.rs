//! Active sync driver tests.
//!
//! Connections here complete control commands inline and hold data
//! transfers until the test releases them, so every step of a session can
//! be observed.

mod common;

use common::*;
use ncsync_engine::{
    MemoryBlobStorage, OperationLog, SessionReportLog, Step, SyncArbiter, SyncDriver,
};
use ncsync_protocol::{
    BlobList, BlobSummary, EventDiff, ReducedEvents, SyncEvent, SyncMode, SyncOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const SLOT: u16 = 5;
const PEER: u64 = 2;

fn event(rec_no: u64, key: &str) -> SyncEvent {
    SyncEvent::write(rec_no, SLOT, key, 1, BlobSummary::new(rec_no, 1, 0))
}

fn scenario_diff() -> EventDiff {
    EventDiff {
        to_send: vec![event(101, "s1"), event(102, "s2"), event(103, "s3")],
        to_fetch: vec![event(51, "f1"), event(52, "f2")],
        local_synced: 120,
        remote_synced: 60,
        found: true,
    }
}

struct Fixture {
    ctx: Arc<ncsync_engine::SyncContext>,
    conn: Arc<ManualConnection>,
    oplog: Arc<FixedOpLog>,
    driver: SyncDriver,
}

fn fixture_with(
    config: ncsync_engine::SyncConfig,
    reply: StartReply,
    diff: EventDiff,
    storage: Arc<MemoryBlobStorage>,
) -> Fixture {
    let conn = ManualConnection::new(reply);
    let peer = StubPeer::with_connection(PEER, Arc::clone(&conn) as _);
    let oplog = FixedOpLog::new(diff);
    let ctx = context_with(
        config,
        &[SLOT],
        &[(peer, vec![SLOT])],
        Arc::clone(&oplog) as _,
        storage,
    );
    let driver = SyncDriver::new(Arc::clone(&ctx), 0);
    Fixture {
        ctx,
        conn,
        oplog,
        driver,
    }
}

fn fixture(reply: StartReply, diff: EventDiff) -> Fixture {
    fixture_with(
        config(1),
        reply,
        diff,
        Arc::new(MemoryBlobStorage::new()),
    )
}

fn keys(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::Send(k) | Call::Fetch(k) | Call::ProlongLocal(k) | Call::ProlongPeer(k) => {
                Some(k.clone())
            }
            _ => None,
        })
        .collect()
}

#[test]
fn event_mode_sends_then_fetches_then_commits() {
    let mut f = fixture(StartReply::Events(ReducedEvents::new()), scenario_diff());
    f.oplog.set_watermarks(PEER, SLOT, 100, 50);

    assert_eq!(pump(&mut f.driver), Step::Wait);
    assert_eq!(
        f.conn.calls(),
        vec![
            Call::Start {
                local: 100,
                remote: 50
            },
            Call::Send("s1".into()),
            Call::Send("s2".into()),
            Call::Send("s3".into()),
            Call::Fetch("f1".into()),
            Call::Fetch("f2".into()),
        ]
    );
    assert_eq!(f.conn.pending(), 5);

    // Completions arrive in reverse; commit waits for the last one.
    while f.conn.pending() > 0 {
        assert!(!f.conn.calls().iter().any(|c| matches!(c, Call::Commit { .. })));
        f.conn.complete(f.conn.pending() - 1, SyncOutcome::Ok);
        let step = pump(&mut f.driver);
        if f.conn.pending() > 0 {
            assert_eq!(step, Step::Wait);
        }
    }

    let calls = f.conn.calls();
    assert_eq!(
        calls.last(),
        Some(&Call::Commit {
            local: 120,
            remote: 60
        })
    );
    assert_eq!(f.conn.in_flight_at_finalize(), vec![1]);
    assert_eq!(f.oplog.watermarks(PEER, SLOT), (120, 60));
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));

    let stats = f.ctx.stats.snapshot();
    assert_eq!(stats.sessions_committed, 1);
    assert_eq!(stats.ops_in_committed_sessions, 5);
    assert_eq!(stats.active_sessions_started, 1);
}

#[test]
fn round_sleeps_until_pair_is_due_again() {
    let mut f = fixture(StartReply::Events(ReducedEvents::new()), EventDiff {
        found: true,
        ..EventDiff::default()
    });
    f.oplog.set_watermarks(PEER, SLOT, 10, 10);

    match pump(&mut f.driver) {
        Step::Sleep(pause) => {
            assert!(pause <= Duration::from_secs(10));
            assert!(pause > Duration::from_secs(9));
        }
        other => panic!("expected sleep, got {other:?}"),
    }
    assert_eq!(f.ctx.stats.sessions_committed(), 1);
}

#[test]
fn blob_mode_merges_lists() {
    let v1 = BlobSummary::new(10, 1, 1);
    let v2 = BlobSummary::new(20, 1, 2);
    let v3 = BlobSummary::new(30, 2, 3);
    let v4 = BlobSummary::new(40, 1, 4);
    let v4_older = BlobSummary::new(35, 2, 4);

    let storage = Arc::new(MemoryBlobStorage::new());
    storage.put(SLOT, "a", v1, b"a".to_vec());
    storage.put(SLOT, "b", v2, b"b".to_vec());
    storage.put(SLOT, "d", v4, b"d".to_vec());
    let remote: BlobList = [
        ("b".to_string(), v2),
        ("c".to_string(), v3),
        ("d".to_string(), v4_older),
    ]
    .into_iter()
    .collect();

    let mut f = fixture_with(
        config(1),
        StartReply::Blobs(remote),
        EventDiff::not_found(),
        storage,
    );
    assert_eq!(pump(&mut f.driver), Step::Wait);
    assert_eq!(
        f.conn.calls()[1..],
        [
            Call::Send("a".into()),
            Call::Fetch("c".into()),
            Call::Send("d".into()),
        ]
    );

    f.conn.complete_all_reversed();
    pump(&mut f.driver);
    // Blob mode commits the local log head and keeps the peer watermark.
    assert_eq!(
        f.conn.calls().last(),
        Some(&Call::Commit {
            local: 500,
            remote: 0
        })
    );

    let (_, peer) = f.ctx.registry.find_peer_state(PEER, SLOT).unwrap();
    let state = peer.lock();
    assert!(state.completed_blob_sync);
    assert!(state.completed_full_sync_once);
}

#[test]
fn same_data_copies_are_prolonged() {
    let ours = BlobSummary::new(10, 1, 1).with_lifetime(100, 100, 100);
    let theirs = BlobSummary::new(10, 1, 1).with_lifetime(200, 200, 200);
    let storage = Arc::new(MemoryBlobStorage::new());
    storage.put(SLOT, "k", ours, Vec::new());
    let remote: BlobList = [("k".to_string(), theirs)].into_iter().collect();

    let mut f = fixture_with(
        config(1),
        StartReply::Blobs(remote),
        EventDiff::not_found(),
        storage,
    );
    pump(&mut f.driver);
    assert_eq!(f.conn.calls()[1..], [Call::ProlongLocal("k".into())]);
}

#[test]
fn missing_event_history_falls_back_to_blob_list() {
    let mut f = fixture(
        StartReply::Events(ReducedEvents::new()),
        EventDiff::not_found(),
    );
    f.conn
        .set_blob_list([("x".to_string(), BlobSummary::new(1, 2, 1))].into_iter().collect());

    pump(&mut f.driver);
    assert_eq!(
        f.conn.calls()[1..],
        [Call::BlobList, Call::Fetch("x".into())]
    );

    f.conn.complete_all_reversed();
    pump(&mut f.driver);
    assert!(matches!(f.conn.calls().last(), Some(Call::Commit { .. })));
    let (_, peer) = f.ctx.registry.find_peer_state(PEER, SLOT).unwrap();
    assert!(peer.lock().completed_blob_sync);
}

#[test]
fn empty_log_after_blob_sync_stays_in_event_mode() {
    let mut f = fixture(
        StartReply::Events(ReducedEvents::new()),
        EventDiff::not_found(),
    );
    f.oplog.set_log_size(0);
    f.oplog.set_watermarks(PEER, SLOT, 100, 50);
    let (_, peer) = f.ctx.registry.find_peer_state(PEER, SLOT).unwrap();
    peer.lock().completed_blob_sync = true;

    assert!(matches!(pump(&mut f.driver), Step::Sleep(_)));
    assert_eq!(
        f.conn.calls(),
        [
            Call::Start {
                local: 100,
                remote: 50
            },
            Call::Commit {
                local: 100,
                remote: 50
            },
        ]
    );
    assert!(!peer.lock().used_blob_list_mode);
}

#[test]
fn empty_log_without_blob_sync_requests_blob_list() {
    let mut f = fixture(
        StartReply::Events(ReducedEvents::new()),
        EventDiff::not_found(),
    );
    f.oplog.set_log_size(0);

    pump(&mut f.driver);
    assert_eq!(f.conn.calls()[1], Call::BlobList);
}

#[test]
fn pipelining_is_bounded() {
    let mut f = fixture_with(
        config(1).with_max_pipelined_tasks(2),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );

    assert_eq!(pump(&mut f.driver), Step::Wait);
    assert_eq!(keys(&f.conn.calls()), ["s1", "s2"]);
    assert_eq!(f.conn.pending(), 2);

    f.conn.complete(0, SyncOutcome::Ok);
    assert_eq!(pump(&mut f.driver), Step::Wait);
    assert_eq!(keys(&f.conn.calls()), ["s1", "s2", "s3"]);

    while f.conn.pending() > 0 {
        f.conn.complete(0, SyncOutcome::Ok);
        pump(&mut f.driver);
    }
    assert_eq!(keys(&f.conn.calls()), ["s1", "s2", "s3", "f1", "f2"]);
    assert_eq!(f.conn.in_flight_at_finalize(), vec![1]);
}

#[test]
fn failed_transfer_cancels_session() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("sessions.jsonl");
    let mut f = fixture_with(
        config(1).with_report_path(&report_path),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );
    f.oplog.set_watermarks(PEER, SLOT, 100, 50);

    pump(&mut f.driver);
    f.conn.complete(1, SyncOutcome::NetworkError);
    assert_eq!(pump(&mut f.driver), Step::Wait);
    f.conn.complete_all_reversed();
    pump(&mut f.driver);

    assert_eq!(f.conn.calls().last(), Some(&Call::Cancel));
    assert_eq!(f.conn.in_flight_at_finalize(), vec![1]);
    assert_eq!(f.oplog.watermarks(PEER, SLOT), (100, 50));
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));
    assert_eq!(f.ctx.stats.sessions_cancelled(), 1);

    let reports = SessionReportLog::read_all(&report_path).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, SyncOutcome::NetworkError);
    assert_eq!(reports[0].mode, SyncMode::Events);
    assert_eq!(reports[0].peer_id, PEER);
    assert_eq!(reports[0].counters.write_err, 1);
    assert_eq!(reports[0].counters.write_ok, 2);
}

#[test]
fn failed_session_stops_issuing_tasks() {
    let mut f = fixture_with(
        config(1).with_max_pipelined_tasks(1),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );

    pump(&mut f.driver);
    f.conn.complete(0, SyncOutcome::NetworkError);
    pump(&mut f.driver);

    assert_eq!(keys(&f.conn.calls()), ["s1"]);
    assert_eq!(f.conn.calls().last(), Some(&Call::Cancel));
}

#[test]
fn later_busy_reply_keeps_session_failed() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("sessions.jsonl");
    let mut f = fixture_with(
        config(1)
            .with_max_pipelined_tasks(2)
            .with_report_path(&report_path),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );

    assert_eq!(pump(&mut f.driver), Step::Wait);
    f.conn.complete(0, SyncOutcome::NetworkError);
    f.conn.complete(0, SyncOutcome::ServerBusy);
    pump(&mut f.driver);

    assert_eq!(keys(&f.conn.calls()), ["s1", "s2"]);
    assert_eq!(f.conn.calls().last(), Some(&Call::Cancel));
    let reports = SessionReportLog::read_all(&report_path).unwrap();
    assert_eq!(reports[0].result, SyncOutcome::NetworkError);
    assert_eq!(reports[0].counters.write_err, 2);
}

#[test]
fn busy_transfer_fails_session() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("sessions.jsonl");
    let mut f = fixture_with(
        config(1)
            .with_max_pipelined_tasks(1)
            .with_report_path(&report_path),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );

    pump(&mut f.driver);
    f.conn.complete(0, SyncOutcome::ServerBusy);
    pump(&mut f.driver);

    assert_eq!(keys(&f.conn.calls()), ["s1"]);
    assert_eq!(f.conn.calls().last(), Some(&Call::Cancel));
    assert_eq!(f.ctx.stats.sessions_cancelled(), 1);
    let reports = SessionReportLog::read_all(&report_path).unwrap();
    assert_eq!(reports[0].result, SyncOutcome::NetworkError);
}

#[test]
fn pending_clean_aborts_session() {
    let mut f = fixture_with(
        config(1).with_max_pipelined_tasks(1),
        StartReply::Events(ReducedEvents::new()),
        scenario_diff(),
        Arc::new(MemoryBlobStorage::new()),
    );

    assert_eq!(pump(&mut f.driver), Step::Wait);
    f.ctx.registry.slot(SLOT).unwrap().lock().clean_required = true;
    f.conn.complete(0, SyncOutcome::Ok);
    pump(&mut f.driver);

    assert_eq!(keys(&f.conn.calls()), ["s1"]);
    assert_eq!(f.conn.calls().last(), Some(&Call::Cancel));
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));
    // The clean itself is left to the compactor.
    assert!(f.ctx.registry.slot(SLOT).unwrap().lock().clean_required);
}

#[test]
fn rejected_start_is_not_cancelled() {
    let mut f = fixture(
        StartReply::Fail(SyncOutcome::ServerBusy),
        scenario_diff(),
    );

    assert!(matches!(pump(&mut f.driver), Step::Sleep(_)));
    assert_eq!(
        f.conn.calls(),
        vec![Call::Start {
            local: 0,
            remote: 0
        }]
    );
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));
    assert_eq!(f.ctx.stats.sessions_cancelled(), 1);
}

#[test]
fn unreachable_peer_is_retried_later() {
    let peer = StubPeer::new(PEER);
    let ctx = context(1, &[SLOT], &[(peer, vec![SLOT])]);
    let mut driver = SyncDriver::new(Arc::clone(&ctx), 0);

    match pump(&mut driver) {
        Step::Sleep(pause) => assert!(pause <= Duration::from_secs(1)),
        other => panic!("expected sleep, got {other:?}"),
    }
    assert_eq!(slot_counts(&ctx, SLOT), (0, 0));
    assert_eq!(ctx.stats.sessions_cancelled(), 1);
}

#[test]
fn refused_admission_skips_pair() {
    let peer = StubPeer::new(PEER);
    peer.set_admit(false);
    let ctx = context(1, &[SLOT], &[(peer, vec![SLOT])]);
    let mut driver = SyncDriver::new(Arc::clone(&ctx), 0);

    assert!(matches!(pump(&mut driver), Step::Sleep(_)));
    assert_eq!(slot_counts(&ctx, SLOT), (0, 0));
    assert_eq!(ctx.stats.snapshot().active_sessions_started, 0);
    assert_eq!(ctx.stats.snapshot().busy_rejections, 1);
}

#[test]
fn shutdown_with_tasks_in_flight_aborts() {
    let mut f = fixture(StartReply::Events(ReducedEvents::new()), scenario_diff());

    assert_eq!(pump(&mut f.driver), Step::Wait);
    f.ctx.begin_shutdown();
    assert_eq!(pump(&mut f.driver), Step::Stop);

    assert!(!f.conn.calls().contains(&Call::Cancel));
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));
    assert_eq!(f.ctx.stats.sessions_cancelled(), 1);

    // Late completions for the finished session change nothing.
    f.conn.complete_all_reversed();
    assert_eq!(slot_counts(&f.ctx, SLOT), (0, 0));
}

#[test]
fn cross_sync_fails_both_sessions() {
    let link_ab = QueuedLink::new(1);
    let link_ba = QueuedLink::new(2);
    let a = context(
        1,
        &[SLOT],
        &[(StubPeer::with_connection(2, Arc::clone(&link_ab) as _), vec![SLOT])],
    );
    let b = context(
        2,
        &[SLOT],
        &[(StubPeer::with_connection(1, Arc::clone(&link_ba) as _), vec![SLOT])],
    );
    finish_initial_sync(&a);
    finish_initial_sync(&b);
    link_ab.attach(SyncArbiter::new(Arc::clone(&b)));
    link_ba.attach(SyncArbiter::new(Arc::clone(&a)));

    let mut driver_a = SyncDriver::new(Arc::clone(&a), 0);
    let mut driver_b = SyncDriver::new(Arc::clone(&b), 0);
    assert_eq!(pump(&mut driver_a), Step::Wait);
    assert_eq!(pump(&mut driver_b), Step::Wait);
    assert_eq!(slot_counts(&a, SLOT), (1, 1));
    assert_eq!(slot_counts(&b, SLOT), (1, 1));

    link_ab.deliver();
    link_ba.deliver();
    assert_eq!(
        driver_a.session().map(|s| s.result()),
        Some(SyncOutcome::CrossSynced)
    );
    assert!(matches!(pump(&mut driver_a), Step::Sleep(_)));
    assert!(matches!(pump(&mut driver_b), Step::Sleep(_)));

    for ctx in [&a, &b] {
        assert_eq!(slot_counts(ctx, SLOT), (0, 0));
        let stats = ctx.stats.snapshot();
        assert_eq!(stats.cross_sync_rejections, 1);
        assert_eq!(stats.sessions_cancelled, 1);
        assert_eq!(stats.passive_sessions_started, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn stale_passive_session_is_reclaimed() {
    let peer = StubPeer::new(PEER);
    let ctx = context(1, &[SLOT], &[(peer, vec![SLOT])]);
    finish_initial_sync(&ctx);
    let arbiter = SyncArbiter::new(Arc::clone(&ctx));
    let mut driver = SyncDriver::new(Arc::clone(&ctx), 0);

    let init = arbiter.initiate(PEER, SLOT, 0, 0).unwrap();
    arbiter.command_finished(PEER, SLOT, init.sync_id);

    // Still within the timeout.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(driver.run_round().await.is_some());
    assert_eq!(slot_counts(&ctx, SLOT), (1, 1));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(driver.run_round().await.is_some());
    assert_eq!(slot_counts(&ctx, SLOT), (0, 0));
    assert_eq!(ctx.stats.snapshot().stale_sessions_reclaimed, 1);

    // The peer's late commit is ignored.
    assert!(!arbiter.commit(PEER, SLOT, init.sync_id, 5, 5));
    assert_eq!(ctx.oplog.watermarks(PEER, SLOT), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn busy_passive_session_is_not_reclaimed() {
    let peer = StubPeer::new(PEER);
    let ctx = context(1, &[SLOT], &[(peer, vec![SLOT])]);
    finish_initial_sync(&ctx);
    let arbiter = SyncArbiter::new(Arc::clone(&ctx));
    let mut driver = SyncDriver::new(Arc::clone(&ctx), 0);

    // The start command never reports back.
    arbiter.initiate(PEER, SLOT, 0, 0).unwrap();
    tokio::time::advance(Duration::from_secs(60)).await;
    driver.run_round().await;
    assert_eq!(slot_counts(&ctx, SLOT), (1, 1));
}
