//! Report command implementation.

use ncsync_engine::{ActionCounters, SessionReport, SessionReportLog};
use ncsync_protocol::{ServerId, SlotId, SyncMode, SyncOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Aggregated sessions of one (peer, slot) pair.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct PairSummary {
    /// Peer server.
    pub peer_id: ServerId,
    /// Slot.
    pub slot: SlotId,
    /// Sessions recorded.
    pub sessions: u64,
    /// Sessions that committed.
    pub committed: u64,
    /// Sessions that failed.
    pub failed: u64,
    /// Sessions that replayed events.
    pub event_sessions: u64,
    /// Sessions that merged blob lists.
    pub blob_sessions: u64,
    /// Summed session wall time.
    pub total_duration_ms: u64,
    /// Log size reported by the latest session.
    pub last_log_size: u64,
    /// Summed action counters.
    pub counters: ActionCounters,
}

/// Summary of a whole report file.
#[derive(Debug, Serialize)]
pub struct ReportSummary {
    /// Sessions included after filtering.
    pub sessions: usize,
    /// Failure counts per outcome.
    pub failures: BTreeMap<String, u64>,
    /// Per-pair aggregates, ordered by peer then slot.
    pub pairs: Vec<PairSummary>,
}

/// Runs the report command.
pub fn run(file: &Path, slot: Option<SlotId>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let reports = SessionReportLog::read_all(file)
        .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
    let summary = summarize(&reports, slot);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text_output(file, &summary),
    }
    Ok(())
}

/// Aggregates reports, keeping only `slot` when given.
pub fn summarize(reports: &[SessionReport], slot: Option<SlotId>) -> ReportSummary {
    let mut pairs: BTreeMap<(ServerId, SlotId), PairSummary> = BTreeMap::new();
    let mut failures: BTreeMap<String, u64> = BTreeMap::new();
    let mut sessions = 0;

    for report in reports.iter().filter(|r| slot.map_or(true, |s| r.slot == s)) {
        sessions += 1;
        let pair = pairs
            .entry((report.peer_id, report.slot))
            .or_insert_with(|| PairSummary {
                peer_id: report.peer_id,
                slot: report.slot,
                ..PairSummary::default()
            });
        pair.sessions += 1;
        if report.result == SyncOutcome::Ok {
            pair.committed += 1;
        } else {
            pair.failed += 1;
            *failures.entry(report.result.to_string()).or_default() += 1;
        }
        match report.mode {
            SyncMode::Events => pair.event_sessions += 1,
            SyncMode::Blobs => pair.blob_sessions += 1,
        }
        pair.total_duration_ms += report.duration_ms;
        pair.last_log_size = report.log_size;
        add_counters(&mut pair.counters, &report.counters);
    }

    ReportSummary {
        sessions,
        failures,
        pairs: pairs.into_values().collect(),
    }
}

fn add_counters(sum: &mut ActionCounters, c: &ActionCounters) {
    sum.read_ok += c.read_ok;
    sum.read_err += c.read_err;
    sum.write_ok += c.write_ok;
    sum.write_err += c.write_err;
    sum.prolong_ok += c.prolong_ok;
    sum.prolong_err += c.prolong_err;
    sum.remove_ok += c.remove_ok;
    sum.remove_err += c.remove_err;
}

fn print_text_output(file: &Path, summary: &ReportSummary) {
    println!("Report: {}", file.display());
    println!("Sessions: {}", summary.sessions);
    for (outcome, count) in &summary.failures {
        println!("  {outcome}: {count}");
    }
    println!();
    println!(
        "{:>6} {:>5} {:>8} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>9}",
        "peer", "slot", "sessions", "ok", "failed", "events", "blobs", "sent", "fetched", "avg ms"
    );
    for pair in &summary.pairs {
        let avg = pair.total_duration_ms / pair.sessions.max(1);
        println!(
            "{:>6} {:>5} {:>8} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>9}",
            pair.peer_id,
            pair.slot,
            pair.sessions,
            pair.committed,
            pair.failed,
            pair.event_sessions,
            pair.blob_sessions,
            pair.counters.write_ok,
            pair.counters.read_ok,
            avg
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(peer_id: ServerId, slot: SlotId, mode: SyncMode, result: SyncOutcome) -> SessionReport {
        SessionReport {
            self_id: 1,
            peer_id,
            slot,
            mode,
            result,
            started_unix_ms: 1_700_000_000_000,
            duration_ms: 10,
            log_size: 4,
            local_start: 0,
            remote_start: 0,
            counters: ActionCounters {
                write_ok: 2,
                read_ok: 1,
                ..ActionCounters::default()
            },
        }
    }

    fn sample() -> Vec<SessionReport> {
        vec![
            report(2, 1, SyncMode::Blobs, SyncOutcome::Ok),
            report(2, 1, SyncMode::Events, SyncOutcome::Ok),
            report(3, 1, SyncMode::Events, SyncOutcome::NetworkError),
            report(2, 7, SyncMode::Events, SyncOutcome::Aborted),
        ]
    }

    #[test]
    fn aggregates_per_pair() {
        let summary = summarize(&sample(), None);
        assert_eq!(summary.sessions, 4);
        assert_eq!(summary.pairs.len(), 3);

        let first = &summary.pairs[0];
        assert_eq!((first.peer_id, first.slot), (2, 1));
        assert_eq!(first.sessions, 2);
        assert_eq!(first.committed, 2);
        assert_eq!(first.blob_sessions, 1);
        assert_eq!(first.event_sessions, 1);
        assert_eq!(first.total_duration_ms, 20);
        assert_eq!(first.counters.write_ok, 4);
        assert_eq!(first.counters.read_ok, 2);

        assert_eq!(summary.failures.values().sum::<u64>(), 2);
    }

    #[test]
    fn slot_filter() {
        let summary = summarize(&sample(), Some(7));
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.pairs.len(), 1);
        assert_eq!(summary.pairs[0].failed, 1);
    }

    #[test]
    fn reads_report_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node-1.jsonl");
        let log = SessionReportLog::open(Some(&path)).unwrap();
        for r in sample() {
            log.append(&r).unwrap();
        }

        assert!(run(&path, None, "json").is_ok());
        assert!(run(&dir.path().join("missing.jsonl"), None, "text").is_err());
    }
}
