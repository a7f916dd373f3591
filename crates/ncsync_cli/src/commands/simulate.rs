//! Simulate command implementation.

use ncsync_engine::{LoopbackCluster, StatsSnapshot, SyncConfig, DEFAULT_MAX_ACTIVE_SYNCS};
use ncsync_protocol::{BlobSummary, ServerId, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cluster description read from the config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Timings shared by every node.
    #[serde(default)]
    pub settings: Settings,
    /// Maximum log records per slot before a clean is forced.
    #[serde(default = "default_max_records")]
    pub max_records_per_slot: usize,
    /// Active sessions allowed per peer connection.
    #[serde(default = "default_max_active")]
    pub max_active_syncs: usize,
    /// Directory receiving one session report file per node.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    /// Cluster members.
    pub nodes: Vec<NodeSpec>,
}

/// Engine timings, in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Delay before re-syncing a pair after a commit.
    pub periodic_sync_interval_ms: u64,
    /// Idle time after which a passive session is reclaimed.
    pub periodic_sync_timeout_ms: u64,
    /// Delay before retrying a failed pair.
    pub failed_sync_retry_delay_ms: u64,
    /// Pause between compactor rounds.
    pub clean_attempt_interval_ms: u64,
    /// Sync workers per node.
    pub workers: usize,
    /// Outstanding tasks per session.
    pub max_pipelined_tasks: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            periodic_sync_interval_ms: 1_000,
            periodic_sync_timeout_ms: 5_000,
            failed_sync_retry_delay_ms: 500,
            clean_attempt_interval_ms: 500,
            workers: 2,
            max_pipelined_tasks: 8,
        }
    }
}

/// One cluster member.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Server id.
    pub id: ServerId,
    /// Slots served.
    pub slots: Vec<SlotId>,
    /// Blobs present before the simulation starts.
    #[serde(default)]
    pub blobs: Vec<SeedBlob>,
}

/// A blob written to a node before start.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedBlob {
    /// Slot of the blob.
    pub slot: SlotId,
    /// Blob key.
    pub key: String,
    /// Version timestamp; the newest copy wins.
    pub create_time: u64,
    /// Expiration time.
    #[serde(default)]
    pub expire: u64,
    /// Content.
    #[serde(default)]
    pub data: String,
}

fn default_max_records() -> usize {
    10_000
}

fn default_max_active() -> usize {
    DEFAULT_MAX_ACTIVE_SYNCS
}

/// Per-node outcome of a simulation.
#[derive(Debug, Serialize)]
pub struct NodeResult {
    /// Server id.
    pub id: ServerId,
    /// Blobs stored per slot at the end.
    pub blobs: usize,
    /// Sync counters.
    pub stats: StatsSnapshot,
}

/// Outcome of a simulation.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Simulated wall time in seconds.
    pub duration_secs: u64,
    /// Slots served by more than one node whose copies all match.
    pub converged_slots: Vec<SlotId>,
    /// Shared slots whose copies still differ.
    pub diverged_slots: Vec<SlotId>,
    /// Per-node results.
    pub nodes: Vec<NodeResult>,
}

impl ClusterConfig {
    /// Reads a config file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn node_config(&self, id: ServerId) -> SyncConfig {
        let s = &self.settings;
        let mut config = SyncConfig::new(id)
            .with_periodic_sync_interval(Duration::from_millis(s.periodic_sync_interval_ms))
            .with_periodic_sync_timeout(Duration::from_millis(s.periodic_sync_timeout_ms))
            .with_failed_sync_retry_delay(Duration::from_millis(s.failed_sync_retry_delay_ms))
            .with_clean_attempt_interval(Duration::from_millis(s.clean_attempt_interval_ms))
            .with_active_sync_workers(s.workers)
            .with_max_pipelined_tasks(s.max_pipelined_tasks);
        if let Some(dir) = &self.report_dir {
            config = config.with_report_path(dir.join(format!("node-{id}.jsonl")));
        }
        config
    }

    /// Builds the cluster and writes every seed blob.
    pub fn build(&self) -> Result<LoopbackCluster, Box<dyn std::error::Error>> {
        if let Some(dir) = &self.report_dir {
            std::fs::create_dir_all(dir)?;
        }
        let mut builder = LoopbackCluster::builder()
            .max_records_per_slot(self.max_records_per_slot)
            .max_active_syncs(self.max_active_syncs);
        for node in &self.nodes {
            builder = builder.node(self.node_config(node.id), node.slots.iter().copied());
        }
        let cluster = builder.build()?;

        for member in &self.nodes {
            let Some(node) = cluster.node(member.id) else {
                continue;
            };
            for blob in &member.blobs {
                if !member.slots.contains(&blob.slot) {
                    return Err(format!(
                        "node {} seeds blob {:?} in slot {} it does not serve",
                        member.id, blob.key, blob.slot
                    )
                    .into());
                }
                let summary = BlobSummary::new(blob.create_time, member.id, 0)
                    .with_lifetime(blob.expire, blob.expire, blob.expire)
                    .with_size(blob.data.len() as u64);
                node.put_blob(blob.slot, &blob.key, summary, blob.data.clone().into_bytes());
            }
        }
        Ok(cluster)
    }

    /// Slots served by at least two nodes.
    fn shared_slots(&self) -> BTreeSet<SlotId> {
        let mut seen = BTreeSet::new();
        let mut shared = BTreeSet::new();
        for node in &self.nodes {
            for &slot in &node.slots {
                if !seen.insert(slot) {
                    shared.insert(slot);
                }
            }
        }
        shared
    }
}

/// Runs the simulate command.
pub fn run(config_path: &Path, duration: u64, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::load(config_path)?;
    if config.nodes.is_empty() {
        return Err("cluster config lists no nodes".into());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(simulate(&config, Duration::from_secs(duration)))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Runs the cluster for `duration` and collects the outcome.
pub async fn simulate(
    config: &ClusterConfig,
    duration: Duration,
) -> Result<SimulationResult, Box<dyn std::error::Error>> {
    let cluster = config.build()?;
    tracing::info!(
        nodes = config.nodes.len(),
        secs = duration.as_secs(),
        "starting simulation"
    );
    cluster.start();
    tokio::time::sleep(duration).await;
    cluster.shutdown().await;

    let (converged_slots, diverged_slots) = config
        .shared_slots()
        .into_iter()
        .partition(|&slot| cluster.is_converged(slot));
    let nodes = cluster
        .nodes()
        .map(|node| NodeResult {
            id: node.id(),
            blobs: node.slots().iter().map(|&s| node.blob_list(s).len()).sum(),
            stats: node.node().stats(),
        })
        .collect();

    Ok(SimulationResult {
        duration_secs: duration.as_secs(),
        converged_slots,
        diverged_slots,
        nodes,
    })
}

fn print_text_output(result: &SimulationResult) {
    println!("Simulated {} s", result.duration_secs);
    println!();
    println!("Converged slots: {:?}", result.converged_slots);
    if !result.diverged_slots.is_empty() {
        println!("Diverged slots:  {:?}", result.diverged_slots);
    }
    println!();
    println!(
        "{:>6} {:>6} {:>9} {:>9} {:>9} {:>8} {:>6}",
        "node", "blobs", "active", "passive", "commit", "cancel", "cleans"
    );
    for node in &result.nodes {
        let s = &node.stats;
        println!(
            "{:>6} {:>6} {:>9} {:>9} {:>9} {:>8} {:>6}",
            node.id,
            node.blobs,
            s.active_sessions_started,
            s.passive_sessions_started,
            s.sessions_committed,
            s.sessions_cancelled,
            s.log_cleans
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "settings": { "periodic_sync_interval_ms": 200 },
        "nodes": [
            { "id": 1, "slots": [1, 2], "blobs": [
                { "slot": 1, "key": "a", "create_time": 5, "data": "alpha" }
            ]},
            { "id": 2, "slots": [2, 3] },
            { "id": 3, "slots": [1, 3], "blobs": [
                { "slot": 3, "key": "c", "create_time": 7 }
            ]}
        ]
    }"#;

    #[test]
    fn parses_config_with_defaults() {
        let config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.settings.periodic_sync_interval_ms, 200);
        assert_eq!(config.settings.workers, 2);
        assert_eq!(config.max_active_syncs, DEFAULT_MAX_ACTIVE_SYNCS);
        assert_eq!(config.nodes[0].blobs[0].data, "alpha");
        assert_eq!(
            config.shared_slots().into_iter().collect::<Vec<_>>(),
            [1, 2, 3]
        );
    }

    #[test]
    fn rejects_blob_outside_served_slots() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{ "nodes": [ { "id": 1, "slots": [1], "blobs": [
                { "slot": 9, "key": "x", "create_time": 1 } ] } ] }"#,
        )
        .unwrap();
        assert!(config.build().is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<ClusterConfig, _> =
            serde_json::from_str(r#"{ "nodes": [], "extra": true }"#);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn simulation_converges() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();
        config.report_dir = Some(dir.path().to_path_buf());

        let result = simulate(&config, Duration::from_secs(20)).await.unwrap();
        assert_eq!(result.converged_slots, [1, 2, 3]);
        assert!(result.diverged_slots.is_empty());
        assert!(result.nodes.iter().all(|n| n.stats.sessions_committed > 0));
        assert!(dir.path().join("node-1.jsonl").exists());
    }
}
