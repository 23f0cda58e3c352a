//! Node Configuration
//!
//! All tunables for a single cluster node. Defaults follow the protocol
//! timing contract: elections fire after 300-600ms of leader silence,
//! heartbeats every 200ms, peer probes every 5s, clock sync every 30s.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Commit policy for client writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Acknowledge once the leader's own append is durable
    #[value(name = "async")]
    Async,
    /// Block until a quorum has replicated the entry
    #[value(name = "sync_quorum")]
    SyncQuorum,
}

/// Configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable node identifier
    pub node_id: String,
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Peer base URLs (excluding this node)
    pub peers: Vec<String>,
    /// Directory for the durable store
    pub data_dir: PathBuf,
    /// Commit policy
    pub replication_mode: ReplicationMode,
    /// Quorum size override; majority of the cluster when unset
    pub quorum: Option<usize>,
    /// Election timeout range in milliseconds, drawn uniformly
    pub election_timeout_ms: (u64, u64),
    /// Leader heartbeat interval
    pub heartbeat_interval: Duration,
    /// Deadline for consensus RPCs; must stay under the election timeout
    pub rpc_timeout: Duration,
    /// Failure detector probe interval
    pub probe_interval: Duration,
    /// Failure detector probe deadline
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a peer is marked dead
    pub failure_threshold: u32,
    /// Clock sync exchange interval
    pub time_sync_interval: Duration,
    /// Bounded per-peer clock sample history
    pub time_sample_history: usize,
    /// Discard samples with |offset| above this many seconds
    pub time_max_offset: f64,
    /// `synchronized` requires residual spread below this many seconds
    pub time_accuracy_threshold: f64,
    /// Reject timestamps further than this many seconds in the future
    pub max_future_skew: f64,
    /// Ordering buffer hold-back window
    pub hold_back: Duration,
    /// Ordering buffer soft capacity, for the utilization metric
    pub ordering_capacity: usize,
    /// How long sync_quorum waits for the commit index
    pub sync_wait: Duration,
    /// Deadline for catch-up fetches
    pub catchup_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            host: "127.0.0.1".to_string(),
            port: 7600,
            peers: Vec::new(),
            data_dir: PathBuf::from("./relaymq-data"),
            replication_mode: ReplicationMode::Async,
            quorum: None,
            election_timeout_ms: (300, 600),
            heartbeat_interval: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(150),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 2,
            time_sync_interval: Duration::from_secs(30),
            time_sample_history: 32,
            time_max_offset: 60.0,
            time_accuracy_threshold: 0.1,
            max_future_skew: 2.0,
            hold_back: Duration::from_secs(5),
            ordering_capacity: 10_000,
            sync_wait: Duration::from_secs(10),
            catchup_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Total cluster size including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Effective quorum: the override, or a strict majority.
    pub fn quorum_size(&self) -> usize {
        self.quorum.unwrap_or(self.cluster_size() / 2 + 1)
    }

    /// Base URL this node is reachable at.
    pub fn advertise_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
