//! # RelayMQ - Fault-Tolerant Distributed Messaging
//!
//! RelayMQ is a small cluster of peer nodes that accepts client messages,
//! commits them through a leader-based replicated log, applies clock
//! correction and per-sender ordering, and exposes each node's committed
//! log through a paginated query interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     HTTP API (JSON)                             │
//! │   /send /messages /status · consensus RPCs · time · ordering    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Cluster Layer                               │
//! │   ├── Consensus core (election, replication, commit)            │
//! │   ├── Replication dispatcher (async / sync_quorum)              │
//! │   ├── Failure detector (probes, liveness map)                   │
//! │   └── Catch-up (rejoin sync from any reachable peer)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Apply Pipeline                              │
//! │   ├── Clock sync (NTP-style offset + drift correction)          │
//! │   └── Ordering buffer (per-sender hold-back window)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Durable Log Store (redb)                    │
//! │   log · msg_id dedup index · consensus metadata                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relaymq::{Node, NodeConfig, ApiServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = NodeConfig {
//!         node_id: "node-a".into(),
//!         port: 7600,
//!         peers: vec!["http://127.0.0.1:7601".into()],
//!         ..Default::default()
//!     };
//!     let node = Node::new(config)?;
//!     node.start();
//!     ApiServer::new(node)?.run().await
//! }
//! ```
//!
//! Every node runs the same components; clients may talk to any of them and
//! are redirected to the leader for writes. Committed messages carry a
//! dense cluster-wide `seq`, their original timestamp, and a per-node
//! corrected timestamp.

#![warn(missing_docs)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod server;
pub mod storage;
pub mod timing;

// Re-exports for convenience
pub use client::PeerClient;
pub use cluster::{
    catch_up, CatchUpSource, Dispatcher, HealthMonitor, PeerHealth, PeerTransport, RaftNode,
    RaftStatus, Role, SendReceipt,
};
pub use config::{NodeConfig, ReplicationMode};
pub use error::{ClusterError, StoreError, TimeError};
pub use node::Node;
pub use server::ApiServer;
pub use storage::{LogEntry, LogStore, Message, QueryPage};
pub use timing::{ClockSync, ClockSyncStats, OrderingBuffer, OrderingStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_timing_contract() {
        let config = NodeConfig::default();
        assert_eq!(config.election_timeout_ms, (300, 600));
        assert_eq!(config.heartbeat_interval.as_millis(), 200);
        assert!(config.rpc_timeout < std::time::Duration::from_millis(300));
    }
}
