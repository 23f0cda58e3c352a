//! Common test utilities: in-process cluster wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use relaymq::cluster::{
    AppendEntriesRequest, AppendEntriesResponse, CatchUpSource, PeerTransport, VoteRequest,
    VoteResponse,
};
use relaymq::{ClusterError, LogEntry, LogStore, NodeConfig, RaftNode, Role};

/// Routes consensus RPCs directly to in-process nodes, with a switch to
/// take nodes "off the network".
pub struct LocalRouter {
    nodes: RwLock<HashMap<String, Arc<RaftNode>>>,
    down: RwLock<HashSet<String>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
        })
    }

    pub fn register(&self, url: &str, node: Arc<RaftNode>) {
        self.nodes.write().insert(url.to_string(), node);
    }

    /// Take a node off the network (both directions fail).
    pub fn set_down(&self, url: &str, down: bool) {
        if down {
            self.down.write().insert(url.to_string());
        } else {
            self.down.write().remove(url);
        }
    }

    fn get(&self, peer: &str) -> Result<Arc<RaftNode>, ClusterError> {
        if self.down.read().contains(peer) {
            return Err(ClusterError::TransientNetwork(format!("{peer} is down")));
        }
        self.nodes
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| ClusterError::TransientNetwork(format!("{peer} unknown")))
    }
}

#[async_trait]
impl PeerTransport for LocalRouter {
    async fn request_vote(
        &self,
        peer: &str,
        req: &VoteRequest,
    ) -> Result<VoteResponse, ClusterError> {
        self.get(peer)?.handle_request_vote(req.clone()).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, ClusterError> {
        self.get(peer)?.handle_append_entries(req.clone()).await
    }
}

/// Catch-up source that serves a peer's committed entries from its
/// in-memory log. Ignores the router's down switch: a rejoining node can
/// dial out before the leader's replication notices it is back.
pub struct RouterSource {
    pub router: Arc<LocalRouter>,
}

#[async_trait]
impl CatchUpSource for RouterSource {
    async fn entries_after(
        &self,
        peer: &str,
        after: u64,
    ) -> Result<Vec<LogEntry>, ClusterError> {
        let node = self
            .router
            .nodes
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| ClusterError::TransientNetwork(format!("{peer} unknown")))?;
        let commit = node.commit_index();
        let mut entries = Vec::new();
        let mut index = after + 1;
        while index <= commit && entries.len() < 100 {
            match node.log_entry(index) {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(entries)
    }
}

/// An in-process consensus cluster wired through a `LocalRouter`.
pub struct TestCluster {
    pub router: Arc<LocalRouter>,
    pub nodes: Vec<Arc<RaftNode>>,
    pub stores: Vec<Arc<LogStore>>,
    pub urls: Vec<String>,
    pub temps: Vec<TempDir>,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        let router = LocalRouter::new();
        // Matches each node's advertise_url so redirects name real peers.
        let urls: Vec<String> = (0..size).map(|i| format!("http://node-{i}:80")).collect();

        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        let mut temps = Vec::new();
        for i in 0..size {
            let temp = TempDir::new().unwrap();
            let config = NodeConfig {
                node_id: format!("node-{i}"),
                host: format!("node-{i}"),
                port: 80,
                peers: urls
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, u)| u.clone())
                    .collect(),
                data_dir: temp.path().to_path_buf(),
                // Long timers: tests drive elections explicitly.
                election_timeout_ms: (60_000, 120_000),
                ..Default::default()
            };
            let store = Arc::new(LogStore::open(temp.path()).unwrap());
            let transport: Arc<dyn PeerTransport> = Arc::clone(&router) as Arc<dyn PeerTransport>;
            let node = RaftNode::new(config, Arc::clone(&store), transport).unwrap();
            router.register(&urls[i], Arc::clone(&node));
            nodes.push(node);
            stores.push(store);
            temps.push(temp);
        }

        Self { router, nodes, stores, urls, temps }
    }

    /// The advertise URL the cluster knows node `i` by.
    pub fn url(&self, i: usize) -> &str {
        &self.urls[i]
    }

    /// Indexes of nodes currently reporting Leader.
    pub fn leaders(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.role() == Role::Leader)
            .map(|(i, _)| i)
            .collect()
    }

    /// Wait until node `i`'s commit index reaches `target`.
    pub async fn await_commit(&self, i: usize, target: u64, wait: Duration) -> bool {
        let mut rx = self.nodes[i].subscribe_commit();
        tokio::time::timeout(wait, async {
            loop {
                if *rx.borrow_and_update() >= target {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && self.nodes[i].commit_index() >= target
    }
}
