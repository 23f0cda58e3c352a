//! Node Orchestration
//!
//! Wires one node together: store, consensus core, dispatcher, failure
//! detector, clock sync, and the ordering buffer, plus the background tasks
//! that drive them. The apply loop is the single consumer of committed
//! indices and the only owner of the ordering buffer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::client::PeerClient;
use crate::cluster::{
    catch_up, Dispatcher, HealthMonitor, RaftNode, SendReceipt,
};
use crate::config::NodeConfig;
use crate::error::ClusterError;
use crate::server::api::StatusResponse;
use crate::storage::{LogEntry, LogStore, Message, QueryPage};
use crate::timing::{
    wall_clock_secs, ClockSync, ClockSyncStats, OrderingBuffer, OrderingStats, ReleasedMessage,
};

/// Floor for the ordering ticker so an imminent deadline cannot spin it.
const ORDERING_TICK_FLOOR: Duration = Duration::from_millis(10);
/// Idle ordering tick when the buffer is empty.
const ORDERING_TICK_IDLE: Duration = Duration::from_millis(250);
/// Grace before the startup catch-up, so a leader can emerge first.
const STARTUP_CATCHUP_DELAY: Duration = Duration::from_millis(1500);
/// Cap on entries served per catch-up batch.
const SYNC_BATCH_LIMIT: usize = 500;
/// Query page defaults.
const DEFAULT_QUERY_LIMIT: usize = 100;
const MAX_QUERY_LIMIT: usize = 1000;

/// One cluster node: every subsystem plus its background tasks.
pub struct Node {
    config: NodeConfig,
    store: Arc<LogStore>,
    raft: Arc<RaftNode>,
    dispatcher: Dispatcher,
    health: Arc<HealthMonitor>,
    clock: Arc<ClockSync>,
    client: Arc<PeerClient>,
    /// Owned by the apply loop; status reads take brief snapshots
    ordering: Mutex<OrderingBuffer>,
    ordering_wake: Notify,
}

impl Node {
    /// Open the store, recover consensus state, and assemble the node.
    /// Background tasks start with [`Node::start`].
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, ClusterError> {
        let store = Arc::new(LogStore::open(&config.data_dir)?);
        let client = Arc::new(PeerClient::from_config(&config));
        let raft = RaftNode::new(config.clone(), Arc::clone(&store), client.clone())?;
        let clock = Arc::new(ClockSync::new(
            config.time_sample_history,
            config.time_max_offset,
            config.time_accuracy_threshold,
            config.max_future_skew,
        ));
        let health = Arc::new(HealthMonitor::new(&config.peers, config.failure_threshold));
        let dispatcher = Dispatcher::new(
            Arc::clone(&raft),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.replication_mode,
            config.sync_wait,
        );
        let ordering = Mutex::new(OrderingBuffer::new(
            config.hold_back,
            config.ordering_capacity,
        ));

        info!(
            node_id = %config.node_id,
            peers = config.peers.len(),
            mode = ?config.replication_mode,
            quorum = config.quorum_size(),
            "node assembled"
        );
        Ok(Arc::new(Self {
            config,
            store,
            raft,
            dispatcher,
            health,
            clock,
            client,
            ordering,
            ordering_wake: Notify::new(),
        }))
    }

    /// Spawn the election timer, apply loop, failure detector, time-sync
    /// ticker, ordering ticker, and the startup catch-up.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.raft).run_election_timer());
        tokio::spawn(Arc::clone(self).run_apply_loop());
        tokio::spawn(Arc::clone(self).run_failure_detector());
        tokio::spawn(Arc::clone(self).run_time_sync());
        tokio::spawn(Arc::clone(self).run_ordering_ticker());

        if !self.config.peers.is_empty() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(STARTUP_CATCHUP_DELAY).await;
                node.run_catch_up("startup").await;
            });
        }
    }

    /// Flip the shutdown flag; tasks drain and exit.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.raft.begin_shutdown();
    }

    /// True once a durable write failed and the node stopped serving.
    pub fn is_fatal(&self) -> bool {
        self.raft.is_fatal()
    }

    // ------------------------------------------------------------------
    // Request surface used by the HTTP handlers
    // ------------------------------------------------------------------

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Consensus core.
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Clock sync subsystem.
    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    /// Submit a client message through the configured commit policy.
    pub async fn submit(&self, message: Message) -> Result<SendReceipt, ClusterError> {
        self.dispatcher.submit(message).await
    }

    /// Paginated, filtered read over the applied prefix.
    pub fn query_messages(
        &self,
        after: u64,
        limit: Option<usize>,
        sender: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<QueryPage, ClusterError> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let applied = self.store.applied_index()?;
        Ok(self.store.range(after, applied, limit, sender, recipient)?)
    }

    /// Serve committed entries for a catching-up peer.
    pub fn entries_for_sync(
        &self,
        after: u64,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, ClusterError> {
        let limit = limit.unwrap_or(SYNC_BATCH_LIMIT).min(SYNC_BATCH_LIMIT);
        let applied = self.store.applied_index()?;
        Ok(self.store.entries_after(after, applied, limit)?)
    }

    /// Install committed entries pushed by a peer.
    pub async fn install_entries(&self, entries: Vec<LogEntry>) -> Result<u64, ClusterError> {
        self.raft.install_committed(entries).await
    }

    /// Ordering buffer snapshot.
    pub fn ordering_stats(&self) -> OrderingStats {
        self.ordering.lock().stats()
    }

    /// Operator escape hatch: flush the ordering buffer now.
    pub fn force_delivery(&self) -> Vec<ReleasedMessage> {
        self.ordering.lock().force_delivery()
    }

    /// Clock sync snapshot.
    pub fn time_stats(&self) -> ClockSyncStats {
        self.clock.stats()
    }

    /// Full node status for `/status`.
    pub fn status(&self) -> Result<StatusResponse, ClusterError> {
        let raft = self.raft.status();
        Ok(StatusResponse {
            node_id: raft.node_id,
            role: raft.role,
            term: raft.term,
            leader_id: raft.leader_id,
            leader_url: raft.leader_url,
            commit_index: raft.commit_index,
            applied_index: self.store.applied_index()?,
            last_log_index: raft.last_log_index,
            replication_mode: self.dispatcher.mode(),
            quorum: self.config.quorum_size(),
            peers: self.health.snapshot(),
            time: self.clock.stats(),
            ordering: self.ordering_stats(),
        })
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Single-threaded apply loop: consumes committed indices in order,
    /// corrects timestamps, persists, and feeds the ordering buffer.
    async fn run_apply_loop(self: Arc<Self>) {
        let mut commits = self.raft.subscribe_commit();
        let mut shutdown = self.raft.subscribe_shutdown();
        loop {
            let target = *commits.borrow_and_update();
            if let Err(e) = self.apply_up_to(target) {
                error!("apply loop stopping: {e}");
                self.raft.begin_shutdown();
                return;
            }
            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    // Drain whatever committed before the flag flipped.
                    let target = *commits.borrow();
                    if let Err(e) = self.apply_up_to(target) {
                        error!("final drain failed: {e}");
                    }
                    debug!("apply loop drained and stopped");
                    return;
                }
            }
        }
    }

    fn apply_up_to(&self, commit: u64) -> Result<(), ClusterError> {
        let mut applied = self.store.applied_index()?;
        while applied < commit {
            let index = applied + 1;
            let entry = match self.raft.log_entry(index) {
                Some(entry) => entry,
                None => self
                    .store
                    .get(index)?
                    .ok_or(crate::error::StoreError::Missing(index))?,
            };
            // Ingress already validated the timestamp; our own clock being
            // behind must not block the state machine here.
            let corrected = self.clock.correct_unchecked(entry.message.original_ts);
            let first = self.store.apply(index, corrected)?;
            if first {
                let mut message = entry.message.clone();
                message.corrected_ts = Some(corrected);
                message.seq = index;
                if self.ordering.lock().insert(message) {
                    self.ordering_wake.notify_one();
                }
            } else {
                debug!(index, msg_id = %entry.message.msg_id, "duplicate absorbed at apply");
            }
            applied = index;
        }
        Ok(())
    }

    /// Wakes on the earliest hold-back deadline and cuts delivery records.
    async fn run_ordering_ticker(self: Arc<Self>) {
        let mut shutdown = self.raft.subscribe_shutdown();
        loop {
            let sleep_for = match self.ordering.lock().next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .max(ORDERING_TICK_FLOOR),
                None => ORDERING_TICK_IDLE,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.ordering_wake.notified() => {}
                _ = shutdown.changed() => return,
            }
            let released = self.ordering.lock().drain_ready(Instant::now());
            for record in &released {
                debug!(
                    sender = %record.sender,
                    msg_id = %record.msg_id,
                    seq = record.seq,
                    "delivered"
                );
            }
        }
    }

    /// Probes every peer on a fixed tick and triggers catch-up on recovery.
    async fn run_failure_detector(self: Arc<Self>) {
        let mut shutdown = self.raft.subscribe_shutdown();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval) => {}
                _ = shutdown.changed() => return,
            }
            let probes = self.config.peers.iter().map(|peer| {
                let client = Arc::clone(&self.client);
                let peer = peer.clone();
                async move {
                    let result = client.heartbeat(&peer).await;
                    (peer, result)
                }
            });
            for (peer, result) in futures::future::join_all(probes).await {
                match result {
                    Ok(_) => {
                        if self.health.record_success(&peer) {
                            info!(peer = %peer, "peer recovered, catching up");
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                node.run_catch_up("peer recovery").await;
                            });
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer, "probe failed: {e}");
                        if self.health.record_failure(&peer) {
                            warn!(peer = %peer, "peer marked dead");
                        }
                    }
                }
            }
        }
    }

    /// NTP-style exchange with every alive peer on a fixed tick.
    async fn run_time_sync(self: Arc<Self>) {
        let mut shutdown = self.raft.subscribe_shutdown();
        loop {
            for peer in self.health.alive_peers() {
                let t1 = wall_clock_secs();
                match self.client.time_exchange(&peer, t1).await {
                    Ok(resp) => {
                        let t4 = wall_clock_secs();
                        if self
                            .clock
                            .record_exchange(&peer, t1, resp.receive_ts, resp.transmit_ts, t4)
                            .is_none()
                        {
                            debug!(peer = %peer, "clock sample discarded");
                        }
                    }
                    Err(e) => debug!(peer = %peer, "time exchange failed: {e}"),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.time_sync_interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_catch_up(&self, cause: &str) {
        let raft = Arc::clone(&self.raft);
        match catch_up(&raft, self.client.as_ref(), &self.config.peers).await {
            Ok(0) => debug!(cause, "catch-up: nothing missing"),
            Ok(installed) => info!(cause, installed, "catch-up installed entries"),
            Err(e) => debug!(cause, "catch-up unavailable: {e}"),
        }
    }
}
