//! Replicated Log Consensus
//!
//! A single-leader replicated log in the Raft style. Every node starts as a
//! follower; a randomized election timer promotes it to candidate when the
//! leader goes silent; a majority of votes makes it leader. Leaders append
//! client messages to their log, fan them out through per-peer replication
//! workers, and advance the commit index once a quorum matches.
//!
//! Lock discipline: all mutable consensus state lives in one
//! `Mutex<RaftState>` that is never held across I/O. Mutating paths
//! additionally serialize through an async write gate so durable writes hit
//! the store in the same order the in-memory state changed. Vote grants and
//! append acknowledgements are only sent after the state they promise is on
//! disk; a failed durable write is fatal and stops the node.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::cluster::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, PeerTransport, VoteRequest, VoteResponse,
};
use crate::config::NodeConfig;
use crate::error::ClusterError;
use crate::storage::{LogEntry, LogStore, Message, PersistOps};

/// Cap on entries shipped in one AppendEntries batch.
const REPLICATION_BATCH: usize = 256;

/// Node role in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Receiving updates from a leader
    Follower,
    /// Running an election
    Candidate,
    /// Coordinating writes and replication
    Leader,
}

/// Mutable consensus state, guarded as one critical section.
struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    leader_id: Option<String>,
    leader_url: Option<String>,
    last_heartbeat: Instant,
    /// Leader only: next log index to send each peer
    next_index: HashMap<String, u64>,
    /// Leader only: highest index known replicated on each peer
    match_index: HashMap<String, u64>,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }
}

/// Point-in-time view of the consensus state for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStatus {
    /// This node's id
    pub node_id: String,
    /// Current role
    pub role: Role,
    /// Current term
    pub term: u64,
    /// Best-known leader id
    pub leader_id: Option<String>,
    /// Best-known leader base URL
    pub leader_url: Option<String>,
    /// Highest index known committed
    pub commit_index: u64,
    /// Highest index in the local log
    pub last_log_index: u64,
    /// Term of the last local entry
    pub last_log_term: u64,
}

/// The consensus core of one node.
pub struct RaftNode {
    config: NodeConfig,
    store: Arc<LogStore>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<RaftState>,
    /// Serializes mutating paths so disk order matches state order
    write_gate: tokio::sync::Mutex<()>,
    commit_tx: watch::Sender<u64>,
    replicate: Notify,
    shutdown_tx: watch::Sender<bool>,
    fatal: AtomicBool,
}

impl RaftNode {
    /// Recover consensus state from the store and build the core.
    pub fn new(
        config: NodeConfig,
        store: Arc<LogStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, ClusterError> {
        let meta = store.get_meta()?;
        let log = store.load_log()?;
        let applied = store.applied_index()?;
        info!(
            term = meta.current_term,
            log_len = log.len(),
            applied,
            "consensus state recovered"
        );

        let (commit_tx, _) = watch::channel(applied);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term: meta.current_term,
                voted_for: meta.voted_for,
                log,
                commit_index: applied,
                leader_id: None,
                leader_url: None,
                last_heartbeat: Instant::now(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
            }),
            config,
            store,
            transport,
            write_gate: tokio::sync::Mutex::new(()),
            commit_tx,
            replicate: Notify::new(),
            shutdown_tx,
            fatal: AtomicBool::new(false),
        }))
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    /// Answer a RequestVote RPC. The grant is durable before it is returned.
    pub async fn handle_request_vote(
        &self,
        req: VoteRequest,
    ) -> Result<VoteResponse, ClusterError> {
        let _gate = self.write_gate.lock().await;
        let (resp, ops) = {
            let mut s = self.state.lock();
            self.vote_transition(&mut s, &req)
        };
        self.persist(&ops)?;
        Ok(resp)
    }

    fn vote_transition(
        &self,
        s: &mut RaftState,
        req: &VoteRequest,
    ) -> (VoteResponse, PersistOps) {
        let mut ops = PersistOps::default();

        if req.term > s.current_term {
            debug!(from = s.current_term, to = req.term, "adopting higher term from vote request");
            s.current_term = req.term;
            s.voted_for = None;
            s.role = Role::Follower;
            s.leader_id = None;
            s.leader_url = None;
            ops.meta = Some((req.term, None));
        }

        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (s.last_log_term(), s.last_log_index());
        let granted = req.term == s.current_term
            && s.voted_for.as_deref().map_or(true, |v| v == req.candidate_id)
            && up_to_date;

        if granted {
            s.voted_for = Some(req.candidate_id.clone());
            s.last_heartbeat = Instant::now();
            ops.meta = Some((s.current_term, Some(req.candidate_id.clone())));
            info!(candidate = %req.candidate_id, term = s.current_term, "vote granted");
        }

        (
            VoteResponse { term: s.current_term, vote_granted: granted },
            ops,
        )
    }

    /// Answer an AppendEntries RPC (replication or heartbeat). Accepted
    /// entries and any truncation they caused are durable before the reply.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, ClusterError> {
        let _gate = self.write_gate.lock().await;
        let (resp, ops, new_commit) = {
            let mut s = self.state.lock();
            self.append_transition(&mut s, req)
        };
        self.persist(&ops)?;
        if let Some(commit) = new_commit {
            self.publish_commit(commit);
        }
        Ok(resp)
    }

    fn append_transition(
        &self,
        s: &mut RaftState,
        req: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, PersistOps, Option<u64>) {
        let mut ops = PersistOps::default();

        if req.term < s.current_term {
            return (
                AppendEntriesResponse {
                    term: s.current_term,
                    success: false,
                    match_index: 0,
                },
                ops,
                None,
            );
        }

        if req.term > s.current_term {
            s.current_term = req.term;
            s.voted_for = None;
            ops.meta = Some((req.term, None));
        }
        if s.role != Role::Follower {
            info!(term = s.current_term, leader = %req.leader_id, "stepping down to follower");
        }
        s.role = Role::Follower;
        s.leader_id = Some(req.leader_id.clone());
        s.leader_url = Some(req.leader_url.clone());
        s.last_heartbeat = Instant::now();

        // The log must contain the entry the batch chains onto.
        if req.prev_log_index > 0 {
            match s.entry_at(req.prev_log_index) {
                None => {
                    return (
                        AppendEntriesResponse {
                            term: s.current_term,
                            success: false,
                            match_index: s.last_log_index(),
                        },
                        ops,
                        None,
                    );
                }
                Some(entry) if entry.term != req.prev_log_term => {
                    // The chain point itself conflicts: drop it and the tail.
                    s.log.truncate((req.prev_log_index - 1) as usize);
                    ops.truncate_from = Some(req.prev_log_index);
                    warn!(
                        index = req.prev_log_index,
                        "truncated conflicting log tail"
                    );
                    return (
                        AppendEntriesResponse {
                            term: s.current_term,
                            success: false,
                            match_index: s.last_log_index(),
                        },
                        ops,
                        None,
                    );
                }
                Some(_) => {}
            }
        }

        for entry in req.entries {
            match s.entry_at(entry.index) {
                Some(local) if local.term == entry.term => continue,
                Some(_) => {
                    s.log.truncate((entry.index - 1) as usize);
                    ops.truncate_from.get_or_insert(entry.index);
                    warn!(index = entry.index, "replaced conflicting entries");
                    s.log.push(entry.clone());
                    ops.append.push(entry);
                }
                None => {
                    s.log.push(entry.clone());
                    ops.append.push(entry);
                }
            }
        }

        let last_new = s.last_log_index();
        let mut new_commit = None;
        if req.leader_commit > s.commit_index {
            s.commit_index = req.leader_commit.min(last_new);
            new_commit = Some(s.commit_index);
        }

        (
            AppendEntriesResponse {
                term: s.current_term,
                success: true,
                match_index: last_new,
            },
            ops,
            new_commit,
        )
    }

    // ------------------------------------------------------------------
    // Leader write path
    // ------------------------------------------------------------------

    /// Append a client message to the leader's log. Durable on the leader
    /// before returning; replication workers are woken to fan it out.
    /// Returns the entry's `(term, index)`.
    pub async fn leader_append(&self, message: Message) -> Result<(u64, u64), ClusterError> {
        let _gate = self.write_gate.lock().await;
        let (entry, term, index) = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return Err(self.not_leader_error(&s));
            }
            let term = s.current_term;
            let index = s.last_log_index() + 1;
            let entry = LogEntry::new(term, index, message);
            s.log.push(entry.clone());
            (entry, term, index)
        };
        self.persist(&PersistOps { append: vec![entry], ..Default::default() })?;
        self.replicate.notify_waiters();

        // A cluster of one (or quorum 1) commits on the local append alone.
        let committed = {
            let mut s = self.state.lock();
            self.advance_commit_locked(&mut s)
        };
        if let Some(commit) = committed {
            self.publish_commit(commit);
        }
        Ok((term, index))
    }

    fn not_leader_error(&self, s: &RaftState) -> ClusterError {
        match &s.leader_url {
            Some(url) => ClusterError::NotLeader { leader_url: Some(url.clone()) },
            None => ClusterError::NoLeader,
        }
    }

    /// Scan the log past `after` for a message id; dedup for entries the
    /// applied msg_id index does not cover yet.
    pub fn find_msg_id_after(&self, after: u64, msg_id: &str) -> Option<u64> {
        let s = self.state.lock();
        s.log
            .iter()
            .skip(after as usize)
            .find(|e| e.message.msg_id == msg_id)
            .map(|e| e.index)
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    /// Election timer loop: fires after a randomized silence interval.
    pub async fn run_election_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let (min, max) = self.config.election_timeout_ms;
            let timeout = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(min..=max))
            };
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shutdown.changed() => return,
            }
            let due = {
                let s = self.state.lock();
                s.role != Role::Leader && s.last_heartbeat.elapsed() >= timeout
            };
            if due {
                if let Err(e) = self.start_election().await {
                    error!("election aborted: {e}");
                    if self.is_fatal() {
                        return;
                    }
                }
            }
        }
    }

    /// Run one election round. Returns true when this node won.
    pub async fn start_election(self: &Arc<Self>) -> Result<bool, ClusterError> {
        let (req, term) = {
            let _gate = self.write_gate.lock().await;
            let (req, ops) = {
                let mut s = self.state.lock();
                s.role = Role::Candidate;
                s.current_term += 1;
                s.voted_for = Some(self.config.node_id.clone());
                s.leader_id = None;
                s.leader_url = None;
                s.last_heartbeat = Instant::now();
                let req = VoteRequest {
                    term: s.current_term,
                    candidate_id: self.config.node_id.clone(),
                    last_log_index: s.last_log_index(),
                    last_log_term: s.last_log_term(),
                };
                let ops = PersistOps {
                    meta: Some((s.current_term, Some(self.config.node_id.clone()))),
                    ..Default::default()
                };
                (req, ops)
            };
            self.persist(&ops)?;
            let term = req.term;
            (req, term)
        };
        info!(term, "starting election");

        let responses = futures::future::join_all(self.config.peers.iter().map(|peer| {
            let req = req.clone();
            let transport = Arc::clone(&self.transport);
            let peer = peer.clone();
            async move { transport.request_vote(&peer, &req).await }
        }))
        .await;

        let mut granted = 1usize; // our own vote
        let mut highest = term;
        for resp in responses.into_iter().flatten() {
            if resp.vote_granted {
                granted += 1;
            }
            highest = highest.max(resp.term);
        }

        if highest > term {
            self.step_down_to(highest).await?;
            return Ok(false);
        }

        let majority = self.config.cluster_size() / 2 + 1;
        if granted >= majority {
            self.become_leader(term);
            Ok(true)
        } else {
            debug!(term, granted, majority, "election did not reach majority");
            Ok(false)
        }
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        let peers = {
            let mut s = self.state.lock();
            if s.role != Role::Candidate || s.current_term != term {
                return;
            }
            s.role = Role::Leader;
            s.leader_id = Some(self.config.node_id.clone());
            s.leader_url = Some(self.config.advertise_url());
            let next = s.last_log_index() + 1;
            s.next_index.clear();
            s.match_index.clear();
            for peer in &self.config.peers {
                s.next_index.insert(peer.clone(), next);
                s.match_index.insert(peer.clone(), 0);
            }
            self.config.peers.clone()
        };
        info!(term, "won election, now leader");

        for peer in peers {
            tokio::spawn(Arc::clone(self).run_replicator(peer, term));
        }

        let committed = {
            let mut s = self.state.lock();
            self.advance_commit_locked(&mut s)
        };
        if let Some(commit) = committed {
            self.publish_commit(commit);
        }
    }

    /// Adopt a higher term observed on the wire and drop to follower.
    pub async fn step_down_to(&self, term: u64) -> Result<(), ClusterError> {
        let _gate = self.write_gate.lock().await;
        let ops = {
            let mut s = self.state.lock();
            if term <= s.current_term {
                None
            } else {
                s.current_term = term;
                s.voted_for = None;
                s.role = Role::Follower;
                s.leader_id = None;
                s.leader_url = None;
                Some(PersistOps { meta: Some((term, None)), ..Default::default() })
            }
        };
        if let Some(ops) = ops {
            info!(term, "stepping down: higher term observed");
            self.persist(&ops)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replication (leader)
    // ------------------------------------------------------------------

    /// Per-peer replication worker. Sends immediately on spawn, then on
    /// every append notification and heartbeat tick. Exits when this node
    /// stops being the leader for `term`.
    pub async fn run_replicator(self: Arc<Self>, peer: String, term: u64) {
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!(peer = %peer, term, "replication worker started");
        loop {
            let req = {
                let s = self.state.lock();
                if s.role != Role::Leader || s.current_term != term {
                    debug!(peer = %peer, term, "replication worker exiting");
                    return;
                }
                self.build_append_request(&s, &peer)
            };

            match self.transport.append_entries(&peer, &req).await {
                Ok(resp) => {
                    if !self.process_append_response(&peer, term, &req, resp).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, "append_entries failed: {e}");
                }
            }

            tokio::select! {
                _ = self.replicate.notified() => {}
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    fn build_append_request(&self, s: &RaftState, peer: &str) -> AppendEntriesRequest {
        let next = s.next_index.get(peer).copied().unwrap_or(s.last_log_index() + 1);
        let prev_log_index = next - 1;
        let prev_log_term = s.entry_at(prev_log_index).map(|e| e.term).unwrap_or(0);
        let entries: Vec<LogEntry> = s
            .log
            .iter()
            .skip(prev_log_index as usize)
            .take(REPLICATION_BATCH)
            .cloned()
            .collect();
        AppendEntriesRequest {
            term: s.current_term,
            leader_id: self.config.node_id.clone(),
            leader_url: self.config.advertise_url(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: s.commit_index,
        }
    }

    /// Returns false when the worker should exit (lost leadership).
    async fn process_append_response(
        &self,
        peer: &str,
        term: u64,
        req: &AppendEntriesRequest,
        resp: AppendEntriesResponse,
    ) -> bool {
        if resp.term > term {
            if let Err(e) = self.step_down_to(resp.term).await {
                error!("step down failed: {e}");
            }
            return false;
        }

        if resp.success {
            let committed = {
                let mut s = self.state.lock();
                if s.role != Role::Leader || s.current_term != term {
                    return false;
                }
                let matched = req.prev_log_index + req.entries.len() as u64;
                let entry = s.match_index.entry(peer.to_string()).or_insert(0);
                if matched > *entry {
                    *entry = matched;
                }
                s.next_index.insert(peer.to_string(), matched + 1);
                self.advance_commit_locked(&mut s)
            };
            if let Some(commit) = committed {
                self.publish_commit(commit);
            }
            // More of the log may remain beyond this batch.
            if req.entries.len() >= REPLICATION_BATCH {
                self.replicate.notify_waiters();
            }
        } else {
            let mut s = self.state.lock();
            if s.role != Role::Leader || s.current_term != term {
                return false;
            }
            // Jump back using the follower's hint instead of one at a time.
            let next = s.next_index.entry(peer.to_string()).or_insert(1);
            *next = (resp.match_index + 1).min((*next).saturating_sub(1)).max(1);
            debug!(peer = %peer, next_index = *next, "log mismatch, backing off");
            drop(s);
            self.replicate.notify_waiters();
        }
        true
    }

    /// Advance the commit index over entries of the current term that a
    /// quorum has matched. Entries from earlier terms commit transitively.
    fn advance_commit_locked(&self, s: &mut RaftState) -> Option<u64> {
        let quorum = self.config.quorum_size();
        let mut new_commit = s.commit_index;
        for n in (s.commit_index + 1)..=s.last_log_index() {
            if s.log[(n - 1) as usize].term != s.current_term {
                continue;
            }
            let replicas = 1 + s.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                new_commit = n;
            }
        }
        if new_commit > s.commit_index {
            debug!(from = s.commit_index, to = new_commit, "commit index advanced");
            s.commit_index = new_commit;
            Some(new_commit)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Catch-up installation
    // ------------------------------------------------------------------

    /// Install committed entries fetched from a peer during catch-up.
    ///
    /// The batch must chain onto the local log with no gap. A conflict below
    /// the local commit index means divergence of committed state and is
    /// refused. Returns the new commit index.
    pub async fn install_committed(&self, entries: Vec<LogEntry>) -> Result<u64, ClusterError> {
        if entries.is_empty() {
            return Ok(self.commit_index());
        }
        let _gate = self.write_gate.lock().await;
        let (ops, new_commit) = {
            let mut s = self.state.lock();
            let mut ops = PersistOps::default();
            for entry in &entries {
                match s.entry_at(entry.index) {
                    Some(local) if local.term == entry.term => continue,
                    Some(_) => {
                        if entry.index <= s.commit_index {
                            return Err(ClusterError::LogInconsistency { index: entry.index });
                        }
                        s.log.truncate((entry.index - 1) as usize);
                        ops.truncate_from.get_or_insert(entry.index);
                        s.log.push(entry.clone());
                        ops.append.push(entry.clone());
                    }
                    None => {
                        // Committed entries never chain a lower term onto a
                        // higher one.
                        if entry.index != s.last_log_index() + 1
                            || entry.term < s.last_log_term()
                        {
                            return Err(ClusterError::LogInconsistency { index: entry.index });
                        }
                        s.log.push(entry.clone());
                        ops.append.push(entry.clone());
                    }
                }
            }
            let last = entries.last().map(|e| e.index).unwrap_or(0);
            if last > s.commit_index {
                s.commit_index = last;
            }
            (ops, s.commit_index)
        };
        self.persist(&ops)?;
        self.publish_commit(new_commit);
        Ok(new_commit)
    }

    // ------------------------------------------------------------------
    // Observation & control
    // ------------------------------------------------------------------

    /// Snapshot for the status surface.
    pub fn status(&self) -> RaftStatus {
        let s = self.state.lock();
        RaftStatus {
            node_id: self.config.node_id.clone(),
            role: s.role,
            term: s.current_term,
            leader_id: s.leader_id.clone(),
            leader_url: s.leader_url.clone(),
            commit_index: s.commit_index,
            last_log_index: s.last_log_index(),
            last_log_term: s.last_log_term(),
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// True when this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Best-known leader URL.
    pub fn leader_url(&self) -> Option<String> {
        self.state.lock().leader_url.clone()
    }

    /// Current term.
    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    /// Highest index known committed.
    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    /// In-memory copy of the entry at `index`.
    pub fn log_entry(&self, index: u64) -> Option<LogEntry> {
        self.state.lock().entry_at(index).cloned()
    }

    /// Subscribe to commit index advancement.
    pub fn subscribe_commit(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Subscribe to shutdown.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop timers and workers; used on shutdown and on fatal errors.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// True once a durable write has failed and the node stopped serving.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    fn publish_commit(&self, commit: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit > *current {
                *current = commit;
                true
            } else {
                false
            }
        });
    }

    fn persist(&self, ops: &PersistOps) -> Result<(), ClusterError> {
        if let Err(e) = self.store.persist(ops) {
            error!("durable write failed, stopping node: {e}");
            self.fatal.store(true, Ordering::SeqCst);
            self.begin_shutdown();
            return Err(ClusterError::Persistence(e));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_force_leader(self: &Arc<Self>) {
        let term = {
            let mut s = self.state.lock();
            s.role = Role::Candidate;
            s.current_term += 1;
            s.current_term
        };
        self.become_leader(term);
    }

    #[cfg(test)]
    pub(crate) fn test_set_match(&self, peer: &str, index: u64) -> Option<u64> {
        let mut s = self.state.lock();
        s.match_index.insert(peer.to_string(), index);
        self.advance_commit_locked(&mut s)
    }
}
