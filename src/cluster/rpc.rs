//! Consensus RPC Payloads
//!
//! Wire shapes for the two consensus RPCs plus the transport seam the
//! consensus core sends them through. Production wires these over JSON/HTTP;
//! tests route them in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::storage::LogEntry;

/// Request vote from peers during an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting the vote
    pub candidate_id: String,
    /// Index of the candidate's last log entry
    pub last_log_index: u64,
    /// Term of the candidate's last log entry
    pub last_log_term: u64,
}

/// Response to a vote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term, for the candidate to adopt if higher
    pub term: u64,
    /// Whether the vote was granted
    pub vote_granted: bool,
}

/// Append entries (heartbeat when empty) from the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: u64,
    /// Leader's node id
    pub leader_id: String,
    /// Leader's base URL, handed out in follower redirects
    pub leader_url: String,
    /// Index of the entry immediately before `entries`
    pub prev_log_index: u64,
    /// Term of that entry
    pub prev_log_term: u64,
    /// Entries to replicate; empty for a heartbeat
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// Response to append entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's term
    pub term: u64,
    /// Whether the entries were accepted
    pub success: bool,
    /// On success, the follower's highest matching index; on rejection, a
    /// hint the leader jumps `next_index` back to in one step
    pub match_index: u64,
}

/// Liveness probe reply; doubles as a cheap cluster view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Always "ok"
    pub status: String,
    /// Responding node's id
    pub node_id: String,
    /// Responding node's term
    pub term: u64,
    /// Responding node's role
    pub role: String,
}

/// How the consensus core reaches a peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver a RequestVote RPC.
    async fn request_vote(
        &self,
        peer: &str,
        req: &VoteRequest,
    ) -> Result<VoteResponse, ClusterError>;

    /// Deliver an AppendEntries RPC.
    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, ClusterError>;
}
