//! Rejoin Catch-Up
//!
//! One-shot sync that pulls committed entries a node missed while down.
//! Runs at startup and whenever the failure detector sees a peer recover.
//! Batches are validated for term/index continuity and installed through
//! the same persist path as live replication, so the normal apply loop
//! picks them up.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::consensus::RaftNode;
use crate::error::ClusterError;
use crate::storage::LogEntry;

/// Where catch-up fetches committed entries from.
#[async_trait]
pub trait CatchUpSource: Send + Sync {
    /// Committed entries with `seq > after` from `peer`, in seq order.
    async fn entries_after(&self, peer: &str, after: u64)
        -> Result<Vec<LogEntry>, ClusterError>;
}

/// Pull every committed entry this node is missing.
///
/// Peers are tried in order (put the leader first when known); the first
/// peer that serves a batch is drained until it has nothing newer. Returns
/// the number of entries installed.
pub async fn catch_up(
    raft: &Arc<RaftNode>,
    source: &dyn CatchUpSource,
    peers: &[String],
) -> Result<u64, ClusterError> {
    let mut ordered: Vec<&String> = peers.iter().collect();
    if let Some(leader) = raft.leader_url() {
        ordered.sort_by_key(|p| **p != leader);
    }

    let mut last_err = ClusterError::TransientNetwork("no peers to catch up from".into());
    for peer in ordered {
        match drain_peer(raft, source, peer).await {
            Ok(installed) => {
                if installed > 0 {
                    info!(peer = %peer, installed, "catch-up complete");
                } else {
                    debug!(peer = %peer, "already caught up");
                }
                return Ok(installed);
            }
            Err(e) => {
                warn!(peer = %peer, "catch-up failed: {e}");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn drain_peer(
    raft: &Arc<RaftNode>,
    source: &dyn CatchUpSource,
    peer: &str,
) -> Result<u64, ClusterError> {
    let mut installed = 0u64;
    loop {
        let after = raft.commit_index();
        let entries = source.entries_after(peer, after).await?;
        if entries.is_empty() {
            return Ok(installed);
        }
        // Anchor the term check to the entry already installed at the
        // cursor, so page boundaries cannot hide a term regression.
        let anchor_term = raft.log_entry(after).map(|e| e.term).unwrap_or(0);
        validate_batch(after, anchor_term, &entries)?;
        installed += entries.len() as u64;
        raft.install_committed(entries).await?;
    }
}

/// A batch must continue directly after `after`, with contiguous indexes
/// and terms that never decrease, starting from `anchor_term` (the term of
/// the local entry at `after`).
fn validate_batch(
    after: u64,
    anchor_term: u64,
    entries: &[LogEntry],
) -> Result<(), ClusterError> {
    let mut expected = after + 1;
    let mut prev_term = anchor_term;
    for entry in entries {
        if entry.index != expected || entry.term < prev_term {
            return Err(ClusterError::LogInconsistency { index: entry.index });
        }
        expected += 1;
        prev_term = entry.term;
    }
    Ok(())
}
