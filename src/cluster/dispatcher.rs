//! Replication Dispatcher
//!
//! The leader-side write path. Takes a client message, enforces msg_id
//! idempotence, stamps and validates timestamps, appends through consensus,
//! and then either returns immediately (async mode) or blocks until the
//! commit index reaches the entry (sync_quorum mode).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster::consensus::RaftNode;
use crate::config::ReplicationMode;
use crate::error::ClusterError;
use crate::storage::{LogStore, Message};
use crate::timing::{wall_clock_secs, ClockSync};

/// Outcome of a successful (or idempotent) submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Cluster sequence assigned to the message
    pub seq: u64,
    /// The message identifier, echoed or generated
    pub msg_id: String,
    /// Corrected timestamp: applied value for committed entries, the
    /// current clock model's estimate otherwise
    pub corrected_ts: f64,
    /// Whether the entry is known committed at reply time
    pub committed: bool,
    /// True when this request repeated an already-accepted msg_id
    pub duplicate: bool,
}

/// Applies client writes through the leader under the configured policy.
pub struct Dispatcher {
    raft: Arc<RaftNode>,
    store: Arc<LogStore>,
    clock: Arc<ClockSync>,
    mode: ReplicationMode,
    sync_wait: Duration,
}

impl Dispatcher {
    /// Build a dispatcher; the mode is fixed at startup.
    pub fn new(
        raft: Arc<RaftNode>,
        store: Arc<LogStore>,
        clock: Arc<ClockSync>,
        mode: ReplicationMode,
        sync_wait: Duration,
    ) -> Self {
        Self { raft, store, clock, mode, sync_wait }
    }

    /// The configured commit policy.
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// Submit a client message.
    ///
    /// Non-leaders get `NotLeader` (with a redirect target when one is
    /// known) or `NoLeader`. A duplicate msg_id returns the original
    /// record unchanged.
    pub async fn submit(&self, mut message: Message) -> Result<SendReceipt, ClusterError> {
        if !self.raft.is_leader() {
            return Err(match self.raft.leader_url() {
                Some(url) => ClusterError::NotLeader { leader_url: Some(url) },
                None => ClusterError::NoLeader,
            });
        }

        // Idempotence over the applied prefix.
        if let Some(seq) = self.store.lookup_msg_id(&message.msg_id)? {
            let corrected = self
                .store
                .get(seq)?
                .and_then(|e| e.message.corrected_ts)
                .unwrap_or(message.original_ts);
            debug!(msg_id = %message.msg_id, seq, "duplicate of committed message");
            return Ok(SendReceipt {
                seq,
                msg_id: message.msg_id,
                corrected_ts: corrected,
                committed: true,
                duplicate: true,
            });
        }

        // Idempotence over the in-flight tail the msg_id index does not
        // cover yet.
        let applied = self.store.applied_index()?;
        if let Some(seq) = self.raft.find_msg_id_after(applied, &message.msg_id) {
            debug!(msg_id = %message.msg_id, seq, "duplicate of in-flight message");
            let committed = seq <= self.raft.commit_index();
            let corrected = self.clock.correct(message.original_ts).unwrap_or(message.original_ts);
            return Ok(SendReceipt {
                seq,
                msg_id: message.msg_id,
                corrected_ts: corrected,
                committed,
                duplicate: true,
            });
        }

        if message.original_ts <= 0.0 {
            message.original_ts = wall_clock_secs();
        }
        // Future-dated input is an error here, before it can enter the log.
        let provisional = self.clock.correct(message.original_ts)?;

        let msg_id = message.msg_id.clone();
        let (_term, index) = self.raft.leader_append(message).await?;

        match self.mode {
            ReplicationMode::Async => Ok(SendReceipt {
                seq: index,
                msg_id,
                corrected_ts: provisional,
                committed: false,
                duplicate: false,
            }),
            ReplicationMode::SyncQuorum => self.wait_quorum(index, msg_id, provisional).await,
        }
    }

    async fn wait_quorum(
        &self,
        index: u64,
        msg_id: String,
        provisional: f64,
    ) -> Result<SendReceipt, ClusterError> {
        let mut commits = self.raft.subscribe_commit();
        let wait = tokio::time::timeout(self.sync_wait, async {
            loop {
                if *commits.borrow_and_update() >= index {
                    return true;
                }
                if commits.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match wait {
            Ok(true) => {
                // Prefer the applied corrected timestamp when apply has
                // already caught up to this entry.
                let corrected = self
                    .store
                    .get(index)?
                    .and_then(|e| e.message.corrected_ts)
                    .unwrap_or(provisional);
                Ok(SendReceipt {
                    seq: index,
                    msg_id,
                    corrected_ts: corrected,
                    committed: true,
                    duplicate: false,
                })
            }
            _ => {
                warn!(seq = index, "quorum not reached within deadline");
                Err(ClusterError::QuorumUnreachable {
                    seq: index,
                    waited_ms: self.sync_wait.as_millis() as u64,
                })
            }
        }
    }
}
