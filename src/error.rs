//! Error Types
//!
//! Structured error kinds for the cluster write path, the durable store,
//! and timestamp correction. Anything that could make two nodes disagree
//! on committed state is fatal; everything else is retryable or carries a
//! machine-readable reason.

use thiserror::Error;

/// Errors surfaced by the consensus and replication paths.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Peer unreachable or timed out; retried on the next tick.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A client write reached a non-leader node.
    #[error("not the leader")]
    NotLeader {
        /// Best-known leader endpoint, if any
        leader_url: Option<String>,
    },

    /// No leader is currently known (election in progress).
    #[error("no leader elected")]
    NoLeader,

    /// sync_quorum could not commit the entry within the deadline.
    #[error("quorum not reached for seq {seq} within {waited_ms}ms")]
    QuorumUnreachable {
        /// Log index the entry was appended at
        seq: u64,
        /// How long the dispatcher waited
        waited_ms: u64,
    },

    /// An RPC was rejected because the receiver's term is higher.
    #[error("stale term: local {local}, remote {remote}")]
    StaleTerm {
        /// Term carried by the rejected RPC
        local: u64,
        /// Term the receiver answered with
        remote: u64,
    },

    /// AppendEntries prev_log mismatch; the leader backs off next_index.
    #[error("log inconsistency at index {index}")]
    LogInconsistency {
        /// First index the follower could not match
        index: u64,
    },

    /// Future-dated timestamp rejected by correction.
    #[error(transparent)]
    InvalidTimestamp(#[from] TimeError),

    /// Durable write failed; the node must stop serving.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ClusterError {
    /// Stable snake_case reason string used in wire responses.
    pub fn reason(&self) -> &'static str {
        match self {
            ClusterError::TransientNetwork(_) => "transient_network",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::NoLeader => "no_leader",
            ClusterError::QuorumUnreachable { .. } => "quorum_unreachable",
            ClusterError::StaleTerm { .. } => "stale_term",
            ClusterError::LogInconsistency { .. } => "log_inconsistency",
            ClusterError::InvalidTimestamp(_) => "invalid_timestamp",
            ClusterError::Persistence(_) => "persistence_fatal",
        }
    }

    /// True if the node must stop serving to preserve safety.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Persistence(_))
    }
}

/// Errors from the durable log store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage engine failure.
    #[error("storage engine: {0}")]
    Engine(#[from] redb::Error),

    /// Entry bytes failed to decode.
    #[error("log codec: {0}")]
    Codec(#[from] bincode::Error),

    /// Filesystem error preparing the store directory.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    /// No entry at the requested index.
    #[error("no log entry at index {0}")]
    Missing(u64),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Engine(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Engine(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Engine(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Engine(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Engine(e.into())
    }
}

/// Errors from timestamp correction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeError {
    /// Corrected timestamp lies further in the future than the allowed skew.
    #[error("timestamp {ts:.6} is {ahead:.3}s ahead of the corrected clock")]
    FutureTimestamp {
        /// The offending raw timestamp
        ts: f64,
        /// Seconds ahead of the corrected local clock
        ahead: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(ClusterError::NoLeader.reason(), "no_leader");
        assert_eq!(
            ClusterError::NotLeader { leader_url: None }.reason(),
            "not_leader"
        );
        assert_eq!(
            ClusterError::QuorumUnreachable { seq: 3, waited_ms: 1000 }.reason(),
            "quorum_unreachable"
        );
        assert_eq!(
            ClusterError::InvalidTimestamp(TimeError::FutureTimestamp { ts: 1.0, ahead: 9.0 })
                .reason(),
            "invalid_timestamp"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!ClusterError::NoLeader.is_fatal());
        assert!(ClusterError::Persistence(StoreError::Missing(1)).is_fatal());
    }
}
