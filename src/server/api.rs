//! Wire Types for the HTTP API
//!
//! JSON request/response bodies for every route. Field names are lowercase
//! snake_case and stable; clients and peers parse these shapes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cluster::{PeerHealth, Role};
use crate::config::ReplicationMode;
use crate::storage::LogEntry;
use crate::timing::{ClockSyncStats, OrderingStats, ReleasedMessage};

/// Body of `POST /send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Message payload (UTF-8)
    pub payload: String,
    /// Optional logical sender
    #[serde(default)]
    pub sender: Option<String>,
    /// Optional logical recipient
    #[serde(default)]
    pub recipient: Option<String>,
    /// Optional client-supplied id; generated when absent
    #[serde(default)]
    pub msg_id: Option<String>,
    /// Optional client wall-clock seconds; leader-stamped when absent
    #[serde(default)]
    pub original_ts: Option<f64>,
}

/// Success body of `POST /send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    /// Always "ok"
    pub status: String,
    /// Assigned cluster sequence
    pub seq: u64,
    /// Echoed or generated message id
    pub msg_id: String,
    /// Corrected timestamp (applied, or the current estimate)
    pub corrected_ts: f64,
    /// Whether the entry was known committed at reply time
    pub committed: bool,
    /// True when the msg_id repeated an accepted message
    pub duplicate: bool,
}

/// Redirect body returned by followers for client writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectResponse {
    /// Where the current leader lives
    pub leader_url: Option<String>,
    /// Stable reason string
    pub reason: String,
}

/// Generic failure body with a stable snake_case reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable detail
    pub message: String,
}

/// Query string of `GET /messages`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    /// Page size; default 100, capped at 1000
    pub limit: Option<usize>,
    /// Return messages with seq greater than this
    pub after: Option<u64>,
    /// Filter by sender
    pub sender: Option<String>,
    /// Filter by recipient
    pub recipient: Option<String>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node identity
    pub node_id: String,
    /// Current consensus role
    pub role: Role,
    /// Current term
    pub term: u64,
    /// Best-known leader id
    pub leader_id: Option<String>,
    /// Best-known leader URL
    pub leader_url: Option<String>,
    /// Highest committed sequence
    pub commit_index: u64,
    /// Highest applied sequence
    pub applied_index: u64,
    /// Highest local log index
    pub last_log_index: u64,
    /// Configured commit policy
    pub replication_mode: ReplicationMode,
    /// Effective quorum size
    pub quorum: usize,
    /// Failure detector view of the peers
    pub peers: HashMap<String, PeerHealth>,
    /// Clock sync snapshot
    pub time: ClockSyncStats,
    /// Ordering buffer snapshot
    pub ordering: OrderingStats,
}

/// Body of `POST /sync`: pull committed entries for catch-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Return entries with seq greater than this
    pub after: u64,
    /// Batch cap; default 500
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Response of `POST /sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Committed entries in seq order
    pub entries: Vec<LogEntry>,
}

/// Body of `POST /replicate`: push committed entries to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// Committed entries in seq order, chaining onto the receiver's log
    pub entries: Vec<LogEntry>,
}

/// Response of `POST /replicate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// Receiver's commit index after installation
    pub commit_index: u64,
}

/// Body of `GET /time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeResponse {
    /// Raw local wall clock (unix seconds)
    pub time: f64,
    /// Wall clock pushed through the correction model
    pub corrected_time: f64,
}

/// Body of `POST /time/sync`: one NTP-style exchange leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncRequest {
    /// Caller's send timestamp (t1)
    pub originate_ts: f64,
}

/// Response of `POST /time/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncResponse {
    /// Echoed t1
    pub originate_ts: f64,
    /// Server receive timestamp (t2)
    pub receive_ts: f64,
    /// Server send timestamp (t3)
    pub transmit_ts: f64,
}

/// Body of `POST /time/correct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCorrectRequest {
    /// Raw timestamp to correct
    pub ts: f64,
}

/// Response of `POST /time/correct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCorrectResponse {
    /// Echoed input
    pub ts: f64,
    /// Corrected value
    pub corrected_ts: f64,
}

/// Response of `POST /ordering/force_delivery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceDeliveryResponse {
    /// Number of entries released
    pub released: usize,
    /// The delivery records, in per-sender timestamp order
    pub records: Vec<ReleasedMessage>,
}
