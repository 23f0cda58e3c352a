//! Message and log entry types - the core data model
//!
//! A `Message` is what clients submit and what queries return. A `LogEntry`
//! wraps a message with the consensus term and log index; the index becomes
//! the message's cluster-wide `seq` at commit time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timing::wall_clock_secs;

/// A client message carried through the replicated log.
///
/// The consensus-agreed fields (`msg_id`, `sender`, `recipient`, `payload`,
/// `original_ts`) are identical on every node for a given `seq`.
/// `corrected_ts` is filled at apply time from the applying node's own clock
/// model; `original_ts` is never mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable unique identifier; client-provided or server-generated
    pub msg_id: String,
    /// Logical sender, used for per-sender delivery ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Logical recipient, used for query filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Opaque UTF-8 payload
    pub payload: String,
    /// Wall-clock seconds at submission (client-supplied or leader-stamped)
    pub original_ts: f64,
    /// Clock-corrected timestamp, filled by the applying node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_ts: Option<f64>,
    /// Dense monotonically increasing sequence assigned at commit
    #[serde(default)]
    pub seq: u64,
}

impl Message {
    /// Create a message with a generated `msg_id` and the current wall clock.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            sender: None,
            recipient: None,
            payload: payload.into(),
            original_ts: wall_clock_secs(),
            corrected_ts: None,
            seq: 0,
        }
    }

    /// Set the sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Set the recipient.
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Override the message identifier.
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    /// Override the original timestamp.
    pub fn with_original_ts(mut self, ts: f64) -> Self {
        self.original_ts = ts;
        self
    }

    /// Bucket key for the ordering buffer; anonymous senders share one.
    pub fn sender_key(&self) -> &str {
        self.sender.as_deref().unwrap_or("")
    }
}

/// A replicated log entry: a message plus the term it was appended in.
///
/// Entries are ordered by `(term, index)`; a follower with a conflicting
/// entry at some index truncates that index and everything after it before
/// accepting the leader's version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader appended this entry
    pub term: u64,
    /// Log index, equal to the message's future `seq`
    pub index: u64,
    /// The carried message
    pub message: Message,
}

impl LogEntry {
    /// Wrap a message for appending at `index` in `term`.
    pub fn new(term: u64, index: u64, mut message: Message) -> Self {
        message.seq = index;
        Self { term, index, message }
    }
}
