//! Per-Sender Ordering Buffer
//!
//! Applied messages pass through here before their delivery record is cut.
//! Each sender gets a bucket ordered by corrected timestamp; entries wait
//! out a bounded hold-back window so late arrivals can slot in ahead of
//! them, then release in timestamp order. Release is monotone per sender:
//! the watermark never decreases, and a msg_id is released at most once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::storage::Message;

const RECENT_RELEASES: usize = 32;
const RELEASED_ID_MEMORY: usize = 4096;
const PREVIEW_LIMIT: usize = 5;

/// A delivery record produced when the buffer releases a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasedMessage {
    /// Bucket key (empty string for anonymous senders)
    pub sender: String,
    /// Released message identifier
    pub msg_id: String,
    /// Cluster sequence of the message
    pub seq: u64,
    /// Corrected timestamp the release was ordered by
    pub corrected_ts: f64,
    /// True when released by the force-delivery escape hatch
    pub forced: bool,
}

/// Preview of an entry still waiting in the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreview {
    /// Bucket key
    pub sender: String,
    /// Waiting message identifier
    pub msg_id: String,
    /// Corrected timestamp it will release at
    pub corrected_ts: f64,
    /// Milliseconds until its hold-back window expires
    pub ready_in_ms: u64,
}

/// Observability snapshot for `/ordering/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderingStats {
    /// Number of sender buckets with pending entries
    pub buckets: usize,
    /// Total pending entries
    pub pending: usize,
    /// Soft capacity the utilization is computed against
    pub capacity: usize,
    /// pending / capacity
    pub utilization: f64,
    /// Messages that arrived out of corrected-timestamp order
    pub reorders: u64,
    /// Total releases (normal and forced)
    pub released: u64,
    /// Releases through the force-delivery escape hatch
    pub forced_deliveries: u64,
    /// The next entries due to release
    pub next_deliverable: Vec<PendingPreview>,
    /// Most recent delivery records
    pub recent_releases: Vec<ReleasedMessage>,
}

struct Pending {
    corrected_ts: f64,
    message: Message,
    arrived_at: Instant,
}

#[derive(Default)]
struct SenderBucket {
    /// Sorted ascending by corrected_ts
    pending: Vec<Pending>,
    last_delivered_ts: f64,
}

/// Reorder buffer keyed by sender.
///
/// Owned by the apply loop; everything here is single-threaded mutation
/// with snapshot reads for the status surface.
pub struct OrderingBuffer {
    buckets: HashMap<String, SenderBucket>,
    hold_back: Duration,
    capacity: usize,
    pending_total: usize,
    reorder_count: u64,
    released_count: u64,
    forced_count: u64,
    released_ids: HashSet<String>,
    released_order: VecDeque<String>,
    recent: VecDeque<ReleasedMessage>,
}

impl OrderingBuffer {
    /// Create a buffer with the given hold-back window and soft capacity.
    pub fn new(hold_back: Duration, capacity: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            hold_back,
            capacity,
            pending_total: 0,
            reorder_count: 0,
            released_count: 0,
            forced_count: 0,
            released_ids: HashSet::new(),
            released_order: VecDeque::new(),
            recent: VecDeque::new(),
        }
    }

    /// Buffer an applied message. Returns false when its msg_id is already
    /// pending or was recently released (duplicates are dropped).
    pub fn insert(&mut self, message: Message) -> bool {
        let ts = message.corrected_ts.unwrap_or(message.original_ts);
        let key = message.sender_key().to_string();

        if self.released_ids.contains(&message.msg_id) {
            return false;
        }
        let bucket = self.buckets.entry(key).or_default();
        if bucket.pending.iter().any(|p| p.message.msg_id == message.msg_id) {
            return false;
        }

        // A timestamp behind the bucket tail or the watermark means this
        // message arrived out of order and is being resequenced.
        let tail_ts = bucket.pending.last().map(|p| p.corrected_ts);
        if ts < bucket.last_delivered_ts || tail_ts.is_some_and(|t| ts < t) {
            self.reorder_count += 1;
        }

        let at = bucket
            .pending
            .partition_point(|p| p.corrected_ts.total_cmp(&ts).is_le());
        bucket.pending.insert(
            at,
            Pending { corrected_ts: ts, message, arrived_at: Instant::now() },
        );
        self.pending_total += 1;
        true
    }

    /// Release every entry whose hold-back window has expired, in per-sender
    /// timestamp order. Entries older (by timestamp) than an expired one
    /// release with it, so the stream stays monotone.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<ReleasedMessage> {
        let mut released = Vec::new();
        for (sender, bucket) in self.buckets.iter_mut() {
            let expired = bucket
                .pending
                .iter()
                .rposition(|p| now.duration_since(p.arrived_at) >= self.hold_back);
            let Some(last) = expired else { continue };
            let drained: Vec<Pending> = bucket.pending.drain(..=last).collect();
            for pending in drained {
                released.push(release_one(sender, bucket, pending, false));
            }
        }
        self.finish_release(&released);
        released
    }

    /// Operator escape hatch: release everything in per-sender timestamp
    /// order, ignoring the window. May leave per-sender gaps; logged and
    /// counted.
    pub fn force_delivery(&mut self) -> Vec<ReleasedMessage> {
        let mut released = Vec::new();
        for (sender, bucket) in self.buckets.iter_mut() {
            let drained: Vec<Pending> = bucket.pending.drain(..).collect();
            for pending in drained {
                released.push(release_one(sender, bucket, pending, true));
            }
        }
        if !released.is_empty() {
            warn!(count = released.len(), "force delivery released buffered messages");
        }
        self.forced_count += released.len() as u64;
        self.finish_release(&released);
        released
    }

    /// Earliest hold-back expiry among pending entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets
            .values()
            .flat_map(|b| b.pending.iter())
            .map(|p| p.arrived_at + self.hold_back)
            .min()
    }

    /// Snapshot for the status surface.
    pub fn stats(&self) -> OrderingStats {
        let now = Instant::now();
        let mut next: Vec<PendingPreview> = self
            .buckets
            .iter()
            .filter_map(|(sender, b)| b.pending.first().map(|p| (sender, p)))
            .map(|(sender, p)| PendingPreview {
                sender: sender.clone(),
                msg_id: p.message.msg_id.clone(),
                corrected_ts: p.corrected_ts,
                ready_in_ms: (p.arrived_at + self.hold_back)
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            })
            .collect();
        next.sort_by_key(|p| p.ready_in_ms);
        next.truncate(PREVIEW_LIMIT);

        OrderingStats {
            buckets: self.buckets.values().filter(|b| !b.pending.is_empty()).count(),
            pending: self.pending_total,
            capacity: self.capacity,
            utilization: self.pending_total as f64 / self.capacity as f64,
            reorders: self.reorder_count,
            released: self.released_count,
            forced_deliveries: self.forced_count,
            next_deliverable: next,
            recent_releases: self.recent.iter().cloned().collect(),
        }
    }

    fn finish_release(&mut self, released: &[ReleasedMessage]) {
        self.pending_total -= released.len();
        self.released_count += released.len() as u64;
        for r in released {
            debug!(sender = %r.sender, msg_id = %r.msg_id, ts = r.corrected_ts, "released");
            if self.released_ids.insert(r.msg_id.clone()) {
                self.released_order.push_back(r.msg_id.clone());
            }
            self.recent.push_back(r.clone());
        }
        while self.released_order.len() > RELEASED_ID_MEMORY {
            if let Some(old) = self.released_order.pop_front() {
                self.released_ids.remove(&old);
            }
        }
        while self.recent.len() > RECENT_RELEASES {
            self.recent.pop_front();
        }
    }
}

fn release_one(
    sender: &str,
    bucket: &mut SenderBucket,
    pending: Pending,
    forced: bool,
) -> ReleasedMessage {
    // Monotone watermark: a late entry releasing below it does not drag
    // it backwards.
    if pending.corrected_ts > bucket.last_delivered_ts {
        bucket.last_delivered_ts = pending.corrected_ts;
    }
    ReleasedMessage {
        sender: sender.to_string(),
        msg_id: pending.message.msg_id.clone(),
        seq: pending.message.seq,
        corrected_ts: pending.corrected_ts,
        forced,
    }
}
