//! Time Synchronization & Ordering
//!
//! NTP-style clock-offset estimation against the cluster, drift-aware
//! timestamp correction, and the per-sender reorder buffer that turns
//! corrected timestamps into a monotone delivery stream.

mod ordering;
mod sync;

pub use ordering::{OrderingBuffer, OrderingStats, PendingPreview, ReleasedMessage};
pub use sync::{ClockSync, ClockSyncStats, TimeSample};

/// Current wall clock as unix seconds with microsecond resolution.
pub fn wall_clock_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
