//! Cluster Clock Synchronization
//!
//! Each node periodically exchanges four timestamps with every alive peer,
//! NTP style: local send t1, peer receive t2, peer send t3, local receive t4.
//! Per-sample offset and delay follow the standard estimators; the cluster
//! offset is the median of per-peer medians, the drift rate a least-squares
//! fit over (t, offset), and the accuracy a median absolute deviation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::TimeError;
use crate::timing::wall_clock_secs;

/// One accepted clock sample against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSample {
    /// Estimated peer-minus-local clock offset in seconds
    pub offset: f64,
    /// Round-trip network delay in seconds
    pub delay: f64,
    /// Local receive time the sample was taken at (unix seconds)
    pub t: f64,
}

/// Snapshot of the synchronization state for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSyncStats {
    /// Aggregate cluster clock offset in seconds
    pub clock_offset: f64,
    /// First-order skew per elapsed second
    pub drift_rate: f64,
    /// Unix seconds of the newest accepted sample, 0.0 when none
    pub last_sync_time: f64,
    /// Median absolute deviation of sample offsets
    pub sync_accuracy: f64,
    /// True once valid samples exist and residual spread is acceptable
    pub synchronized: bool,
    /// Accepted sample count per peer
    pub peer_samples: HashMap<String, usize>,
}

struct SyncState {
    samples: HashMap<String, VecDeque<TimeSample>>,
    clock_offset: f64,
    drift_rate: f64,
    last_sync_time: f64,
    sync_accuracy: f64,
    synchronized: bool,
}

/// Clock-offset estimator and timestamp corrector.
pub struct ClockSync {
    state: RwLock<SyncState>,
    history: usize,
    max_offset: f64,
    accuracy_threshold: f64,
    max_future_skew: f64,
}

impl ClockSync {
    /// Create an estimator.
    ///
    /// `history` bounds the per-peer sample count; samples with non-positive
    /// delay or |offset| above `max_offset` are discarded; `synchronized`
    /// requires the residual spread below `accuracy_threshold`; corrected
    /// timestamps more than `max_future_skew` seconds ahead of the corrected
    /// clock are rejected.
    pub fn new(
        history: usize,
        max_offset: f64,
        accuracy_threshold: f64,
        max_future_skew: f64,
    ) -> Self {
        Self {
            state: RwLock::new(SyncState {
                samples: HashMap::new(),
                clock_offset: 0.0,
                drift_rate: 0.0,
                last_sync_time: 0.0,
                sync_accuracy: 0.0,
                synchronized: false,
            }),
            history,
            max_offset,
            accuracy_threshold,
            max_future_skew,
        }
    }

    /// Record a four-timestamp exchange with `peer`.
    ///
    /// Returns the accepted sample, or `None` when the sanity checks
    /// discarded it.
    pub fn record_exchange(
        &self,
        peer: &str,
        t1: f64,
        t2: f64,
        t3: f64,
        t4: f64,
    ) -> Option<TimeSample> {
        let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
        let delay = (t4 - t1) - (t3 - t2);
        if delay <= 0.0 || offset.abs() > self.max_offset {
            return None;
        }

        let sample = TimeSample { offset, delay, t: t4 };
        let mut state = self.state.write();
        let queue = state.samples.entry(peer.to_string()).or_default();
        queue.push_back(sample);
        while queue.len() > self.history {
            queue.pop_front();
        }
        self.recompute(&mut state);
        Some(sample)
    }

    /// Correct a raw timestamp through the current clock model.
    ///
    /// `corrected = ts_raw + clock_offset + drift_rate * (now - ts_raw)`.
    /// A result further than the allowed skew ahead of the corrected local
    /// clock is an error, never a clamp.
    pub fn correct(&self, ts_raw: f64) -> Result<f64, TimeError> {
        let now = wall_clock_secs();
        let state = self.state.read();
        let dt = now - ts_raw;
        let corrected = ts_raw + state.clock_offset + state.drift_rate * dt;
        let now_corrected = now + state.clock_offset;
        let ahead = corrected - now_corrected;
        if ahead > self.max_future_skew {
            return Err(TimeError::FutureTimestamp { ts: ts_raw, ahead });
        }
        Ok(corrected)
    }

    /// Correct without the future-skew check. The apply path uses this:
    /// committed timestamps were validated at ingress on the leader, and a
    /// follower's own unsynchronized clock must not block applying them.
    pub fn correct_unchecked(&self, ts_raw: f64) -> f64 {
        let now = wall_clock_secs();
        let state = self.state.read();
        ts_raw + state.clock_offset + state.drift_rate * (now - ts_raw)
    }

    /// Invert the correction. Exact for zero drift; with drift, exact up to
    /// the wall-clock motion between the two calls.
    pub fn invert(&self, corrected: f64) -> f64 {
        let now = wall_clock_secs();
        let state = self.state.read();
        (corrected - state.clock_offset - state.drift_rate * now)
            / (1.0 - state.drift_rate)
    }

    /// Local wall clock pushed through the correction.
    pub fn corrected_now(&self) -> f64 {
        let state = self.state.read();
        wall_clock_secs() + state.clock_offset
    }

    /// Snapshot for `/time/stats` and `/status`.
    pub fn stats(&self) -> ClockSyncStats {
        let state = self.state.read();
        ClockSyncStats {
            clock_offset: state.clock_offset,
            drift_rate: state.drift_rate,
            last_sync_time: state.last_sync_time,
            sync_accuracy: state.sync_accuracy,
            synchronized: state.synchronized,
            peer_samples: state
                .samples
                .iter()
                .map(|(peer, q)| (peer.clone(), q.len()))
                .collect(),
        }
    }

    fn recompute(&self, state: &mut SyncState) {
        let mut peer_medians = Vec::new();
        let mut all_offsets = Vec::new();
        let mut points = Vec::new();
        let mut last_t: f64 = 0.0;

        for queue in state.samples.values() {
            if queue.is_empty() {
                continue;
            }
            let mut offsets: Vec<f64> = queue.iter().map(|s| s.offset).collect();
            peer_medians.push(median(&mut offsets));
            for s in queue {
                all_offsets.push(s.offset);
                points.push((s.t, s.offset));
                last_t = last_t.max(s.t);
            }
        }

        if peer_medians.is_empty() {
            state.clock_offset = 0.0;
            state.drift_rate = 0.0;
            state.sync_accuracy = 0.0;
            state.synchronized = false;
            return;
        }

        state.clock_offset = median(&mut peer_medians);
        state.drift_rate = regression_slope(&points);
        state.last_sync_time = last_t;

        let mut deviations: Vec<f64> = all_offsets
            .iter()
            .map(|o| (o - state.clock_offset).abs())
            .collect();
        state.sync_accuracy = median(&mut deviations);
        state.synchronized = state.sync_accuracy <= self.accuracy_threshold;
    }
}

/// Median of a non-empty slice; sorts in place.
fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Least-squares slope of offset over time; 0.0 when degenerate.
fn regression_slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let mean_o = points.iter().map(|(_, o)| o).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (t, o) in points {
        cov += (t - mean_t) * (o - mean_o);
        var += (t - mean_t) * (t - mean_t);
    }
    if var < f64::EPSILON {
        return 0.0;
    }
    cov / var
}
