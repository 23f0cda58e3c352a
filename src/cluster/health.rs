//! Failure Detector
//!
//! Tracks per-peer liveness from periodic heartbeat probes. A peer flips to
//! dead after a small number of consecutive failures and back to alive on
//! the next success; the alive transition is what triggers catch-up. The
//! map is its own concurrent structure and shares no locks with consensus.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::timing::wall_clock_secs;

/// Liveness record for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealth {
    /// Whether the peer currently counts as alive
    pub alive: bool,
    /// Unix seconds of the last successful probe
    pub last_ok: Option<f64>,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
}

/// Concurrent per-peer liveness map.
pub struct HealthMonitor {
    peers: DashMap<String, PeerHealth>,
    threshold: u32,
}

impl HealthMonitor {
    /// Track the given peers, initially assumed alive.
    pub fn new(peers: &[String], threshold: u32) -> Self {
        let map = DashMap::new();
        for peer in peers {
            map.insert(
                peer.clone(),
                PeerHealth { alive: true, last_ok: None, consecutive_failures: 0 },
            );
        }
        Self { peers: map, threshold }
    }

    /// Record a successful probe. Returns true when the peer just
    /// recovered (dead -> alive), which should trigger catch-up.
    pub fn record_success(&self, peer: &str) -> bool {
        let mut entry = match self.peers.get_mut(peer) {
            Some(entry) => entry,
            None => return false,
        };
        let recovered = !entry.alive;
        entry.alive = true;
        entry.consecutive_failures = 0;
        entry.last_ok = Some(wall_clock_secs());
        recovered
    }

    /// Record a failed probe. Returns true when this crossed the failure
    /// threshold and marked the peer dead.
    pub fn record_failure(&self, peer: &str) -> bool {
        let mut entry = match self.peers.get_mut(peer) {
            Some(entry) => entry,
            None => return false,
        };
        entry.consecutive_failures += 1;
        if entry.alive && entry.consecutive_failures >= self.threshold {
            entry.alive = false;
            return true;
        }
        false
    }

    /// Whether a peer currently counts as alive.
    pub fn is_alive(&self, peer: &str) -> bool {
        self.peers.get(peer).map(|e| e.alive).unwrap_or(false)
    }

    /// Peers currently marked alive.
    pub fn alive_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|e| e.value().alive)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of the whole map for the status surface.
    pub fn snapshot(&self) -> HashMap<String, PeerHealth> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
