//! HTTP Peer Client
//!
//! JSON-over-HTTP transport to the other cluster nodes, with a bounded
//! deadline on every request. Consensus RPCs use a deadline well under the
//! election timeout; probes and catch-up fetches get their own budgets.
//! Failures map to `transient_network` and are retried by the caller's
//! next tick, never here.

use async_trait::async_trait;
use std::time::Duration;

use crate::cluster::{
    AppendEntriesRequest, AppendEntriesResponse, CatchUpSource, HeartbeatResponse, PeerTransport,
    VoteRequest, VoteResponse,
};
use crate::config::NodeConfig;
use crate::error::ClusterError;
use crate::server::api::{SyncRequest, SyncResponse, TimeSyncRequest, TimeSyncResponse};
use crate::storage::LogEntry;

/// HTTP client for inter-node RPCs.
pub struct PeerClient {
    http: reqwest::Client,
    rpc_timeout: Duration,
    probe_timeout: Duration,
    catchup_timeout: Duration,
}

impl PeerClient {
    /// Build a client with explicit deadlines.
    pub fn new(rpc_timeout: Duration, probe_timeout: Duration, catchup_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_timeout,
            probe_timeout,
            catchup_timeout,
        }
    }

    /// Build a client from the node's configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.rpc_timeout, config.probe_timeout, config.catchup_timeout)
    }

    async fn post_json<Req, Resp>(
        &self,
        url: String,
        body: &Req,
        deadline: Duration,
    ) -> Result<Resp, ClusterError>
    where
        Req: serde::Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|e| ClusterError::TransientNetwork(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::TransientNetwork(format!(
                "{url}: http {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| ClusterError::TransientNetwork(format!("{url}: {e}")))
    }

    /// Liveness probe for the failure detector.
    pub async fn heartbeat(&self, peer: &str) -> Result<HeartbeatResponse, ClusterError> {
        let url = format!("{peer}/heartbeat");
        let resp = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| ClusterError::TransientNetwork(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::TransientNetwork(format!(
                "{url}: http {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| ClusterError::TransientNetwork(format!("{url}: {e}")))
    }

    /// One NTP-style exchange leg with a peer.
    pub async fn time_exchange(
        &self,
        peer: &str,
        originate_ts: f64,
    ) -> Result<TimeSyncResponse, ClusterError> {
        self.post_json(
            format!("{peer}/time/sync"),
            &TimeSyncRequest { originate_ts },
            self.probe_timeout,
        )
        .await
    }
}

#[async_trait]
impl PeerTransport for PeerClient {
    async fn request_vote(
        &self,
        peer: &str,
        req: &VoteRequest,
    ) -> Result<VoteResponse, ClusterError> {
        self.post_json(format!("{peer}/request_vote"), req, self.rpc_timeout)
            .await
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, ClusterError> {
        self.post_json(format!("{peer}/append_entries"), req, self.rpc_timeout)
            .await
    }
}

#[async_trait]
impl CatchUpSource for PeerClient {
    async fn entries_after(
        &self,
        peer: &str,
        after: u64,
    ) -> Result<Vec<LogEntry>, ClusterError> {
        let resp: SyncResponse = self
            .post_json(
                format!("{peer}/sync"),
                &SyncRequest { after, limit: None },
                self.catchup_timeout,
            )
            .await?;
        Ok(resp.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer_is_transient() {
        let client = PeerClient::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        // Nothing listens on the discard port.
        let err = client.heartbeat("http://127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, ClusterError::TransientNetwork(_)));
        assert_eq!(err.reason(), "transient_network");
    }
}
