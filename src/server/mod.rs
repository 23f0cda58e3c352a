//! HTTP Server
//!
//! The JSON-over-HTTP surface of one node: client routes (send, messages,
//! status), consensus RPCs, catch-up, and the time/ordering subsystem
//! endpoints. Any conformant router would do; this one is axum on the
//! node's tokio runtime, shut down gracefully through the node's shutdown
//! flag.

pub mod api;
mod handlers;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::node::Node;

/// HTTP server for one node.
pub struct ApiServer {
    node: Arc<Node>,
    addr: SocketAddr,
}

impl ApiServer {
    /// Bind target comes from the node's configuration.
    pub fn new(node: Arc<Node>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", node.config().host, node.config().port)
            .parse()
            .context("invalid bind address")?;
        Ok(Self { node, addr })
    }

    /// The full route table.
    pub fn router(node: Arc<Node>) -> Router {
        Router::new()
            .route("/send", post(handlers::send))
            .route("/messages", get(handlers::messages))
            .route("/status", get(handlers::status))
            .route("/replicate", post(handlers::replicate))
            .route("/sync", post(handlers::sync))
            .route("/heartbeat", get(handlers::heartbeat))
            .route("/request_vote", post(handlers::request_vote))
            .route("/append_entries", post(handlers::append_entries))
            .route("/time", get(handlers::time))
            .route("/time/sync", post(handlers::time_sync))
            .route("/time/correct", post(handlers::time_correct))
            .route("/time/stats", get(handlers::time_stats))
            .route("/ordering/status", get(handlers::ordering_status))
            .route("/ordering/force_delivery", post(handlers::force_delivery))
            .with_state(node)
    }

    /// Serve until the node shuts down.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        info!(addr = %self.addr, "listening");

        let mut shutdown = self.node.raft().subscribe_shutdown();
        axum::serve(listener, Self::router(self.node))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("server error")?;
        Ok(())
    }
}
