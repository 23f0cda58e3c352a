//! HTTP Request Handlers
//!
//! One handler per route. Cluster errors map onto the wire contract:
//! follower writes redirect with 307, missing quorum and missing leaders
//! are 503, future-dated timestamps are 400, durable-write failures 500.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::cluster::{AppendEntriesRequest, HeartbeatResponse, VoteRequest};
use crate::error::ClusterError;
use crate::node::Node;
use crate::server::api::{
    ErrorResponse, ForceDeliveryResponse, MessagesQuery, RedirectResponse, ReplicateRequest,
    ReplicateResponse, SendRequest, SendResponse, SyncRequest, SyncResponse, TimeCorrectRequest,
    TimeCorrectResponse, TimeResponse, TimeSyncRequest, TimeSyncResponse,
};
use crate::storage::Message;
use crate::timing::wall_clock_secs;

fn error_response(err: ClusterError) -> Response {
    let reason = err.reason().to_string();
    let message = err.to_string();
    match err {
        ClusterError::NotLeader { leader_url } => (
            StatusCode::TEMPORARY_REDIRECT,
            Json(RedirectResponse { leader_url, reason }),
        )
            .into_response(),
        ClusterError::NoLeader | ClusterError::QuorumUnreachable { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { reason, message }),
        )
            .into_response(),
        ClusterError::InvalidTimestamp(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { reason, message }),
        )
            .into_response(),
        ClusterError::LogInconsistency { .. } => (
            StatusCode::CONFLICT,
            Json(ErrorResponse { reason, message }),
        )
            .into_response(),
        ClusterError::TransientNetwork(_)
        | ClusterError::StaleTerm { .. }
        | ClusterError::Persistence(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { reason, message }),
        )
            .into_response(),
    }
}

/// `POST /send`
pub async fn send(State(node): State<Arc<Node>>, Json(req): Json<SendRequest>) -> Response {
    let mut message = Message::new(req.payload);
    if let Some(sender) = req.sender {
        message = message.with_sender(sender);
    }
    if let Some(recipient) = req.recipient {
        message = message.with_recipient(recipient);
    }
    if let Some(msg_id) = req.msg_id {
        message = message.with_msg_id(msg_id);
    }
    if let Some(ts) = req.original_ts {
        message = message.with_original_ts(ts);
    }

    match node.submit(message).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(SendResponse {
                status: "ok".into(),
                seq: receipt.seq,
                msg_id: receipt.msg_id,
                corrected_ts: receipt.corrected_ts,
                committed: receipt.committed,
                duplicate: receipt.duplicate,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// `GET /messages`
pub async fn messages(
    State(node): State<Arc<Node>>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    match node.query_messages(
        query.after.unwrap_or(0),
        query.limit,
        query.sender.as_deref(),
        query.recipient.as_deref(),
    ) {
        Ok(page) => Json(page).into_response(),
        Err(err) => error_response(err),
    }
}

/// `GET /status`
pub async fn status(State(node): State<Arc<Node>>) -> Response {
    match node.status() {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(err),
    }
}

/// `POST /replicate`: a peer pushes committed entries.
pub async fn replicate(
    State(node): State<Arc<Node>>,
    Json(req): Json<ReplicateRequest>,
) -> Response {
    match node.install_entries(req.entries).await {
        Ok(commit_index) => Json(ReplicateResponse { commit_index }).into_response(),
        Err(err) => error_response(err),
    }
}

/// `POST /sync`: a catching-up peer pulls committed entries.
pub async fn sync(State(node): State<Arc<Node>>, Json(req): Json<SyncRequest>) -> Response {
    match node.entries_for_sync(req.after, req.limit) {
        Ok(entries) => Json(SyncResponse { entries }).into_response(),
        Err(err) => error_response(err),
    }
}

/// `GET /heartbeat`
pub async fn heartbeat(State(node): State<Arc<Node>>) -> Json<HeartbeatResponse> {
    let raft = node.raft();
    Json(HeartbeatResponse {
        status: "ok".into(),
        node_id: node.config().node_id.clone(),
        term: raft.current_term(),
        role: format!("{:?}", raft.role()),
    })
}

/// `POST /request_vote`
pub async fn request_vote(
    State(node): State<Arc<Node>>,
    Json(req): Json<VoteRequest>,
) -> Response {
    match node.raft().handle_request_vote(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => error_response(err),
    }
}

/// `POST /append_entries`
pub async fn append_entries(
    State(node): State<Arc<Node>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Response {
    match node.raft().handle_append_entries(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => error_response(err),
    }
}

/// `GET /time`
pub async fn time(State(node): State<Arc<Node>>) -> Json<TimeResponse> {
    Json(TimeResponse {
        time: wall_clock_secs(),
        corrected_time: node.clock().corrected_now(),
    })
}

/// `POST /time/sync`: serve our side of an NTP-style exchange.
pub async fn time_sync(
    State(_node): State<Arc<Node>>,
    Json(req): Json<TimeSyncRequest>,
) -> Json<TimeSyncResponse> {
    let receive_ts = wall_clock_secs();
    Json(TimeSyncResponse {
        originate_ts: req.originate_ts,
        receive_ts,
        transmit_ts: wall_clock_secs(),
    })
}

/// `POST /time/correct`
pub async fn time_correct(
    State(node): State<Arc<Node>>,
    Json(req): Json<TimeCorrectRequest>,
) -> Response {
    match node.clock().correct(req.ts) {
        Ok(corrected_ts) => {
            Json(TimeCorrectResponse { ts: req.ts, corrected_ts }).into_response()
        }
        Err(err) => error_response(ClusterError::InvalidTimestamp(err)),
    }
}

/// `GET /time/stats`
pub async fn time_stats(State(node): State<Arc<Node>>) -> Response {
    Json(node.time_stats()).into_response()
}

/// `GET /ordering/status`
pub async fn ordering_status(State(node): State<Arc<Node>>) -> Response {
    Json(node.ordering_stats()).into_response()
}

/// `POST /ordering/force_delivery`
pub async fn force_delivery(State(node): State<Arc<Node>>) -> Response {
    let records = node.force_delivery();
    Json(ForceDeliveryResponse { released: records.len(), records }).into_response()
}
