//! Cluster Coordination
//!
//! Everything that makes the peers agree: the consensus core, the
//! replication dispatcher enforcing the commit policy, the failure
//! detector, and the rejoin catch-up path.

mod catchup;
mod consensus;
mod dispatcher;
mod health;
mod rpc;

pub use catchup::{catch_up, CatchUpSource};
pub use consensus::{RaftNode, RaftStatus, Role};
pub use dispatcher::{Dispatcher, SendReceipt};
pub use health::{HealthMonitor, PeerHealth};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, HeartbeatResponse, PeerTransport, VoteRequest,
    VoteResponse,
};
