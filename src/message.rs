//! # Inter-process message protocol.
//!
//! Closed tagged-variant types, one per direction, exhaustively matched by
//! their consumers:
//!
//! - [`GatewayMsg`] — connection process to supervisor (inbound events and
//!   correlated shard-info responses);
//! - [`GatewayAction`] — supervisor to connection process (outbound actions,
//!   correlated queries, shutdown);
//! - [`WorkerMsg`] — worker process to supervisor (readiness, outbound
//!   actions, correlated queries);
//! - [`WorkerInbox`] — supervisor to worker process (event delivery and
//!   shutdown; correlated replies travel on the channel carried by the
//!   request);
//! - [`ControlRequest`] — operator control plane to supervisor.
//!
//! Payloads are opaque [`serde_json::Value`]s: the supervisor forwards them
//! without inspecting their shape.
//!
//! [`SpawnBlob`] is the spawn-time configuration handoff: each child receives
//! its full configuration (credentials, shard assignment, proxy address and
//! secret) as a single opaque serialized blob, never through command-line
//! arguments where secrets would leak into process listings.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ControlError;
use crate::plan::{ShardId, WorkerId};
use crate::process::ChildRole;

/// One inbound protocol event, tagged with the shard it arrived on.
#[derive(Debug, Clone)]
pub struct ShardEvent {
    pub shard_id: ShardId,
    pub payload: Value,
}

/// Connection process to supervisor.
#[derive(Debug, Clone)]
pub enum GatewayMsg {
    /// Inbound event for routing to the owning worker.
    Event(ShardEvent),
    /// Response to a correlated shard-info query.
    ShardInfo {
        nonce: Uuid,
        shard_id: ShardId,
        /// Round-trip time in milliseconds, `-1` when unknown.
        rtt_ms: i64,
    },
}

/// Supervisor to connection process.
#[derive(Debug, Clone)]
pub enum GatewayAction {
    /// Send an opaque payload on a specific shard. At-most-once, no retry.
    SendPayload { shard_id: ShardId, payload: Value },
    /// Update presence/status. At-most-once, no retry.
    EditStatus { payload: Value },
    /// Correlated shard-info query; `shard_id` is an optional routing key.
    ShardInfo {
        nonce: Uuid,
        shard_id: Option<ShardId>,
    },
    /// Voluntary shutdown request.
    Shutdown,
}

/// Worker process to supervisor.
#[derive(Debug)]
pub enum WorkerMsg {
    /// The worker is ready to receive events; queued events flush now.
    Ready { worker_id: WorkerId },
    /// Outbound action for the connection process, forwarded unmodified.
    SendPayload { shard_id: ShardId, payload: Value },
    /// Presence update for the connection process, forwarded unmodified.
    EditStatus { payload: Value },
    /// Correlated shard-info query on behalf of this worker. The supervisor
    /// keeps `reply` under `nonce` until the response or eviction; dispatch
    /// in the asking worker continues independently of the round trip.
    ShardInfo {
        worker_id: WorkerId,
        nonce: Uuid,
        shard_id: Option<ShardId>,
        reply: oneshot::Sender<ShardInfoReply>,
    },
}

/// Supervisor to worker process.
#[derive(Debug, Clone)]
pub enum WorkerInbox {
    /// Event delivery for a shard this worker owns.
    Event(ShardEvent),
    /// Voluntary shutdown request.
    Shutdown,
}

/// Reply to a worker's shard-info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfoReply {
    pub shard_id: ShardId,
    /// Round-trip time in milliseconds, `-1` when unknown.
    pub rtt_ms: i64,
}

/// Snapshot of the in-memory topology, never blocking on children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub shard_count: usize,
    pub worker_count: usize,
    pub cluster_count: usize,
}

/// Operator control plane to supervisor.
///
/// Mutating variants carry the caller's opaque request id for log
/// correlation; each resolves through its oneshot to success, an
/// application-level [`ControlError`], or a caller-side timeout.
#[derive(Debug)]
pub enum ControlRequest {
    /// Rolling restart, escalated to a full restart when the freshly
    /// recomputed partition plan no longer matches the active one.
    Reload {
        request_id: Uuid,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Rolling one-worker-at-a-time restart; the connection stays up.
    ReloadLazy {
        request_id: Uuid,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Full teardown and respawn of every role, connection included.
    FullReload {
        request_id: Uuid,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Targeted restart of exactly one worker.
    RestartWorker {
        request_id: Uuid,
        worker_id: WorkerId,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Targeted restart of the worker owning one shard.
    RestartShard {
        request_id: Uuid,
        shard_id: ShardId,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Pure read of shard/worker/cluster counts.
    GetCounts {
        respond: oneshot::Sender<Counts>,
    },
    /// Stop the whole runtime.
    Stop {
        request_id: Uuid,
        respond: oneshot::Sender<Result<(), ControlError>>,
    },
}

impl ControlRequest {
    /// Short stable name for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControlRequest::Reload { .. } => "reload",
            ControlRequest::ReloadLazy { .. } => "reload_lazy",
            ControlRequest::FullReload { .. } => "full_reload",
            ControlRequest::RestartWorker { .. } => "restart_worker",
            ControlRequest::RestartShard { .. } => "restart_shard",
            ControlRequest::GetCounts { .. } => "get_counts",
            ControlRequest::Stop { .. } => "stop",
        }
    }
}

/// Spawn-time configuration handoff, serialized into one opaque blob.
#[derive(Clone, Serialize, Deserialize)]
pub struct SpawnBlob {
    pub role: ChildRole,
    pub token: String,
    pub intents: u64,
    pub total_shards: u32,
    /// Owned shards: the full window for the gateway, the assignment for a worker.
    pub shards: Vec<ShardId>,
    pub worker_id: Option<WorkerId>,
    pub proxy_addr: Option<SocketAddr>,
    pub proxy_secret: Option<String>,
}

impl SpawnBlob {
    /// Serializes into the opaque handoff string.
    pub fn encode(&self) -> String {
        // SpawnBlob contains no map keys or non-string values that can fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes a handoff string produced by [`SpawnBlob::encode`].
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// Credentials stay out of logs; Debug prints the shape, not the secrets.
impl fmt::Debug for SpawnBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnBlob")
            .field("role", &self.role)
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("total_shards", &self.total_shards)
            .field("shards", &self.shards)
            .field("worker_id", &self.worker_id)
            .field("proxy_addr", &self.proxy_addr)
            .field("proxy_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> SpawnBlob {
        SpawnBlob {
            role: ChildRole::Worker,
            token: "sekrit-token".to_string(),
            intents: 513,
            total_shards: 8,
            shards: vec![2, 3],
            worker_id: Some("w1".to_string()),
            proxy_addr: Some("127.0.0.1:9000".parse().unwrap()),
            proxy_secret: Some("sekrit-proxy".to_string()),
        }
    }

    #[test]
    fn spawn_blob_round_trips() {
        let original = blob();
        let decoded = SpawnBlob::decode(&original.encode()).unwrap();
        assert_eq!(decoded.role, ChildRole::Worker);
        assert_eq!(decoded.token, original.token);
        assert_eq!(decoded.shards, original.shards);
        assert_eq!(decoded.worker_id, original.worker_id);
        assert_eq!(decoded.proxy_addr, original.proxy_addr);
        assert_eq!(decoded.proxy_secret, original.proxy_secret);
    }

    #[test]
    fn spawn_blob_debug_redacts_credentials() {
        let rendered = format!("{:?}", blob());
        assert!(!rendered.contains("sekrit-token"));
        assert!(!rendered.contains("sekrit-proxy"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn malformed_blob_is_rejected() {
        assert!(SpawnBlob::decode("not json").is_err());
        assert!(SpawnBlob::decode("{}").is_err());
    }
}
