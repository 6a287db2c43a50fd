//! Error types used by the shardvisor runtime.
//!
//! Four groups, by where they surface:
//!
//! - [`PlanError`] — configuration inconsistencies found while building the
//!   partition plan. Always fatal: the runtime refuses to start (or to apply a
//!   reload) before any process is touched.
//! - [`RuntimeError`] — errors raised by the supervisor runtime itself.
//! - [`ControlError`] — results of control-plane calls, including synchronous
//!   rejections for unknown targets and timeouts.
//! - [`GatewayError`] / [`WorkerError`] / [`ProxyError`] — per-role failures.
//!
//! All provide `as_label()` for stable snake_case identifiers in logs/metrics.

use std::time::Duration;
use thiserror::Error;

/// Configuration inconsistencies detected by the partition planner.
///
/// Any of these aborts startup before a single child is spawned; the planner
/// never emits a partial or degraded plan.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A shard range was given with `end < start`.
    #[error("shard range {start}..={end} is reversed")]
    ReversedRange { start: u32, end: u32 },

    /// The same worker id appears twice within one cluster.
    #[error("duplicate worker id {id:?} in cluster {cluster:?}")]
    DuplicateWorkerId { cluster: String, id: String },

    /// A shard id is assigned to more than one worker.
    #[error("shard {shard} assigned to more than one worker in cluster {cluster:?}")]
    DuplicateShard { cluster: String, shard: u32 },

    /// A worker claims a shard outside its cluster's range.
    #[error("shard {shard} is outside cluster {cluster:?} range {start}..={end}")]
    ShardOutOfRange {
        cluster: String,
        shard: u32,
        start: u32,
        end: u32,
    },

    /// The union of worker assignments leaves a hole in the cluster range.
    #[error("cluster {cluster:?} leaves shard {shard} unassigned")]
    UnassignedShard { cluster: String, shard: u32 },

    /// A worker ended up with no shards at all.
    #[error("worker {id:?} in cluster {cluster:?} owns no shards")]
    EmptyWorker { cluster: String, id: String },

    /// An even split was requested across more workers than shards.
    #[error("cluster {cluster:?} splits {shards} shards across {workers} workers")]
    TooManyWorkers {
        cluster: String,
        workers: u32,
        shards: u32,
    },

    /// An even split was requested with zero workers.
    #[error("worker count must be positive in cluster {cluster:?}")]
    ZeroWorkers { cluster: String },

    /// One worker per shard only makes sense for a single-cluster deployment.
    #[error("one-worker-per-shard layout requires a single cluster, got {count}")]
    AutoNeedsSingleCluster { count: usize },

    /// The resolved total shard count was zero.
    #[error("total shard count must be positive")]
    ZeroShards,

    /// Automatic shard counting was requested but no count source was wired in.
    #[error("automatic shard count requires a shard-count source")]
    NoCountSource,
}

impl PlanError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PlanError::ReversedRange { .. } => "plan_reversed_range",
            PlanError::DuplicateWorkerId { .. } => "plan_duplicate_worker",
            PlanError::DuplicateShard { .. } => "plan_duplicate_shard",
            PlanError::ShardOutOfRange { .. } => "plan_shard_out_of_range",
            PlanError::UnassignedShard { .. } => "plan_unassigned_shard",
            PlanError::EmptyWorker { .. } => "plan_empty_worker",
            PlanError::TooManyWorkers { .. } => "plan_too_many_workers",
            PlanError::ZeroWorkers { .. } => "plan_zero_workers",
            PlanError::AutoNeedsSingleCluster { .. } => "plan_auto_multi_cluster",
            PlanError::ZeroShards => "plan_zero_shards",
            PlanError::NoCountSource => "plan_no_count_source",
        }
    }
}

/// Errors raised by the supervisor runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Startup configuration was rejected by the planner.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A spawn blob failed to decode on the child side.
    #[error("spawn blob decode failed: {0}")]
    SpawnBlob(#[from] serde_json::Error),

    /// The gateway transport failed before the runtime was up.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The local request proxy could not be started.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Shutdown grace period was exceeded; some children had to be killed.
    #[error("shutdown grace {grace:?} exceeded; killed: {killed:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of children that did not exit in time.
        killed: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Plan(_) => "runtime_plan_rejected",
            RuntimeError::SpawnBlob(_) => "runtime_spawn_blob",
            RuntimeError::Gateway(_) => "runtime_gateway",
            RuntimeError::Proxy(_) => "runtime_proxy",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// Results of control-plane calls against the supervisor.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No response arrived within the caller's deadline.
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Restart named a worker id absent from the active plan.
    #[error("unknown worker {id:?}")]
    UnknownWorker { id: String },

    /// Restart named a shard id no worker owns.
    #[error("shard {shard} is not part of the active plan")]
    UnknownShard { shard: u32 },

    /// The supervisor has already begun shutting down.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// A reload could not be applied; the previous topology stays in force.
    #[error("reload failed: {reason}")]
    ReloadFailed { reason: String },

    /// The supervisor is gone (its run loop has exited).
    #[error("supervisor is not running")]
    Closed,
}

impl ControlError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControlError::Timeout { .. } => "control_timeout",
            ControlError::UnknownWorker { .. } => "control_unknown_worker",
            ControlError::UnknownShard { .. } => "control_unknown_shard",
            ControlError::ShuttingDown => "control_shutting_down",
            ControlError::ReloadFailed { .. } => "control_reload_failed",
            ControlError::Closed => "control_closed",
        }
    }
}

/// Failures raised by the gateway transport seam.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// The underlying connection machinery failed.
    #[error("transport error: {error}")]
    Transport { error: String },

    /// The remote endpoint could not recommend a shard count.
    #[error("shard count query failed: {error}")]
    CountQuery { error: String },
}

impl GatewayError {
    pub fn transport(error: impl Into<String>) -> Self {
        GatewayError::Transport {
            error: error.into(),
        }
    }

    pub fn count_query(error: impl Into<String>) -> Self {
        GatewayError::CountQuery {
            error: error.into(),
        }
    }
}

/// Failures raised by worker event dispatch.
///
/// `Dispatch` is logged and the worker keeps running; `Fatal` terminates the
/// worker, which the supervisor observes as an unexpected exit.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A single event failed to dispatch; the worker carries on.
    #[error("event dispatch failed: {error}")]
    Dispatch { error: String },

    /// Non-recoverable failure; the worker process exits.
    #[error("fatal worker error: {error}")]
    Fatal { error: String },
}

impl WorkerError {
    pub fn dispatch(error: impl Into<String>) -> Self {
        WorkerError::Dispatch {
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        WorkerError::Fatal {
            error: error.into(),
        }
    }

    /// Whether the worker exits on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Fatal { .. })
    }
}

/// Failures raised by the local request proxy.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The loopback listener could not be bound.
    #[error("proxy bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// The upstream request execution failed.
    #[error("upstream request failed: {error}")]
    Upstream { error: String },
}

impl ProxyError {
    pub fn upstream(error: impl Into<String>) -> Self {
        ProxyError::Upstream {
            error: error.into(),
        }
    }
}
