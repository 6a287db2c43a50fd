//! # Child process bookkeeping.
//!
//! [`ProcessHandle`] is the supervisor's per-child lifecycle record: the
//! spawned task, its cancellation token, its declared role, and an
//! incarnation number that distinguishes exit notices of a previous
//! incarnation from the current one after a respawn under the same name.
//!
//! [`stop_with_grace`] implements the escalation ladder for an intentional
//! stop: the role-specific shutdown message has already been sent by the
//! caller; this waits up to the grace period for a voluntary exit, then
//! cancels and aborts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// The three supervised process roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildRole {
    /// Owns the protocol connection for a contiguous shard range.
    Gateway,
    /// Executes outbound API requests on behalf of all workers.
    RestProxy,
    /// Owns a subset of shards and runs event dispatch for them.
    Worker,
}

impl std::fmt::Display for ChildRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildRole::Gateway => write!(f, "gateway"),
            ChildRole::RestProxy => write!(f, "rest-proxy"),
            ChildRole::Worker => write!(f, "worker"),
        }
    }
}

/// Per-child lifecycle record held by the supervisor.
#[derive(Debug)]
pub struct ProcessHandle {
    pub name: String,
    pub role: ChildRole,
    /// Monotonic spawn counter; stale exit notices carry an older value.
    pub incarnation: u64,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

/// Waits for a child's voluntary exit, escalating to a forced kill once the
/// grace period runs out. Returns `true` when the child had to be killed.
pub(crate) async fn stop_with_grace(mut handle: ProcessHandle, grace: Duration) -> bool {
    match time::timeout(grace, &mut handle.join).await {
        Ok(_) => false,
        Err(_) => {
            handle.cancel.cancel();
            handle.join.abort();
            let _ = handle.join.await;
            true
        }
    }
}
