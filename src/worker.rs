//! # Compute process adapter.
//!
//! [`WorkerProcess`] owns a subset of shards and runs event/command dispatch
//! for them through the [`EventHandler`] seam. It never talks to the
//! connection directly: outbound actions and correlated queries go through
//! the supervisor's relay via the [`WorkerContext`] handed to the handler.
//!
//! On start the worker announces readiness, which is what releases any
//! events the supervisor buffered for it while it was down. Events are
//! dispatched strictly one at a time, in delivery order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ControlError, RuntimeError, WorkerError};
use crate::message::{ShardEvent, ShardInfoReply, SpawnBlob, WorkerInbox, WorkerMsg};
use crate::plan::{ShardId, WorkerId};

/// Seam for the bot's event/command dispatch logic.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Dispatches one inbound event. A `Dispatch` error is logged and the
    /// worker carries on; a `Fatal` error terminates the worker.
    async fn handle(&self, event: ShardEvent, ctx: &WorkerContext) -> Result<(), WorkerError>;
}

/// The worker's side of the supervisor relay.
///
/// Cloneable; handlers keep it for the lifetime of one worker incarnation.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    shards: Vec<ShardId>,
    up: mpsc::Sender<WorkerMsg>,
}

impl WorkerContext {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Shards this worker owns, ascending.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Sends an opaque payload on one shard's connection. At-most-once; the
    /// supervisor forwards it without retrying.
    pub async fn send_payload(&self, shard_id: ShardId, payload: Value) -> Result<(), ControlError> {
        self.up
            .send(WorkerMsg::SendPayload { shard_id, payload })
            .await
            .map_err(|_| ControlError::Closed)
    }

    /// Updates presence/status. At-most-once.
    pub async fn edit_status(&self, payload: Value) -> Result<(), ControlError> {
        self.up
            .send(WorkerMsg::EditStatus { payload })
            .await
            .map_err(|_| ControlError::Closed)
    }

    /// Correlated shard-info query. Resolves with the reply, or with
    /// [`ControlError::Timeout`] when no response arrives in time; a late
    /// response after the timeout is discarded by the relay.
    pub async fn shard_info(
        &self,
        shard_id: Option<ShardId>,
        timeout: Duration,
    ) -> Result<ShardInfoReply, ControlError> {
        let nonce = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let request = WorkerMsg::ShardInfo {
            worker_id: self.worker_id.clone(),
            nonce,
            shard_id,
            reply,
        };
        if self.up.send(request).await.is_err() {
            return Err(ControlError::Closed);
        }
        match time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // closed = the relay evicted the nonce; same surface as no answer
            Ok(Err(_)) | Err(_) => Err(ControlError::Timeout { timeout }),
        }
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .field("shards", &self.shards)
            .finish()
    }
}

/// The compute process: inbox from the supervisor, dispatch via the handler.
pub struct WorkerProcess {
    worker_id: WorkerId,
    handler: Arc<dyn EventHandler>,
    inbox: mpsc::Receiver<WorkerInbox>,
    ctx: WorkerContext,
}

impl WorkerProcess {
    /// Builds the process from its spawn blob.
    pub(crate) fn from_blob(
        raw: &str,
        handler: Arc<dyn EventHandler>,
        inbox: mpsc::Receiver<WorkerInbox>,
        up: mpsc::Sender<WorkerMsg>,
    ) -> Result<Self, RuntimeError> {
        let blob = SpawnBlob::decode(raw)?;
        let worker_id = blob.worker_id.unwrap_or_default();
        let ctx = WorkerContext {
            worker_id: worker_id.clone(),
            shards: blob.shards,
            up,
        };
        Ok(Self {
            worker_id,
            handler,
            inbox,
            ctx,
        })
    }

    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let WorkerProcess {
            worker_id,
            handler,
            mut inbox,
            ctx,
        } = self;

        // Readiness releases whatever the supervisor buffered for us.
        let ready = WorkerMsg::Ready {
            worker_id: worker_id.clone(),
        };
        if ctx.up.send(ready).await.is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                maybe = inbox.recv() => match maybe {
                    Some(WorkerInbox::Event(event)) => {
                        let shard_id = event.shard_id;
                        if let Err(e) = handler.handle(event, &ctx).await {
                            if e.is_fatal() {
                                return Err(e);
                            }
                            warn!(worker_id = %worker_id, shard_id, error = %e, "event dispatch failed");
                        }
                    }
                    Some(WorkerInbox::Shutdown) | None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
