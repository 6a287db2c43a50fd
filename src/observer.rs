use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventKind};

/// Hook into runtime lifecycle events (logging, metrics, custom sinks).
#[async_trait]
pub trait Observe: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// Built-in observer that maps bus events onto `tracing` records.
pub struct TraceWriter;

#[async_trait]
impl Observe for TraceWriter {
    async fn on_event(&self, e: &Event) {
        let child = e.child.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::ProcessSpawning => {
                info!(child, role = ?e.role, "spawning child process");
            }
            EventKind::ProcessReady => {
                info!(child, "child process ready");
            }
            EventKind::ProcessStopping => {
                debug!(child, "stopping child process");
            }
            EventKind::ProcessStopped => {
                info!(child, "child process stopped");
            }
            EventKind::ProcessFailed => {
                error!(child, role = ?e.role, error = ?e.error, "child process exited unexpectedly");
            }
            EventKind::RespawnScheduled => {
                warn!(child, delay = ?e.delay, "respawn scheduled");
            }
            EventKind::EventQueued => {
                debug!(child, shard = ?e.shard, "event buffered until worker is ready");
            }
            EventKind::EventDropped => {
                warn!(child, shard = ?e.shard, "pending queue full, oldest event dropped");
            }
            EventKind::QueueFlushed => {
                debug!(child, count = ?e.count, "pending events flushed");
            }
            EventKind::CorrelationExpired => {
                warn!(child, "correlated request expired without a response");
            }
            EventKind::ReloadStarted => {
                info!(mode = ?e.mode, "reload started");
            }
            EventKind::ReloadFinished => {
                info!(mode = ?e.mode, "reload finished");
            }
            EventKind::ReshardTriggered => {
                warn!(count = ?e.count, "recommended shard count exceeded threshold, resharding");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!("all children stopped within grace");
            }
            EventKind::GraceExceeded => {
                error!(child, "grace exceeded, children were killed");
            }
        }
    }
}
