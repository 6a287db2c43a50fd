use std::time::{Duration, SystemTime};

use crate::process::ChildRole;

/// Lifecycle and routing events published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProcessSpawning,
    ProcessReady,
    ProcessStopping,
    ProcessStopped,
    ProcessFailed,
    RespawnScheduled,
    EventQueued,
    EventDropped,
    QueueFlushed,
    CorrelationExpired,
    ReloadStarted,
    ReloadFinished,
    ReshardTriggered,
    ShutdownRequested,
    AllStoppedWithin,
    GraceExceeded,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub at: SystemTime,
    pub child: Option<String>,
    pub role: Option<ChildRole>,
    pub shard: Option<u32>,
    pub delay: Option<Duration>,
    pub count: Option<usize>,
    pub mode: Option<&'static str>,
    pub error: Option<String>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            at: SystemTime::now(),
            child: None,
            role: None,
            shard: None,
            delay: None,
            count: None,
            mode: None,
            error: None,
        }
    }

    pub fn with_child(mut self, name: impl Into<String>) -> Self {
        self.child = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: ChildRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn with_count(mut self, n: usize) -> Self {
        self.count = Some(n);
        self
    }

    pub fn with_mode(mut self, mode: &'static str) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }
}
