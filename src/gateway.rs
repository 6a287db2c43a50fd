//! # Connection process adapter.
//!
//! [`GatewayProcess`] owns the protocol connection for a contiguous shard
//! range. The actual connection machinery (handshake, heartbeat, reconnect,
//! compression) lives behind the [`GatewayTransport`] seam; the adapter only
//! forwards opaque payloads in both directions:
//!
//! - inbound transport events go up to the supervisor tagged with their
//!   shard id;
//! - outbound actions (send payload, edit status) are performed against the
//!   transport at-most-once, with failures logged and never retried here;
//! - correlated shard-info queries are answered with the transport's
//!   round-trip time, `-1` when unknown.
//!
//! [`ShardCountSource`] resolves an automatic total shard count by asking
//! the remote endpoint once at startup, and backs the resharding watchdog.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{GatewayError, RuntimeError};
use crate::message::{GatewayAction, GatewayMsg, ShardEvent, SpawnBlob};
use crate::plan::ShardId;

/// Connection parameters decoded from the spawn blob.
#[derive(Clone)]
pub struct GatewaySession {
    pub shards: Vec<ShardId>,
    pub total_shards: u32,
    pub token: String,
    pub intents: u64,
}

impl fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySession")
            .field("shards", &self.shards)
            .field("total_shards", &self.total_shards)
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .finish()
    }
}

/// Seam for the external protocol client library.
#[async_trait]
pub trait GatewayTransport: Send + Sync + 'static {
    /// Drives the connection(s) for the session's shards, pushing every
    /// inbound event into `events`. Runs until cancelled or a fatal
    /// connection error.
    async fn run(
        &self,
        session: GatewaySession,
        events: mpsc::Sender<ShardEvent>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError>;

    /// Sends an opaque payload on one shard's connection.
    async fn send(&self, shard_id: ShardId, payload: Value) -> Result<(), GatewayError>;

    /// Updates presence/status across the session.
    async fn edit_status(&self, payload: Value) -> Result<(), GatewayError>;

    /// Round-trip time of one shard's connection, when known.
    async fn shard_rtt(&self, shard_id: ShardId) -> Option<i64>;
}

/// Resolves the recommended total shard count from the remote endpoint.
#[async_trait]
pub trait ShardCountSource: Send + Sync + 'static {
    async fn recommended_shards(&self) -> Result<u32, GatewayError>;
}

/// The connection process: transport on one side, supervisor on the other.
pub struct GatewayProcess {
    session: GatewaySession,
    transport: Arc<dyn GatewayTransport>,
    actions: mpsc::Receiver<GatewayAction>,
    up: mpsc::Sender<GatewayMsg>,
    event_capacity: usize,
}

impl GatewayProcess {
    /// Builds the process from its spawn blob.
    pub(crate) fn from_blob(
        raw: &str,
        transport: Arc<dyn GatewayTransport>,
        actions: mpsc::Receiver<GatewayAction>,
        up: mpsc::Sender<GatewayMsg>,
        event_capacity: usize,
    ) -> Result<Self, RuntimeError> {
        let blob = SpawnBlob::decode(raw)?;
        Ok(Self {
            session: GatewaySession {
                shards: blob.shards,
                total_shards: blob.total_shards,
                token: blob.token,
                intents: blob.intents,
            },
            transport,
            actions,
            up,
            event_capacity,
        })
    }

    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let GatewayProcess {
            session,
            transport,
            mut actions,
            up,
            event_capacity,
        } = self;

        let (ev_tx, mut ev_rx) = mpsc::channel::<ShardEvent>(event_capacity);
        let link_cancel = cancel.child_token();
        let link = {
            let transport = transport.clone();
            let session = session.clone();
            let token = link_cancel.clone();
            async move { transport.run(session, ev_tx, token).await }
        };
        tokio::pin!(link);

        let fallback_shard = session.shards.first().copied().unwrap_or(0);
        let mut events_open = true;
        let result = loop {
            tokio::select! {
                res = &mut link => {
                    // the transport decides whether its end was clean
                    break res;
                }
                maybe = ev_rx.recv(), if events_open => match maybe {
                    Some(event) => {
                        if up.send(GatewayMsg::Event(event)).await.is_err() {
                            break Ok(());
                        }
                    }
                    None => events_open = false,
                },
                maybe = actions.recv() => match maybe {
                    Some(GatewayAction::SendPayload { shard_id, payload }) => {
                        if let Err(e) = transport.send(shard_id, payload).await {
                            warn!(shard_id, error = %e, "outbound payload failed");
                        }
                    }
                    Some(GatewayAction::EditStatus { payload }) => {
                        if let Err(e) = transport.edit_status(payload).await {
                            warn!(error = %e, "status edit failed");
                        }
                    }
                    Some(GatewayAction::ShardInfo { nonce, shard_id }) => {
                        let shard = shard_id.unwrap_or(fallback_shard);
                        let rtt_ms = transport.shard_rtt(shard).await.unwrap_or(-1);
                        let reply = GatewayMsg::ShardInfo {
                            nonce,
                            shard_id: shard,
                            rtt_ms,
                        };
                        if up.send(reply).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(GatewayAction::Shutdown) | None => break Ok(()),
                },
                _ = cancel.cancelled() => break Ok(()),
            }
        };
        link_cancel.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ChildRole;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that replays scripted events and records outbound actions.
    struct ScriptedTransport {
        inbound: Mutex<Vec<ShardEvent>>,
        sent: Mutex<Vec<(ShardId, Value)>>,
        statuses: Mutex<Vec<Value>>,
        rtt: Option<i64>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<ShardEvent>, rtt: Option<i64>) -> Arc<Self> {
            Arc::new(Self {
                inbound: Mutex::new(inbound),
                sent: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
                rtt,
            })
        }
    }

    #[async_trait]
    impl GatewayTransport for ScriptedTransport {
        async fn run(
            &self,
            _session: GatewaySession,
            events: mpsc::Sender<ShardEvent>,
            cancel: CancellationToken,
        ) -> Result<(), GatewayError> {
            let queued: Vec<ShardEvent> = self.inbound.lock().unwrap().drain(..).collect();
            for ev in queued {
                if events.send(ev).await.is_err() {
                    return Ok(());
                }
            }
            cancel.cancelled().await;
            Ok(())
        }

        async fn send(&self, shard_id: ShardId, payload: Value) -> Result<(), GatewayError> {
            self.sent.lock().unwrap().push((shard_id, payload));
            Ok(())
        }

        async fn edit_status(&self, payload: Value) -> Result<(), GatewayError> {
            self.statuses.lock().unwrap().push(payload);
            Ok(())
        }

        async fn shard_rtt(&self, _shard_id: ShardId) -> Option<i64> {
            self.rtt
        }
    }

    fn blob() -> String {
        SpawnBlob {
            role: ChildRole::Gateway,
            token: "t".to_string(),
            intents: 0,
            total_shards: 4,
            shards: vec![0, 1, 2, 3],
            worker_id: None,
            proxy_addr: None,
            proxy_secret: None,
        }
        .encode()
    }

    fn wire(
        transport: Arc<ScriptedTransport>,
    ) -> (
        GatewayProcess,
        mpsc::Sender<GatewayAction>,
        mpsc::Receiver<GatewayMsg>,
    ) {
        let (action_tx, action_rx) = mpsc::channel(16);
        let (up_tx, up_rx) = mpsc::channel(16);
        let process = GatewayProcess::from_blob(&blob(), transport, action_rx, up_tx, 16).unwrap();
        (process, action_tx, up_rx)
    }

    #[tokio::test]
    async fn inbound_events_are_forwarded_with_shard_ids() {
        let transport = ScriptedTransport::new(
            vec![
                ShardEvent {
                    shard_id: 1,
                    payload: json!({"n": 1}),
                },
                ShardEvent {
                    shard_id: 3,
                    payload: json!({"n": 2}),
                },
            ],
            None,
        );
        let (process, action_tx, mut up_rx) = wire(transport);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(process.run(cancel));

        for expected in [1u32, 3] {
            match up_rx.recv().await.unwrap() {
                GatewayMsg::Event(ev) => assert_eq!(ev.shard_id, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        action_tx.send(GatewayAction::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn outbound_actions_reach_the_transport() {
        let transport = ScriptedTransport::new(vec![], None);
        let (process, action_tx, _up_rx) = wire(transport.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(process.run(cancel));

        action_tx
            .send(GatewayAction::SendPayload {
                shard_id: 2,
                payload: json!({"op": 4}),
            })
            .await
            .unwrap();
        action_tx
            .send(GatewayAction::EditStatus {
                payload: json!({"status": "online"}),
            })
            .await
            .unwrap();
        action_tx.send(GatewayAction::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
        assert_eq!(transport.statuses.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shard_info_reports_rtt_or_minus_one() {
        for (rtt, expected) in [(Some(42i64), 42i64), (None, -1)] {
            let transport = ScriptedTransport::new(vec![], rtt);
            let (process, action_tx, mut up_rx) = wire(transport);
            let cancel = CancellationToken::new();
            let task = tokio::spawn(process.run(cancel));

            let nonce = uuid::Uuid::new_v4();
            action_tx
                .send(GatewayAction::ShardInfo {
                    nonce,
                    shard_id: Some(2),
                })
                .await
                .unwrap();

            match up_rx.recv().await.unwrap() {
                GatewayMsg::ShardInfo {
                    nonce: got,
                    shard_id,
                    rtt_ms,
                } => {
                    assert_eq!(got, nonce);
                    assert_eq!(shard_id, 2);
                    assert_eq!(rtt_ms, expected);
                }
                other => panic!("unexpected message: {other:?}"),
            }

            action_tx.send(GatewayAction::Shutdown).await.unwrap();
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_adapter() {
        let transport = ScriptedTransport::new(vec![], None);
        let (process, _action_tx, _up_rx) = wire(transport);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(process.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("adapter should stop on cancel")
            .unwrap()
            .unwrap();
    }
}
