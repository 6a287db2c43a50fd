//! # Runtime supervisor.
//!
//! The parent coordinator of the whole runtime. It builds the partition
//! plan, spawns and respawns the three process roles, routes messages
//! between the connection process and the owning workers, correlates
//! request/response pairs by nonce, and drives the reload state machine.
//!
//! All mutable registries (ownership map, pending queue, correlation map,
//! child handles) are owned exclusively by the run loop's task. Every
//! external input arrives over a channel and is handled by that one task,
//! so no handler ever races another and no registry needs a lock.
//!
//! Reload semantics:
//! - **rolling** ([`SupervisorHandle::reload_lazy`]) restarts workers one at
//!   a time in ascending order of lowest-owned shard, waiting for each
//!   readiness announcement before touching the next; the connection stays
//!   up and shard ownership is unchanged.
//! - **full** ([`SupervisorHandle::full_reload`]) recomputes the plan, tears
//!   everything down including the connection and proxy, discards buffered
//!   events and correlations, and respawns fresh.
//! - [`SupervisorHandle::reload`] recomputes the plan and picks: rolling when
//!   the assignment is unchanged, full otherwise.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::{GatewayConfig, RestProxyConfig, ShardCount, SupervisorConfig};
use crate::error::{ControlError, ProxyError, RuntimeError};
use crate::event::{Event, EventKind};
use crate::gateway::{GatewayProcess, GatewayTransport, ShardCountSource};
use crate::message::{
    ControlRequest, Counts, GatewayAction, GatewayMsg, ShardEvent, SpawnBlob, WorkerInbox,
    WorkerMsg,
};
use crate::observer::Observe;
use crate::plan::{
    build_plan, ClusterPlan, ClusterSpec, ShardId, ShardOwnership, WorkerConfig, WorkerId,
    WorkerLayout,
};
use crate::process::{stop_with_grace, ChildRole, ProcessHandle};
use crate::queue::{PendingQueue, QueueKey};
use crate::rest_proxy::{RestExecutor, RestProxy};
use crate::worker::{EventHandler, WorkerProcess};
use crate::correlate::Correlations;

const GATEWAY_CHILD: &str = "gateway";
const PROXY_CHILD: &str = "rest-proxy";
const SWEEP_PERIOD: Duration = Duration::from_millis(500);

/// Seam for refreshing compute-side convention data (commands/events) and
/// pushing it to the remote API. Runs in the background during reloads;
/// failures are logged and never fail the reload itself.
#[async_trait]
pub trait ConventionSync: Send + Sync + 'static {
    async fn refresh(&self) -> Result<(), ProxyError>;
}

/// Cloneable control-plane handle to a running supervisor.
///
/// Every mutating call resolves to success, an application-level
/// [`ControlError`], or, if the caller wraps it in its own deadline, a
/// timeout. Calls are processed by the supervisor strictly one at a time.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl SupervisorHandle {
    /// Rolling restart, escalated to a full restart when the recomputed
    /// partition plan no longer matches the active one.
    pub async fn reload(&self) -> Result<(), ControlError> {
        self.roundtrip(|request_id, respond| ControlRequest::Reload {
            request_id,
            respond,
        })
        .await
    }

    /// Rolling one-worker-at-a-time restart; the connection stays up.
    pub async fn reload_lazy(&self) -> Result<(), ControlError> {
        self.roundtrip(|request_id, respond| ControlRequest::ReloadLazy {
            request_id,
            respond,
        })
        .await
    }

    /// Full teardown and respawn of every role, connection included.
    pub async fn full_reload(&self) -> Result<(), ControlError> {
        self.roundtrip(|request_id, respond| ControlRequest::FullReload {
            request_id,
            respond,
        })
        .await
    }

    /// Targeted restart of exactly one worker.
    pub async fn restart_worker(&self, worker_id: &str) -> Result<(), ControlError> {
        let worker_id = worker_id.to_string();
        self.roundtrip(move |request_id, respond| ControlRequest::RestartWorker {
            request_id,
            worker_id,
            respond,
        })
        .await
    }

    /// Targeted restart of the worker owning `shard_id`.
    pub async fn restart_shard(&self, shard_id: ShardId) -> Result<(), ControlError> {
        self.roundtrip(move |request_id, respond| ControlRequest::RestartShard {
            request_id,
            shard_id,
            respond,
        })
        .await
    }

    /// Current shard/worker/cluster counts. Pure in-memory read.
    pub async fn counts(&self) -> Result<Counts, ControlError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest::GetCounts { respond })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Stops the whole runtime: graceful shutdown of every child, buffered
    /// events and correlations cleared, never flushed.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.roundtrip(|request_id, respond| ControlRequest::Stop {
            request_id,
            respond,
        })
        .await
    }

    async fn roundtrip<F>(&self, make: F) -> Result<(), ControlError>
    where
        F: FnOnce(Uuid, oneshot::Sender<Result<(), ControlError>>) -> ControlRequest,
    {
        let request_id = Uuid::new_v4();
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(make(request_id, respond))
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)?
    }
}

/// Builder for [`Supervisor`]. The three role seams are mandatory; clusters,
/// count source, convention sync, and observers are optional.
pub struct SupervisorBuilder {
    cfg: SupervisorConfig,
    gateway_cfg: GatewayConfig,
    transport: Arc<dyn GatewayTransport>,
    handler: Arc<dyn EventHandler>,
    executor: Arc<dyn RestExecutor>,
    clusters: Vec<ClusterSpec>,
    cluster_id: Option<String>,
    count_source: Option<Arc<dyn ShardCountSource>>,
    conventions: Option<Arc<dyn ConventionSync>>,
    observers: Vec<Arc<dyn Observe>>,
    proxy_cfg: Option<RestProxyConfig>,
}

impl SupervisorBuilder {
    /// Cluster layout; without this a single default cluster spanning the
    /// configured shard window is used.
    pub fn with_clusters(mut self, clusters: Vec<ClusterSpec>) -> Self {
        self.clusters = clusters;
        self
    }

    /// Which configured cluster this supervisor instance runs.
    pub fn with_cluster_id(mut self, id: impl Into<String>) -> Self {
        self.cluster_id = Some(id.into());
        self
    }

    /// Source for automatic shard counting and the resharding watchdog.
    pub fn with_count_source(mut self, source: Arc<dyn ShardCountSource>) -> Self {
        self.count_source = Some(source);
        self
    }

    /// Convention refresh hook invoked in the background during reloads.
    pub fn with_conventions(mut self, sync: Arc<dyn ConventionSync>) -> Self {
        self.conventions = Some(sync);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observe>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Overrides the generated proxy config (e.g. to pin the port).
    pub fn with_proxy_config(mut self, cfg: RestProxyConfig) -> Self {
        self.proxy_cfg = Some(cfg);
        self
    }

    pub fn build(self) -> Supervisor {
        let (control_tx, control_rx) = mpsc::channel(64);
        let (gateway_up, gateway_rx) = mpsc::channel(self.cfg.mailbox_capacity);
        let (worker_up, worker_rx) = mpsc::channel(self.cfg.mailbox_capacity);
        let (internal_tx, internal_rx) = mpsc::channel(self.cfg.mailbox_capacity);
        let bus = Bus::new(self.cfg.bus_capacity);
        let pending = PendingQueue::new(self.cfg.pending_limit);
        let correlations = Correlations::new(self.cfg.correlation_ttl);

        Supervisor {
            proxy_cfg: self.proxy_cfg.unwrap_or_else(RestProxyConfig::generate),
            pending,
            correlations,
            bus,
            cfg: self.cfg,
            gateway_cfg: self.gateway_cfg,
            transport: self.transport,
            handler: self.handler,
            executor: self.executor,
            clusters: self.clusters,
            cluster_id: self.cluster_id,
            count_source: self.count_source,
            conventions: self.conventions,
            observers: self.observers,
            plan: None,
            ownership: ShardOwnership::default(),
            total_shards: 0,
            cluster_count: 0,
            state: Lifecycle::Idle,
            children: HashMap::new(),
            worker_tx: HashMap::new(),
            gateway_tx: None,
            ready: HashSet::new(),
            expected: HashSet::new(),
            deferred: VecDeque::new(),
            next_incarnation: 0,
            proxy_addr: None,
            reshard_inflight: false,
            killed: Vec::new(),
            control_tx,
            gateway_up,
            worker_up,
            internal_tx,
            chans: Some(Channels {
                control: control_rx,
                gateway: gateway_rx,
                worker: worker_rx,
                internal: internal_rx,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Reloading,
    Stopping,
}

/// Messages the supervisor sends to itself: exit notices from child wrapper
/// tasks, delayed respawns, resharding ticks.
enum Internal {
    Exited {
        name: String,
        incarnation: u64,
        role: ChildRole,
        error: Option<String>,
    },
    RespawnDue {
        worker_id: WorkerId,
    },
    ReshardTick,
    ReshardChecked {
        recommended: Option<u32>,
    },
}

struct Channels {
    control: mpsc::Receiver<ControlRequest>,
    gateway: mpsc::Receiver<GatewayMsg>,
    worker: mpsc::Receiver<WorkerMsg>,
    internal: mpsc::Receiver<Internal>,
}

enum WaitOutcome {
    Ready,
    TargetExited,
    Stopped,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    gateway_cfg: GatewayConfig,
    transport: Arc<dyn GatewayTransport>,
    handler: Arc<dyn EventHandler>,
    executor: Arc<dyn RestExecutor>,
    clusters: Vec<ClusterSpec>,
    cluster_id: Option<String>,
    count_source: Option<Arc<dyn ShardCountSource>>,
    conventions: Option<Arc<dyn ConventionSync>>,
    observers: Vec<Arc<dyn Observe>>,
    bus: Bus,

    plan: Option<ClusterPlan>,
    ownership: ShardOwnership,
    total_shards: u32,
    cluster_count: usize,
    state: Lifecycle,
    children: HashMap<String, ProcessHandle>,
    worker_tx: HashMap<WorkerId, mpsc::Sender<WorkerInbox>>,
    gateway_tx: Option<mpsc::Sender<GatewayAction>>,
    ready: HashSet<WorkerId>,
    expected: HashSet<String>,
    pending: PendingQueue,
    correlations: Correlations,
    deferred: VecDeque<ControlRequest>,
    next_incarnation: u64,
    proxy_cfg: RestProxyConfig,
    proxy_addr: Option<SocketAddr>,
    reshard_inflight: bool,
    killed: Vec<String>,

    control_tx: mpsc::Sender<ControlRequest>,
    gateway_up: mpsc::Sender<GatewayMsg>,
    worker_up: mpsc::Sender<WorkerMsg>,
    internal_tx: mpsc::Sender<Internal>,
    chans: Option<Channels>,
}

impl Supervisor {
    pub fn builder(
        cfg: SupervisorConfig,
        gateway_cfg: GatewayConfig,
        transport: Arc<dyn GatewayTransport>,
        handler: Arc<dyn EventHandler>,
        executor: Arc<dyn RestExecutor>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            cfg,
            gateway_cfg,
            transport,
            handler,
            executor,
            clusters: Vec::new(),
            cluster_id: None,
            count_source: None,
            conventions: None,
            observers: Vec::new(),
            proxy_cfg: None,
        }
    }

    /// Control-plane handle; clone freely, valid for the supervisor's lifetime.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Subscribes to the lifecycle event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Resolves the plan, spawns every role, and drives the runtime until
    /// [`SupervisorHandle::stop`] or an OS termination signal.
    ///
    /// Configuration errors abort before any child is spawned. Returns
    /// [`RuntimeError::GraceExceeded`] when shutdown had to kill children.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        let Some(mut chans) = self.chans.take() else {
            return Ok(());
        };

        self.spawn_observer_listener();
        self.startup().await?;

        let mut sweep = time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let signal = wait_for_shutdown_signal();
        tokio::pin!(signal);

        let mut stopped = false;
        while !stopped {
            tokio::select! {
                Some(req) = chans.control.recv() => {
                    if self.on_control(req, &mut chans).await.is_break() {
                        stopped = true;
                    }
                    while !stopped {
                        let Some(next) = self.deferred.pop_front() else { break };
                        if self.on_control(next, &mut chans).await.is_break() {
                            stopped = true;
                        }
                    }
                }
                Some(msg) = chans.gateway.recv() => self.on_gateway(msg).await,
                Some(msg) = chans.worker.recv() => self.on_worker(msg).await,
                Some(note) = chans.internal.recv() => self.on_internal(note).await,
                _ = sweep.tick() => self.on_sweep(),
                _ = &mut signal => {
                    info!("termination signal received");
                    self.shutdown().await;
                    stopped = true;
                }
            }
        }

        if self.killed.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::GraceExceeded {
                grace: self.cfg.grace,
                killed: std::mem::take(&mut self.killed),
            })
        }
    }

    // ---- startup ----

    async fn startup(&mut self) -> Result<(), RuntimeError> {
        let total = self.resolve_total().await?;
        let plan = self.build_active_plan(total)?;
        info!(
            cluster = %plan.id,
            shards = total,
            workers = plan.workers.len(),
            "partition plan resolved"
        );

        self.total_shards = total;
        self.cluster_count = self.clusters.len().max(1);
        self.ownership = ShardOwnership::from_workers(&plan.workers);

        self.spawn_proxy().await?;
        self.spawn_gateway(&plan)?;
        for wc in plan.workers_by_lowest_shard() {
            self.spawn_worker(&wc);
        }
        self.plan = Some(plan);

        if self.gateway_cfg.resharding.enabled && self.count_source.is_some() {
            self.spawn_reshard_ticker();
        }
        Ok(())
    }

    async fn resolve_total(&self) -> Result<u32, RuntimeError> {
        let total = match self.gateway_cfg.total_shards {
            ShardCount::Fixed(n) => n,
            ShardCount::Auto => {
                let source = self
                    .count_source
                    .as_ref()
                    .ok_or(crate::error::PlanError::NoCountSource)?;
                source.recommended_shards().await?
            }
        };
        if total == 0 {
            return Err(crate::error::PlanError::ZeroShards.into());
        }
        Ok(total)
    }

    /// Plan for the configured clusters, or a single default cluster derived
    /// from the gateway shard window and worker sizing hints.
    fn build_active_plan(&self, total: u32) -> Result<ClusterPlan, crate::error::PlanError> {
        if !self.clusters.is_empty() {
            return build_plan(total, &self.clusters, self.cluster_id.as_deref());
        }

        let first = self.gateway_cfg.first_shard_id.unwrap_or(0);
        let last = self
            .gateway_cfg
            .last_shard_id
            .unwrap_or_else(|| total.saturating_sub(1));
        let span = last.saturating_sub(first) + 1;
        let workers = if let Some(n) = self.gateway_cfg.total_worker_processes {
            WorkerLayout::Count(n)
        } else if let Some(per) = self.gateway_cfg.shards_per_worker.filter(|per| *per > 0) {
            WorkerLayout::Count(span.div_ceil(per).max(1))
        } else {
            WorkerLayout::Count(1)
        };
        let default = ClusterSpec {
            id: "default".to_string(),
            first_shard_id: first,
            last_shard_id: last,
            workers,
        };
        build_plan(total, &[default], None)
    }

    // ---- spawning ----

    fn next_incarnation(&mut self) -> u64 {
        self.next_incarnation += 1;
        self.next_incarnation
    }

    async fn spawn_proxy(&mut self) -> Result<(), RuntimeError> {
        let proxy = RestProxy::bind(&self.proxy_cfg, self.executor.clone()).await?;
        let addr = proxy.local_addr()?;
        self.proxy_addr = Some(addr);

        let cancel = CancellationToken::new();
        let incarnation = self.next_incarnation();
        let internal = self.internal_tx.clone();
        let child = cancel.clone();
        let join = tokio::spawn(async move {
            let result = proxy.run(child).await;
            let _ = internal
                .send(Internal::Exited {
                    name: PROXY_CHILD.to_string(),
                    incarnation,
                    role: ChildRole::RestProxy,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
        self.children.insert(
            PROXY_CHILD.to_string(),
            ProcessHandle {
                name: PROXY_CHILD.to_string(),
                role: ChildRole::RestProxy,
                incarnation,
                cancel,
                join,
            },
        );
        self.publish(
            Event::now(EventKind::ProcessSpawning)
                .with_child(PROXY_CHILD)
                .with_role(ChildRole::RestProxy),
        );
        Ok(())
    }

    fn spawn_gateway(&mut self, plan: &ClusterPlan) -> Result<(), RuntimeError> {
        let (tx, rx) = mpsc::channel(self.cfg.mailbox_capacity);
        let blob = SpawnBlob {
            role: ChildRole::Gateway,
            token: self.gateway_cfg.token.clone(),
            intents: self.gateway_cfg.intents,
            total_shards: self.total_shards,
            shards: plan.range.iter().collect(),
            worker_id: None,
            proxy_addr: self.proxy_addr,
            proxy_secret: Some(self.proxy_cfg.authorization_secret.clone()),
        }
        .encode();
        let process = GatewayProcess::from_blob(
            &blob,
            self.transport.clone(),
            rx,
            self.gateway_up.clone(),
            self.cfg.mailbox_capacity,
        )?;

        let cancel = CancellationToken::new();
        let incarnation = self.next_incarnation();
        let internal = self.internal_tx.clone();
        let child = cancel.clone();
        let join = tokio::spawn(async move {
            let result = process.run(child).await;
            let _ = internal
                .send(Internal::Exited {
                    name: GATEWAY_CHILD.to_string(),
                    incarnation,
                    role: ChildRole::Gateway,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
        self.children.insert(
            GATEWAY_CHILD.to_string(),
            ProcessHandle {
                name: GATEWAY_CHILD.to_string(),
                role: ChildRole::Gateway,
                incarnation,
                cancel,
                join,
            },
        );
        self.gateway_tx = Some(tx);
        self.publish(
            Event::now(EventKind::ProcessSpawning)
                .with_child(GATEWAY_CHILD)
                .with_role(ChildRole::Gateway),
        );
        Ok(())
    }

    fn spawn_worker(&mut self, wc: &WorkerConfig) {
        let (tx, rx) = mpsc::channel(self.cfg.mailbox_capacity);
        let blob = SpawnBlob {
            role: ChildRole::Worker,
            token: self.gateway_cfg.token.clone(),
            intents: self.gateway_cfg.intents,
            total_shards: self.total_shards,
            shards: wc.shards.clone(),
            worker_id: Some(wc.id.clone()),
            proxy_addr: self.proxy_addr,
            proxy_secret: Some(self.proxy_cfg.authorization_secret.clone()),
        }
        .encode();
        let process =
            match WorkerProcess::from_blob(&blob, self.handler.clone(), rx, self.worker_up.clone())
            {
                Ok(process) => process,
                Err(e) => {
                    error!(worker_id = %wc.id, error = %e, "worker spawn blob rejected");
                    return;
                }
            };

        let cancel = CancellationToken::new();
        let incarnation = self.next_incarnation();
        let internal = self.internal_tx.clone();
        let name = wc.id.clone();
        let child = cancel.clone();
        let join = tokio::spawn(async move {
            let result = process.run(child).await;
            let _ = internal
                .send(Internal::Exited {
                    name,
                    incarnation,
                    role: ChildRole::Worker,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
        self.children.insert(
            wc.id.clone(),
            ProcessHandle {
                name: wc.id.clone(),
                role: ChildRole::Worker,
                incarnation,
                cancel,
                join,
            },
        );
        self.worker_tx.insert(wc.id.clone(), tx);
        self.publish(
            Event::now(EventKind::ProcessSpawning)
                .with_child(wc.id.clone())
                .with_role(ChildRole::Worker),
        );
    }

    // ---- stopping ----

    /// Intentional stop of one child: shutdown message, bounded grace wait,
    /// forced kill past the grace period. Returns `false` when the child was
    /// not running.
    async fn stop_child(&mut self, name: &str) -> bool {
        let Some(handle) = self.children.remove(name) else {
            return false;
        };
        self.expected.insert(name.to_string());
        self.publish(
            Event::now(EventKind::ProcessStopping)
                .with_child(name)
                .with_role(handle.role),
        );
        self.send_shutdown(&handle);
        let killed = stop_with_grace(handle, self.cfg.grace).await;
        if killed {
            self.record_kill(name.to_string());
        }
        true
    }

    fn record_kill(&mut self, name: String) {
        // an aborted child never reports its exit, so drop the flag too
        self.expected.remove(&name);
        warn!(child = %name, "grace exceeded, child killed");
        self.publish(Event::now(EventKind::GraceExceeded).with_child(&name));
        // only shutdown-time kills fail the runtime as a whole
        if self.state == Lifecycle::Stopping {
            self.killed.push(name);
        }
    }

    /// Flags the expected shutdown and sends the role-specific message.
    fn send_shutdown(&mut self, handle: &ProcessHandle) {
        match handle.role {
            ChildRole::Worker => {
                self.ready.remove(&handle.name);
                if let Some(tx) = self.worker_tx.remove(&handle.name) {
                    let _ = tx.try_send(WorkerInbox::Shutdown);
                }
            }
            ChildRole::Gateway => {
                if let Some(tx) = self.gateway_tx.take() {
                    let _ = tx.try_send(GatewayAction::Shutdown);
                }
            }
            ChildRole::RestProxy => {
                self.proxy_addr = None;
                handle.cancel.cancel();
            }
        }
    }

    /// Stops several children concurrently; each gets the full grace period.
    async fn stop_children_parallel(&mut self, names: Vec<String>) {
        let mut set = JoinSet::new();
        for name in names {
            let Some(handle) = self.children.remove(&name) else {
                continue;
            };
            self.expected.insert(name.clone());
            self.publish(
                Event::now(EventKind::ProcessStopping)
                    .with_child(&name)
                    .with_role(handle.role),
            );
            self.send_shutdown(&handle);
            let grace = self.cfg.grace;
            set.spawn(async move { (name, stop_with_grace(handle, grace).await) });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((name, killed)) = joined {
                if killed {
                    self.record_kill(name);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == Lifecycle::Stopping {
            return;
        }
        self.state = Lifecycle::Stopping;
        self.publish(Event::now(EventKind::ShutdownRequested));

        let names: Vec<String> = self.children.keys().cloned().collect();
        let had_kills_before = self.killed.len();
        self.stop_children_parallel(names).await;

        // cleared, not delivered
        self.pending.clear();
        self.correlations.clear();
        self.ready.clear();
        self.worker_tx.clear();
        self.gateway_tx = None;
        self.proxy_addr = None;

        for req in self.deferred.drain(..).collect::<Vec<_>>() {
            reject(req, ControlError::ShuttingDown);
        }

        if self.killed.len() == had_kills_before {
            self.publish(Event::now(EventKind::AllStoppedWithin));
        }
    }

    // ---- control plane ----

    async fn on_control(
        &mut self,
        req: ControlRequest,
        chans: &mut Channels,
    ) -> ControlFlow<()> {
        match req {
            ControlRequest::GetCounts { respond } => {
                let _ = respond.send(self.counts());
                return ControlFlow::Continue(());
            }
            // every reload and restart variant is a no-op once shutdown began
            req if self.state == Lifecycle::Stopping => {
                reject(req, ControlError::ShuttingDown);
                return ControlFlow::Continue(());
            }
            ControlRequest::Reload {
                request_id,
                respond,
            } => {
                debug!(%request_id, "reload requested");
                let result = self.reload_auto(chans).await;
                let _ = respond.send(result);
            }
            ControlRequest::ReloadLazy {
                request_id,
                respond,
            } => {
                debug!(%request_id, "rolling reload requested");
                let result = self.lazy_reload(chans).await;
                let _ = respond.send(result);
            }
            ControlRequest::FullReload {
                request_id,
                respond,
            } => {
                debug!(%request_id, "full reload requested");
                let result = match self.resolve_fresh_plan().await {
                    Ok((total, plan)) => self.full_reload(total, plan).await,
                    Err(e) => Err(e),
                };
                let _ = respond.send(result);
            }
            ControlRequest::RestartWorker {
                request_id,
                worker_id,
                respond,
            } => {
                debug!(%request_id, worker_id = %worker_id, "worker restart requested");
                let result = self.restart_worker(&worker_id).await;
                let _ = respond.send(result);
            }
            ControlRequest::RestartShard {
                request_id,
                shard_id,
                respond,
            } => {
                debug!(%request_id, shard_id, "shard restart requested");
                let result = match self.ownership.owner_of(shard_id).map(str::to_string) {
                    Some(owner) => self.restart_worker(&owner).await,
                    None => Err(ControlError::UnknownShard { shard: shard_id }),
                };
                let _ = respond.send(result);
            }
            ControlRequest::Stop {
                request_id,
                respond,
            } => {
                info!(%request_id, "stop requested");
                self.shutdown().await;
                let _ = respond.send(Ok(()));
                return ControlFlow::Break(());
            }
        }

        // a stop processed inside a nested reload drain lands here
        if self.state == Lifecycle::Stopping {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn counts(&self) -> Counts {
        Counts {
            shard_count: self.ownership.shard_count(),
            worker_count: self.plan.as_ref().map_or(0, |p| p.workers.len()),
            cluster_count: self.cluster_count,
        }
    }

    async fn restart_worker(&mut self, worker_id: &str) -> Result<(), ControlError> {
        let Some(wc) = self
            .plan
            .as_ref()
            .and_then(|p| p.worker(worker_id))
            .cloned()
        else {
            return Err(ControlError::UnknownWorker {
                id: worker_id.to_string(),
            });
        };
        self.stop_child(worker_id).await;
        self.spawn_worker(&wc);
        Ok(())
    }

    // ---- reloads ----

    async fn resolve_fresh_plan(&mut self) -> Result<(u32, ClusterPlan), ControlError> {
        let total = self
            .resolve_total()
            .await
            .map_err(|e| ControlError::ReloadFailed {
                reason: e.to_string(),
            })?;
        let plan = self
            .build_active_plan(total)
            .map_err(|e| ControlError::ReloadFailed {
                reason: e.to_string(),
            })?;
        Ok((total, plan))
    }

    /// Rolling when the fresh plan matches the active one, full otherwise.
    async fn reload_auto(&mut self, chans: &mut Channels) -> Result<(), ControlError> {
        let (total, plan) = self.resolve_fresh_plan().await?;
        let unchanged = self.total_shards == total && self.plan.as_ref() == Some(&plan);
        if unchanged {
            self.lazy_reload(chans).await
        } else {
            info!("partition plan changed, escalating to full reload");
            self.full_reload(total, plan).await
        }
    }

    /// One worker at a time, ascending by lowest-owned shard, each awaited
    /// to readiness before the next is touched. Never interrupts the
    /// connection or the proxy; ownership is unchanged.
    async fn lazy_reload(&mut self, chans: &mut Channels) -> Result<(), ControlError> {
        let Some(plan) = self.plan.clone() else {
            return Err(ControlError::ReloadFailed {
                reason: "no active plan".to_string(),
            });
        };
        self.state = Lifecycle::Reloading;
        self.publish(Event::now(EventKind::ReloadStarted).with_mode("rolling"));
        self.sync_conventions();

        for wc in plan.workers_by_lowest_shard() {
            self.stop_child(&wc.id).await;
            self.spawn_worker(&wc);
            loop {
                match self.drain_until_ready(&wc.id, chans).await {
                    WaitOutcome::Ready => break,
                    WaitOutcome::TargetExited => {
                        // same respawn rule a crash would get, kept serial
                        time::sleep(self.cfg.respawn_delay).await;
                        if self.state == Lifecycle::Stopping {
                            return Err(ControlError::ShuttingDown);
                        }
                        self.spawn_worker(&wc);
                    }
                    WaitOutcome::Stopped => return Err(ControlError::ShuttingDown),
                }
            }
        }

        self.state = Lifecycle::Idle;
        self.publish(Event::now(EventKind::ReloadFinished).with_mode("rolling"));
        Ok(())
    }

    /// Keeps routing and exit handling live while a freshly respawned worker
    /// comes up. Mutating control requests arriving now are deferred and run
    /// after the reload, strictly serialized; count queries answer
    /// immediately; stop wins over the reload.
    async fn drain_until_ready(&mut self, target: &str, chans: &mut Channels) -> WaitOutcome {
        loop {
            if self.ready.contains(target) {
                return WaitOutcome::Ready;
            }
            if !self.children.contains_key(target) {
                return WaitOutcome::TargetExited;
            }
            tokio::select! {
                Some(msg) = chans.gateway.recv() => self.on_gateway(msg).await,
                Some(msg) = chans.worker.recv() => self.on_worker(msg).await,
                Some(note) = chans.internal.recv() => self.on_internal(note).await,
                Some(req) = chans.control.recv() => match req {
                    ControlRequest::GetCounts { respond } => {
                        let _ = respond.send(self.counts());
                    }
                    ControlRequest::Stop { request_id, respond } => {
                        info!(%request_id, "stop requested mid-reload");
                        self.shutdown().await;
                        let _ = respond.send(Ok(()));
                        return WaitOutcome::Stopped;
                    }
                    other => self.deferred.push_back(other),
                },
            }
        }
    }

    /// Full teardown: workers in parallel, then connection and proxy, with
    /// buffered events and correlations discarded, then a fresh spawn of
    /// everything under the already-validated new plan.
    async fn full_reload(
        &mut self,
        total: u32,
        plan: ClusterPlan,
    ) -> Result<(), ControlError> {
        self.state = Lifecycle::Reloading;
        self.publish(Event::now(EventKind::ReloadStarted).with_mode("full"));
        self.sync_conventions();

        let workers: Vec<String> = self
            .children
            .values()
            .filter(|h| h.role == ChildRole::Worker)
            .map(|h| h.name.clone())
            .collect();
        self.stop_children_parallel(workers).await;

        self.pending.clear();
        self.correlations.clear();
        self.ready.clear();
        self.worker_tx.clear();

        self.stop_children_parallel(vec![GATEWAY_CHILD.to_string(), PROXY_CHILD.to_string()])
            .await;

        self.total_shards = total;
        self.ownership = ShardOwnership::from_workers(&plan.workers);

        let result = match self.spawn_proxy().await {
            Ok(()) => self.spawn_gateway(&plan),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.state = Lifecycle::Idle;
            error!(error = %e, "full reload failed to respawn the structural processes");
            return Err(ControlError::ReloadFailed {
                reason: e.to_string(),
            });
        }
        for wc in plan.workers_by_lowest_shard() {
            self.spawn_worker(&wc);
        }
        self.plan = Some(plan);

        self.state = Lifecycle::Idle;
        self.publish(Event::now(EventKind::ReloadFinished).with_mode("full"));
        Ok(())
    }

    fn sync_conventions(&self) {
        if let Some(sync) = self.conventions.clone() {
            tokio::spawn(async move {
                if let Err(e) = sync.refresh().await {
                    warn!(error = %e, "convention refresh failed");
                }
            });
        }
    }

    // ---- routing ----

    async fn on_gateway(&mut self, msg: GatewayMsg) {
        match msg {
            GatewayMsg::Event(event) => self.route_event(event),
            GatewayMsg::ShardInfo {
                nonce,
                shard_id,
                rtt_ms,
            } => {
                // unknown or expired nonces are a no-op
                if let Some(reply) = self.correlations.take(&nonce) {
                    let _ = reply.send(crate::message::ShardInfoReply { shard_id, rtt_ms });
                }
            }
        }
    }

    fn route_event(&mut self, event: ShardEvent) {
        match self.ownership.owner_of(event.shard_id).map(str::to_string) {
            Some(worker_id) => self.deliver_or_queue(&worker_id, event),
            None => {
                let shard = event.shard_id;
                let dropped = self.pending.push(QueueKey::Unowned(shard), event);
                self.publish(Event::now(EventKind::EventQueued).with_shard(shard));
                if dropped.is_some() {
                    self.publish(Event::now(EventKind::EventDropped).with_shard(shard));
                }
            }
        }
    }

    /// Direct delivery for a ready worker, after its backlog; everything
    /// else buffers so arrival order is never violated.
    fn deliver_or_queue(&mut self, worker_id: &str, event: ShardEvent) {
        if self.ready.contains(worker_id) {
            self.drain_backlog(worker_id);
            if !self.pending.has_pending(worker_id) {
                if let Some(tx) = self.worker_tx.get(worker_id) {
                    match tx.try_send(WorkerInbox::Event(event)) {
                        Ok(()) => return,
                        Err(err) => {
                            if let WorkerInbox::Event(event) = err.into_inner() {
                                self.queue_event(worker_id, event);
                            }
                            return;
                        }
                    }
                }
            }
        }
        self.queue_event(worker_id, event);
    }

    fn queue_event(&mut self, worker_id: &str, event: ShardEvent) {
        let shard = event.shard_id;
        let dropped = self
            .pending
            .push(QueueKey::Worker(worker_id.to_string()), event);
        self.publish(
            Event::now(EventKind::EventQueued)
                .with_child(worker_id)
                .with_shard(shard),
        );
        if dropped.is_some() {
            self.publish(
                Event::now(EventKind::EventDropped)
                    .with_child(worker_id)
                    .with_shard(shard),
            );
        }
    }

    /// Flushes buffered events to a ready worker, oldest first, until the
    /// backlog is empty or its mailbox fills up.
    fn drain_backlog(&mut self, worker_id: &str) {
        let Some(tx) = self.worker_tx.get(worker_id).cloned() else {
            return;
        };
        let mut flushed = 0usize;
        while let Some(event) = self.pending.peek(worker_id) {
            match tx.try_send(WorkerInbox::Event(event.clone())) {
                Ok(()) => {
                    self.pending.pop(worker_id);
                    flushed += 1;
                }
                Err(_) => break,
            }
        }
        if flushed > 0 {
            self.publish(
                Event::now(EventKind::QueueFlushed)
                    .with_child(worker_id)
                    .with_count(flushed),
            );
        }
    }

    async fn on_worker(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Ready { worker_id } => {
                // a late announcement from a gone incarnation must not
                // mark the current one ready
                if !self.children.contains_key(&worker_id) {
                    return;
                }
                self.ready.insert(worker_id.clone());
                self.publish(
                    Event::now(EventKind::ProcessReady)
                        .with_child(&worker_id)
                        .with_role(ChildRole::Worker),
                );
                self.drain_backlog(&worker_id);
            }
            WorkerMsg::SendPayload { shard_id, payload } => {
                let forwarded = self
                    .gateway_tx
                    .as_ref()
                    .map(|tx| {
                        tx.try_send(GatewayAction::SendPayload { shard_id, payload })
                            .is_ok()
                    })
                    .unwrap_or(false);
                if !forwarded {
                    // at-most-once: no buffering, no retry
                    warn!(shard_id, "outbound payload dropped, connection unavailable");
                }
            }
            WorkerMsg::EditStatus { payload } => {
                let forwarded = self
                    .gateway_tx
                    .as_ref()
                    .map(|tx| tx.try_send(GatewayAction::EditStatus { payload }).is_ok())
                    .unwrap_or(false);
                if !forwarded {
                    warn!("status edit dropped, connection unavailable");
                }
            }
            WorkerMsg::ShardInfo {
                worker_id,
                nonce,
                shard_id,
                reply,
            } => {
                self.correlations.insert(nonce, worker_id, reply);
                let forwarded = self
                    .gateway_tx
                    .as_ref()
                    .map(|tx| {
                        tx.try_send(GatewayAction::ShardInfo { nonce, shard_id })
                            .is_ok()
                    })
                    .unwrap_or(false);
                if !forwarded {
                    // caller's own deadline will surface this
                    self.correlations.cancel(&nonce);
                }
            }
        }
    }

    // ---- internal notices ----

    async fn on_internal(&mut self, note: Internal) {
        match note {
            Internal::Exited {
                name,
                incarnation,
                role,
                error,
            } => self.on_child_exited(name, incarnation, role, error),
            Internal::RespawnDue { worker_id } => self.on_respawn_due(worker_id),
            Internal::ReshardTick => self.start_reshard_check(),
            Internal::ReshardChecked { recommended } => {
                self.on_reshard_checked(recommended).await;
            }
        }
    }

    fn on_child_exited(
        &mut self,
        name: String,
        incarnation: u64,
        role: ChildRole,
        error: Option<String>,
    ) {
        let is_current = self
            .children
            .get(&name)
            .is_some_and(|h| h.incarnation == incarnation);
        if !is_current {
            // notice from an intentional stop, or from an older incarnation
            if self.expected.remove(&name) {
                self.publish(
                    Event::now(EventKind::ProcessStopped)
                        .with_child(&name)
                        .with_role(role),
                );
            }
            return;
        }

        self.children.remove(&name);
        match role {
            ChildRole::Worker => {
                self.ready.remove(&name);
                self.worker_tx.remove(&name);
            }
            ChildRole::Gateway => self.gateway_tx = None,
            ChildRole::RestProxy => self.proxy_addr = None,
        }

        let mut failed = Event::now(EventKind::ProcessFailed)
            .with_child(&name)
            .with_role(role);
        if let Some(error) = &error {
            failed = failed.with_error(error.clone());
        }
        self.publish(failed);

        match role {
            ChildRole::Worker => {
                if self.state != Lifecycle::Idle {
                    return;
                }
                let delay = self.cfg.respawn_delay;
                self.publish(
                    Event::now(EventKind::RespawnScheduled)
                        .with_child(&name)
                        .with_delay(delay),
                );
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    let _ = internal.send(Internal::RespawnDue { worker_id: name }).await;
                });
            }
            ChildRole::Gateway | ChildRole::RestProxy => {
                // structural processes are not respawned automatically
                error!(
                    child = %name,
                    role = %role,
                    error = ?error,
                    "structural process exited, operator action required"
                );
            }
        }
    }

    fn on_respawn_due(&mut self, worker_id: WorkerId) {
        // a stop or reload that began while the timer ran wins
        if self.state != Lifecycle::Idle {
            return;
        }
        if self.children.contains_key(&worker_id) {
            return;
        }
        let Some(wc) = self
            .plan
            .as_ref()
            .and_then(|p| p.worker(&worker_id))
            .cloned()
        else {
            return;
        };
        self.spawn_worker(&wc);
    }

    // ---- resharding ----

    fn spawn_reshard_ticker(&self) {
        let period = self.gateway_cfg.resharding.check_interval();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut tick = time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                if internal.send(Internal::ReshardTick).await.is_err() {
                    break;
                }
            }
        });
    }

    fn start_reshard_check(&mut self) {
        if self.reshard_inflight || self.state != Lifecycle::Idle {
            return;
        }
        let Some(source) = self.count_source.clone() else {
            return;
        };
        self.reshard_inflight = true;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let recommended = match source.recommended_shards().await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "shard count check failed");
                    None
                }
            };
            let _ = internal
                .send(Internal::ReshardChecked { recommended })
                .await;
        });
    }

    async fn on_reshard_checked(&mut self, recommended: Option<u32>) {
        self.reshard_inflight = false;
        let Some(recommended) = recommended else {
            return;
        };
        if self.state != Lifecycle::Idle || recommended == 0 || self.total_shards == 0 {
            return;
        }
        let pct = recommended as f64 / self.total_shards as f64 * 100.0;
        if pct < self.gateway_cfg.resharding.full_percentage_threshold {
            return;
        }
        self.publish(Event::now(EventKind::ReshardTriggered).with_count(recommended as usize));
        match self.build_active_plan(recommended) {
            Ok(plan) => {
                if let Err(e) = self.full_reload(recommended, plan).await {
                    error!(error = %e, "resharding reload failed");
                }
            }
            Err(e) => error!(error = %e, "resharding produced an invalid plan"),
        }
    }

    // ---- housekeeping ----

    fn on_sweep(&mut self) {
        for (_nonce, worker_id) in self.correlations.sweep() {
            self.publish(Event::now(EventKind::CorrelationExpired).with_child(worker_id));
        }
        for worker_id in self.pending.workers_with_pending() {
            if self.ready.contains(&worker_id) {
                self.drain_backlog(&worker_id);
            }
        }
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    fn spawn_observer_listener(&self) {
        if self.observers.is_empty() {
            return;
        }
        let observers = self.observers.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                for observer in &observers {
                    observer.on_event(&event).await;
                }
            }
        });
    }
}

fn reject(req: ControlRequest, err: ControlError) {
    match req {
        ControlRequest::Reload { respond, .. }
        | ControlRequest::ReloadLazy { respond, .. }
        | ControlRequest::FullReload { respond, .. }
        | ControlRequest::RestartWorker { respond, .. }
        | ControlRequest::RestartShard { respond, .. }
        | ControlRequest::Stop { respond, .. } => {
            let _ = respond.send(Err(err));
        }
        ControlRequest::GetCounts { .. } => {}
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt());
    let sigterm = signal(SignalKind::terminate());
    match (sigint, sigterm) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }
        // without handlers, never resolve; stop() remains available
        _ => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
