//! # shardvisor
//!
//! **Shardvisor** is the control plane for a horizontally scaled real-time
//! event-processing bot: it partitions a set of logical shards across worker
//! processes, supervises every process role through crashes and
//! reconfiguration, and routes messages between the single connection-owning
//! process and the many compute-owning processes.
//!
//! ## Architecture
//! ```text
//!                         ┌──────────────────────────────┐
//!           control API ─►│          Supervisor          │
//!  (reload / restart /    │  - partition plan + owners   │
//!   counts / stop)        │  - pending event queue       │
//!                         │  - nonce correlations        │
//!                         │  - reload state machine      │
//!                         └──┬──────────┬─────────────┬──┘
//!                            ▼          ▼             ▼
//!                     ┌──────────┐ ┌──────────┐ ┌───────────┐
//!                     │ Gateway  │ │RestProxy │ │ Worker ×N │
//!                     │ process  │ │ process  │ │ processes │
//!                     └────┬─────┘ └────┬─────┘ └─────┬─────┘
//!                          ▼            ▼             ▼
//!                   GatewayTransport RestExecutor EventHandler
//!                     (protocol       (outbound     (dispatch
//!                      client lib)     HTTP lib)     logic)
//! ```
//!
//! Events flow gateway → supervisor → owning worker, resolved through the
//! shard ownership map; outbound actions flow worker → supervisor → gateway.
//! Correlated queries (shard info) are matched back to their requester by
//! nonce. Everything between roles is message passing; the supervisor's
//! registries are owned by one task and never locked.
//!
//! ## Lifecycle
//! - A crashed worker respawns automatically after a short backoff with the
//!   same shard assignment; crashed gateway/proxy processes are structural
//!   and wait for operator action.
//! - A rolling reload restarts workers one at a time, lowest-owned shard
//!   first, each awaited to readiness, without touching the connection.
//! - A full reload recomputes the plan and tears down and respawns every
//!   role, discarding buffered state.
//! - Shutdown stops all children with a bounded grace period, then kills
//!   whatever remains.
//!
//! ## Example
//! ```ignore
//! use std::sync::Arc;
//! use shardvisor::{
//!     GatewayConfig, ShardCount, Supervisor, SupervisorConfig, TraceWriter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = Supervisor::builder(
//!         SupervisorConfig::default(),
//!         GatewayConfig::new(std::env::var("BOT_TOKEN")?, 513, ShardCount::Fixed(8))
//!             .with_workers(4),
//!         Arc::new(MyTransport::new()),   // impl GatewayTransport
//!         Arc::new(MyDispatch::new()),    // impl EventHandler
//!         Arc::new(MyRest::new()),        // impl RestExecutor
//!     )
//!     .with_observer(Arc::new(TraceWriter))
//!     .build();
//!
//!     let handle = supervisor.handle();
//!     tokio::spawn(async move {
//!         // operator front-end drives the control API through `handle`
//!         let counts = handle.counts().await?;
//!         println!("{counts:?}");
//!         Ok::<_, shardvisor::ControlError>(())
//!     });
//!
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

mod bus;
mod config;
mod correlate;
mod error;
mod event;
mod gateway;
mod message;
mod observer;
mod plan;
mod process;
mod queue;
mod rest_proxy;
mod supervisor;
mod worker;

// ---- Public re-exports ----

pub use config::{
    GatewayConfig, ReshardingConfig, RestProxyConfig, ShardCount, SupervisorConfig,
};
pub use error::{
    ControlError, GatewayError, PlanError, ProxyError, RuntimeError, WorkerError,
};
pub use event::{Event, EventKind};
pub use gateway::{GatewaySession, GatewayTransport, ShardCountSource};
pub use message::{
    Counts, GatewayAction, GatewayMsg, ShardEvent, ShardInfoReply, SpawnBlob, WorkerInbox,
    WorkerMsg,
};
pub use observer::{Observe, TraceWriter};
pub use plan::{
    build_plan, ClusterPlan, ClusterSpec, ExplicitWorker, ShardId, ShardOwnership, ShardRange,
    ShardSelection, WorkerConfig, WorkerId, WorkerLayout,
};
pub use process::ChildRole;
pub use rest_proxy::{ProxiedRequest, ProxiedResponse, RestExecutor};
pub use supervisor::{ConventionSync, Supervisor, SupervisorBuilder, SupervisorHandle};
pub use worker::{EventHandler, WorkerContext};
