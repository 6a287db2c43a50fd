//! # Runtime configuration.
//!
//! [`SupervisorConfig`] controls the supervisor's own behavior: shutdown
//! grace period, worker respawn delay, channel capacities, correlation
//! lifetime, and the pending-queue bound.
//!
//! [`GatewayConfig`] describes the connection side: credentials, intents,
//! the shard window this deployment covers, and resharding policy.
//!
//! [`RestProxyConfig`] describes the local request proxy: loopback bind
//! address and the per-run authorization secret. The secret is generated
//! once per supervisor start and handed to children inside their spawn
//! blobs; it never crosses the network.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for the supervisor runtime.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Maximum time to wait for a child's voluntary exit before killing it.
    pub grace: Duration,
    /// Delay before respawning a crashed worker.
    pub respawn_delay: Duration,
    /// Capacity of the broadcast event bus.
    pub bus_capacity: usize,
    /// Capacity of each child mailbox and uplink channel.
    pub mailbox_capacity: usize,
    /// Lifetime of an unanswered correlated request before eviction.
    pub correlation_ttl: Duration,
    /// Maximum buffered events per worker while that worker is not ready.
    pub pending_limit: usize,
}

impl Default for SupervisorConfig {
    /// Provides a default configuration:
    /// - `grace = 5s`
    /// - `respawn_delay = 250ms`
    /// - `bus_capacity = 1024`
    /// - `mailbox_capacity = 256`
    /// - `correlation_ttl = 10s`
    /// - `pending_limit = 1024`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            respawn_delay: Duration::from_millis(250),
            bus_capacity: 1024,
            mailbox_capacity: 256,
            correlation_ttl: Duration::from_secs(10),
            pending_limit: 1024,
        }
    }
}

/// Total shard count: fixed, or resolved once at startup by asking the
/// remote endpoint for its recommendation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardCount {
    Fixed(u32),
    Auto,
}

/// Connection-side configuration.
///
/// `first_shard_id`/`last_shard_id` narrow the shard window covered by a
/// deployment without explicit clusters; left unset they track the full
/// `0..total` span. `shards_per_worker`/`total_worker_processes` size the
/// default worker layout the same way; explicit clusters supersede all four.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer token for the remote endpoint. Opaque to the supervisor.
    pub token: String,
    /// Event intent bitfield, forwarded to the transport untouched.
    pub intents: u64,
    /// Total shard count across every cluster of the deployment.
    pub total_shards: ShardCount,
    /// First shard id this deployment covers; defaults to 0.
    pub first_shard_id: Option<u32>,
    /// Last shard id this deployment covers; defaults to the last shard.
    pub last_shard_id: Option<u32>,
    /// Target shards per worker for the default layout.
    pub shards_per_worker: Option<u32>,
    /// Worker process count for the default layout; wins over
    /// `shards_per_worker` when both are set.
    pub total_worker_processes: Option<u32>,
    /// Resharding watchdog policy.
    pub resharding: ReshardingConfig,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>, intents: u64, total_shards: ShardCount) -> Self {
        Self {
            token: token.into(),
            intents,
            total_shards,
            first_shard_id: None,
            last_shard_id: None,
            shards_per_worker: None,
            total_worker_processes: None,
            resharding: ReshardingConfig::default(),
        }
    }

    pub fn with_workers(mut self, total_worker_processes: u32) -> Self {
        self.total_worker_processes = Some(total_worker_processes);
        self
    }

    pub fn with_shards_per_worker(mut self, shards_per_worker: u32) -> Self {
        self.shards_per_worker = Some(shards_per_worker);
        self
    }
}

// The token never reaches logs, not even through Debug formatting.
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("total_shards", &self.total_shards)
            .field("first_shard_id", &self.first_shard_id)
            .field("last_shard_id", &self.last_shard_id)
            .field("shards_per_worker", &self.shards_per_worker)
            .field("total_worker_processes", &self.total_worker_processes)
            .field("resharding", &self.resharding)
            .finish()
    }
}

/// Periodic check of the recommended shard count against the active one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReshardingConfig {
    pub enabled: bool,
    /// Full reload triggers once `recommended / active * 100` reaches this.
    pub full_percentage_threshold: f64,
    /// Check interval in milliseconds.
    pub check_interval_ms: u64,
}

impl ReshardingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for ReshardingConfig {
    /// Disabled; when enabled, checks every 8 hours and reshards at 120%.
    fn default() -> Self {
        Self {
            enabled: false,
            full_percentage_threshold: 120.0,
            check_interval_ms: 8 * 60 * 60 * 1000,
        }
    }
}

/// Local request-proxy configuration.
#[derive(Clone)]
pub struct RestProxyConfig {
    /// Bind host; loopback unless deliberately overridden.
    pub host: String,
    /// Bind port; 0 picks an ephemeral port.
    pub port: u16,
    /// Per-run shared secret compared exactly against incoming credentials.
    pub authorization_secret: String,
}

impl RestProxyConfig {
    /// Fresh config with a newly generated secret on an ephemeral loopback port.
    pub fn generate() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            authorization_secret: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Debug for RestProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("authorization_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_defaults() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.grace, Duration::from_secs(5));
        assert_eq!(cfg.respawn_delay, Duration::from_millis(250));
        assert_eq!(cfg.pending_limit, 1024);
    }

    #[test]
    fn proxy_secret_is_unique_per_run() {
        let a = RestProxyConfig::generate();
        let b = RestProxyConfig::generate();
        assert_ne!(a.authorization_secret, b.authorization_secret);
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.port, 0);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let gateway = GatewayConfig::new("top-secret-token", 0, ShardCount::Fixed(4));
        let rendered = format!("{gateway:?}");
        assert!(!rendered.contains("top-secret-token"));
        assert!(rendered.contains("<redacted>"));

        let proxy = RestProxyConfig::generate();
        let rendered = format!("{proxy:?}");
        assert!(!rendered.contains(&proxy.authorization_secret));
    }

    #[test]
    fn gateway_defaults_cover_the_full_window() {
        let cfg = GatewayConfig::new("t", 513, ShardCount::Fixed(8));
        assert_eq!(cfg.first_shard_id, None);
        assert_eq!(cfg.last_shard_id, None);
        assert!(!cfg.resharding.enabled);

        let sized = cfg.with_workers(4).with_shards_per_worker(2);
        assert_eq!(sized.total_worker_processes, Some(4));
        assert_eq!(sized.shards_per_worker, Some(2));
    }
}
