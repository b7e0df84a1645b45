//! Live shuffle-server registry.
//!
//! Servers announce themselves with periodic heartbeats carrying load
//! statistics; a server silent for longer than the configured timeout is
//! evicted by the cleaner sweep. The registry is the coordinator's only
//! source of placement candidates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_types::{ServerId, ShuffleServerInfo};
use skein_wire::ServerLoadStats;

/// One registered server with its latest load report.
#[derive(Debug, Clone)]
pub struct ServerNode {
    pub info: ShuffleServerInfo,
    pub stats: ServerLoadStats,
    last_heartbeat: Instant,
}

impl ServerNode {
    /// Load key used to order assignment candidates: prefer servers with
    /// fewer apps, then less used memory.
    pub fn load_key(&self) -> (u64, u64) {
        (self.stats.app_count, self.stats.used_memory)
    }
}

/// Registry of live shuffle servers.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: DashMap<ServerId, ServerNode>,
    heartbeat_timeout: Duration,
}

impl ServerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            servers: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Records a heartbeat, registering the server on first contact.
    pub fn heartbeat(&self, info: ShuffleServerInfo, stats: ServerLoadStats) {
        let id = info.id.clone();
        let is_new = !self.servers.contains_key(&id);
        self.servers.insert(
            id.clone(),
            ServerNode {
                info,
                stats,
                last_heartbeat: Instant::now(),
            },
        );
        if is_new {
            tracing::info!(server_id = %id, "registered shuffle server");
            metrics_update(self.live_count());
        }
    }

    /// Number of servers heard from within the timeout.
    pub fn live_count(&self) -> usize {
        self.servers
            .iter()
            .filter(|e| e.last_heartbeat.elapsed() < self.heartbeat_timeout)
            .count()
    }

    /// Live servers whose tag sets cover `required_tags`, with their load.
    pub fn candidates(&self, required_tags: &BTreeSet<String>) -> Vec<ServerNode> {
        self.servers
            .iter()
            .filter(|e| e.last_heartbeat.elapsed() < self.heartbeat_timeout)
            .filter(|e| e.info.satisfies(required_tags))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Drops servers past the heartbeat timeout. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let before = self.servers.len();
        self.servers.retain(|id, node| {
            let alive = node.last_heartbeat.elapsed() < self.heartbeat_timeout;
            if !alive {
                tracing::warn!(server_id = %id, "evicting server after heartbeat timeout");
            }
            alive
        });
        let evicted = before - self.servers.len();
        if evicted > 0 {
            metrics_update(self.live_count());
        }
        evicted
    }

    /// Spawns the periodic eviction sweep.
    pub fn spawn_cleaner(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.evict_expired();
            }
        })
    }
}

fn metrics_update(live: usize) {
    crate::metrics::LIVE_SERVERS.set(live as i64);
}
