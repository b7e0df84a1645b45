//! Application lifecycle on the coordinator.
//!
//! Apps register implicitly on first contact and stay alive through
//! heartbeats. An app silent past its TTL is evicted; the heartbeat gap
//! is the canonical "relation broken" signal, so no side owns the other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_types::AppId;

use crate::conf::RemoteStorageSelector;

/// Tracks live applications by last-heartbeat time.
#[derive(Debug)]
pub struct AppManager {
    apps: DashMap<AppId, Instant>,
    ttl: Duration,
}

impl AppManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            apps: DashMap::new(),
            ttl,
        }
    }

    /// Records a heartbeat. Returns true if the app is new.
    pub fn heartbeat(&self, app_id: &AppId) -> bool {
        let is_new = self.apps.insert(app_id.clone(), Instant::now()).is_none();
        if is_new {
            tracing::info!(app_id = %app_id, "registered application");
        }
        is_new
    }

    /// Number of live applications.
    pub fn count(&self) -> usize {
        self.apps.len()
    }

    /// Evicts apps past their TTL, returning the evicted IDs.
    pub fn evict_expired(&self) -> Vec<AppId> {
        let mut expired = Vec::new();
        self.apps.retain(|app_id, last| {
            if last.elapsed() >= self.ttl {
                expired.push(app_id.clone());
                false
            } else {
                true
            }
        });
        for app_id in &expired {
            tracing::warn!(app_id = %app_id, "evicting application after heartbeat timeout");
        }
        expired
    }

    /// Spawns the periodic eviction sweep, releasing evicted apps'
    /// remote-storage assignments.
    pub fn spawn_cleaner(
        self: &Arc<Self>,
        selector: Arc<RemoteStorageSelector>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let apps = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for app_id in apps.evict_expired() {
                    selector.release(&app_id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_registers_once() {
        let apps = AppManager::new(Duration::from_secs(60));
        assert!(apps.heartbeat(&AppId::from("a")));
        assert!(!apps.heartbeat(&AppId::from("a")));
        assert_eq!(apps.count(), 1);
    }

    #[test]
    fn expired_apps_are_evicted() {
        let apps = AppManager::new(Duration::from_millis(0));
        apps.heartbeat(&AppId::from("a"));
        let evicted = apps.evict_expired();
        assert_eq!(evicted, vec![AppId::from("a")]);
        assert_eq!(apps.count(), 0);
    }
}
