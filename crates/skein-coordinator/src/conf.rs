//! Dynamic client configuration and remote-storage selection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_types::{AppId, RemoteStorageInfo};

#[derive(Debug, Default)]
struct ConfCache {
    entries: BTreeMap<String, String>,
    loaded_at: Option<Instant>,
}

/// Serves coordinator-curated config knobs to clients.
///
/// The backing file holds one `key value` pair per line (`#` comments
/// and blank lines skipped) and is re-read once per refresh interval.
/// Clients overlay these onto their own config only where they have not
/// set an explicit value.
pub struct ClientConfManager {
    path: Option<PathBuf>,
    refresh_interval: Duration,
    cache: RwLock<ConfCache>,
}

impl ClientConfManager {
    pub fn new(path: Option<PathBuf>, refresh_interval: Duration) -> Self {
        Self {
            path,
            refresh_interval,
            cache: RwLock::new(ConfCache::default()),
        }
    }

    /// Returns the current dynamic config map.
    pub fn fetch(&self) -> BTreeMap<String, String> {
        self.refresh_if_stale();
        self.cache
            .read()
            .expect("client conf cache poisoned")
            .entries
            .clone()
    }

    fn refresh_if_stale(&self) {
        let Some(path) = &self.path else { return };
        let stale = {
            let cache = self.cache.read().expect("client conf cache poisoned");
            match cache.loaded_at {
                None => true,
                Some(at) => at.elapsed() >= self.refresh_interval,
            }
        };
        if !stale {
            return;
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let mut entries = BTreeMap::new();
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once(char::is_whitespace) {
                        entries.insert(key.to_string(), value.trim().to_string());
                    }
                }
                let mut cache = self.cache.write().expect("client conf cache poisoned");
                cache.entries = entries;
                cache.loaded_at = Some(Instant::now());
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to refresh client conf file");
                let mut cache = self.cache.write().expect("client conf cache poisoned");
                cache.loaded_at = Some(Instant::now());
            }
        }
    }
}

/// Chooses a remote-storage root per app, round-robin across the
/// configured paths so apps spread over the available filesystems.
/// The choice is sticky: repeated fetches for one app return the same
/// root until the app is released.
pub struct RemoteStorageSelector {
    paths: Vec<String>,
    conf: BTreeMap<String, String>,
    next: AtomicUsize,
    assigned: DashMap<AppId, RemoteStorageInfo>,
}

impl RemoteStorageSelector {
    pub fn new(paths: Vec<String>, conf: BTreeMap<String, String>) -> Self {
        Self {
            paths,
            conf,
            next: AtomicUsize::new(0),
            assigned: DashMap::new(),
        }
    }

    /// Returns the app's remote storage, assigning one on first call.
    /// Empty when no remote storage is configured.
    pub fn select(&self, app_id: &AppId) -> RemoteStorageInfo {
        if self.paths.is_empty() {
            return RemoteStorageInfo::default();
        }
        self.assigned
            .entry(app_id.clone())
            .or_insert_with(|| {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.paths.len();
                let mut info = RemoteStorageInfo::new(self.paths[idx].clone());
                info.conf = self.conf.clone();
                tracing::info!(app_id = %app_id, path = %info.path, "assigned remote storage");
                info
            })
            .clone()
    }

    /// Forgets an app's assignment (on app expiry).
    pub fn release(&self, app_id: &AppId) {
        self.assigned.remove(app_id);
    }
}
