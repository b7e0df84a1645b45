//! Admission control.
//!
//! `accessCluster` runs through an ordered pipeline of checkers; the
//! first denial short-circuits with `ACCESS_DENIED` and a message naming
//! the deciding checker. Checkers are a closed set of tagged variants
//! with one capability: `check`.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::CoordinatorError;
use crate::config::AccessConfig;
use crate::registry::ServerRegistry;

/// What an application presents when asking to use the cluster.
#[derive(Debug, Clone)]
pub struct AccessInfo {
    pub access_id: String,
    pub tags: BTreeSet<String>,
}

/// Outcome of running the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied {
        /// `Denied by <CheckerName>: <reason>`.
        message: String,
    },
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// One admission checker.
#[derive(Debug)]
pub enum AccessChecker {
    Candidates(CandidatesChecker),
    ClusterLoad(ClusterLoadChecker),
}

impl AccessChecker {
    fn name(&self) -> &'static str {
        match self {
            Self::Candidates(_) => "AccessCandidatesChecker",
            Self::ClusterLoad(_) => "AccessClusterLoadChecker",
        }
    }

    fn check(&self, info: &AccessInfo) -> Result<(), String> {
        match self {
            Self::Candidates(c) => c.check(info),
            Self::ClusterLoad(c) => c.check(info),
        }
    }
}

/// The ordered pipeline.
#[derive(Debug)]
pub struct AccessManager {
    checkers: Vec<AccessChecker>,
}

impl AccessManager {
    /// Builds the pipeline from the configured checker identifiers, in
    /// order. Identifiers accept the short form (`candidates`,
    /// `cluster_load`) or the full checker name.
    pub fn from_config(
        config: &AccessConfig,
        registry: Arc<ServerRegistry>,
    ) -> Result<Self, CoordinatorError> {
        let mut checkers = Vec::with_capacity(config.checkers.len());
        for name in &config.checkers {
            match name.as_str() {
                "candidates" | "AccessCandidatesChecker" => {
                    let path = config.candidates_path.clone().ok_or(
                        CoordinatorError::CheckerNotConfigured {
                            checker: "AccessCandidatesChecker",
                            missing: "candidates_path",
                        },
                    )?;
                    checkers.push(AccessChecker::Candidates(CandidatesChecker::new(
                        path,
                        Duration::from_secs(config.refresh_interval_secs),
                    )));
                }
                "cluster_load" | "AccessClusterLoadChecker" => {
                    checkers.push(AccessChecker::ClusterLoad(ClusterLoadChecker::new(
                        Arc::clone(&registry),
                        config.load_server_num_threshold,
                    )));
                }
                other => return Err(CoordinatorError::UnknownChecker(other.to_string())),
            }
        }
        Ok(Self { checkers })
    }

    /// Runs the pipeline. The first denial wins.
    pub fn check(&self, info: &AccessInfo) -> AccessDecision {
        for checker in &self.checkers {
            if let Err(reason) = checker.check(info) {
                tracing::info!(
                    access_id = %info.access_id,
                    checker = checker.name(),
                    reason = %reason,
                    "access denied"
                );
                crate::metrics::ACCESS_DENIED_TOTAL.inc();
                return AccessDecision::Denied {
                    message: format!("Denied by {}: {}", checker.name(), reason),
                };
            }
        }
        AccessDecision::Granted
    }
}

#[derive(Debug, Default)]
struct CandidatesCache {
    ids: HashSet<String>,
    loaded_at: Option<Instant>,
}

/// Accepts an access ID iff it appears in an allow-list file.
///
/// The file holds one ID per line; lines are whitespace-trimmed and
/// empty lines skipped. The file is re-read once per refresh interval,
/// so operators can edit it without restarting the coordinator.
#[derive(Debug)]
pub struct CandidatesChecker {
    path: PathBuf,
    refresh_interval: Duration,
    cache: RwLock<CandidatesCache>,
}

impl CandidatesChecker {
    pub fn new(path: PathBuf, refresh_interval: Duration) -> Self {
        Self {
            path,
            refresh_interval,
            cache: RwLock::new(CandidatesCache::default()),
        }
    }

    fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.read().expect("candidates cache poisoned");
            match cache.loaded_at {
                None => true,
                Some(at) => at.elapsed() >= self.refresh_interval,
            }
        };
        if !stale {
            return;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let ids: HashSet<String> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                let mut cache = self.cache.write().expect("candidates cache poisoned");
                cache.ids = ids;
                cache.loaded_at = Some(Instant::now());
            }
            Err(e) => {
                // Keep the previous list; a transient read failure must
                // not flip admissions.
                tracing::warn!(path = %self.path.display(), error = %e, "failed to refresh candidates file");
                let mut cache = self.cache.write().expect("candidates cache poisoned");
                cache.loaded_at = Some(Instant::now());
            }
        }
    }

    fn check(&self, info: &AccessInfo) -> Result<(), String> {
        self.refresh_if_stale();
        let cache = self.cache.read().expect("candidates cache poisoned");
        if cache.ids.contains(info.access_id.trim()) {
            Ok(())
        } else {
            Err(format!("access id {} is not in candidates", info.access_id))
        }
    }
}

/// Accepts only while enough servers are alive to take the load.
#[derive(Debug)]
pub struct ClusterLoadChecker {
    registry: Arc<ServerRegistry>,
    server_num_threshold: usize,
}

impl ClusterLoadChecker {
    pub fn new(registry: Arc<ServerRegistry>, server_num_threshold: usize) -> Self {
        Self {
            registry,
            server_num_threshold,
        }
    }

    fn check(&self, _info: &AccessInfo) -> Result<(), String> {
        let live = self.registry.live_count();
        if live >= self.server_num_threshold {
            Ok(())
        } else {
            Err(format!(
                "expect {} live servers, actual {}",
                self.server_num_threshold, live
            ))
        }
    }
}
