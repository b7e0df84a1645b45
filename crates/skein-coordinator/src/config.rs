//! Coordinator configuration.
//!
//! Loaded once at startup from defaults, an optional TOML file, and
//! `SKEIN_*` environment overrides (in that precedence order); the
//! resulting struct is immutable for the process lifetime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Admission-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Ordered checker identifiers (`candidates`, `cluster_load`).
    pub checkers: Vec<String>,
    /// Allow-list file for the candidates checker.
    pub candidates_path: Option<PathBuf>,
    /// Minimum live servers for the cluster-load checker.
    pub load_server_num_threshold: usize,
    /// How often checker-backing files are re-read.
    pub refresh_interval_secs: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            checkers: Vec::new(),
            candidates_path: None,
            load_server_num_threshold: 1,
            refresh_interval_secs: 60,
        }
    }
}

/// Heartbeat and eviction timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Servers silent this long are evicted.
    pub server_timeout_secs: u64,
    /// Apps silent this long are evicted.
    pub app_ttl_secs: u64,
    /// Eviction sweep cadence.
    pub cleanup_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            server_timeout_secs: 30,
            app_ttl_secs: 60,
            cleanup_interval_secs: 5,
        }
    }
}

/// Remote-storage pool handed out to apps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    /// Candidate remote roots, assigned round-robin.
    pub paths: Vec<String>,
    /// Filesystem conf overrides shipped with every assignment.
    pub conf: BTreeMap<String, String>,
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// RPC bind address.
    pub bind: String,
    pub heartbeat: HeartbeatConfig,
    pub access: AccessConfig,
    /// Dynamic client-conf file served by `fetchClientConf`.
    pub client_conf_path: Option<PathBuf>,
    pub remote_storage: RemoteStorageConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:21000".to_string(),
            heartbeat: HeartbeatConfig::default(),
            access: AccessConfig::default(),
            client_conf_path: None,
            remote_storage: RemoteStorageConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Loads configuration: defaults, then the TOML file (if given),
    /// then `SKEIN_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("bind", defaults.bind)?
            .set_default(
                "heartbeat.server_timeout_secs",
                defaults.heartbeat.server_timeout_secs,
            )?
            .set_default("heartbeat.app_ttl_secs", defaults.heartbeat.app_ttl_secs)?
            .set_default(
                "heartbeat.cleanup_interval_secs",
                defaults.heartbeat.cleanup_interval_secs,
            )?
            .set_default("access.checkers", defaults.access.checkers)?
            .set_default(
                "access.candidates_path",
                defaults
                    .access
                    .candidates_path
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_default(
                "access.load_server_num_threshold",
                defaults.access.load_server_num_threshold as i64,
            )?
            .set_default(
                "access.refresh_interval_secs",
                defaults.access.refresh_interval_secs,
            )?
            .set_default(
                "client_conf_path",
                defaults
                    .client_conf_path
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_default("remote_storage.paths", defaults.remote_storage.paths)?
            .set_default(
                "remote_storage.conf",
                defaults
                    .remote_storage
                    .conf
                    .into_iter()
                    .collect::<std::collections::HashMap<String, String>>(),
            )?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SKEIN")
                .separator("_")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to build coordinator configuration")?
            .try_deserialize()
            .context("failed to deserialize coordinator configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_load_without_a_file() {
        let config = CoordinatorConfig::load(None).unwrap();
        assert_eq!(config.bind, "0.0.0.0:21000");
        assert_eq!(config.heartbeat.server_timeout_secs, 30);
        assert!(config.access.checkers.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
bind = "127.0.0.1:31000"

[access]
checkers = ["cluster_load"]
load_server_num_threshold = 2

[remote_storage]
paths = ["/dfs/a"]
"#
        )
        .unwrap();

        let config = CoordinatorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind, "127.0.0.1:31000");
        assert_eq!(config.access.checkers, vec!["cluster_load"]);
        assert_eq!(config.access.load_server_num_threshold, 2);
        assert_eq!(config.remote_storage.paths, vec!["/dfs/a"]);
        // Untouched sections keep their defaults.
        assert_eq!(config.heartbeat.app_ttl_secs, 60);
    }
}
