//! Shuffle-server configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use skein_types::StorageType;

/// Buffer-pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Hard cap on buffered bytes; beyond it writes get `NO_BUFFER`.
    pub capacity: u64,
    /// Per-partition size that triggers a flush event.
    pub flush_threshold: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 2 * 1024 * 1024 * 1024,
            flush_threshold: 64 * 1024 * 1024,
        }
    }
}

/// Storage-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Tier combination this server runs with.
    pub kind: StorageType,
    /// Local-disk root for the warm tier.
    pub base_path: PathBuf,
    /// Local-disk hard capacity in bytes.
    pub disk_capacity: u64,
    /// Fraction of disk capacity above which flushes avoid local disk.
    pub high_watermark: f64,
    /// Events larger than this go to cold storage when available.
    pub flush_cold_storage_threshold_size: u64,
    /// Bounded flush-queue length per backend.
    pub flush_queue_capacity: usize,
    /// Write retries before a flush marks its range FAULTED.
    pub flush_retry_max: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageType::MemoryLocalfile,
            base_path: PathBuf::from("/data/skein"),
            disk_capacity: 1024 * 1024 * 1024 * 1024,
            high_watermark: 0.9,
            flush_cold_storage_threshold_size: 64 * 1024 * 1024,
            flush_queue_capacity: 4096,
            flush_retry_max: 3,
        }
    }
}

/// Heartbeat and GC timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often load stats go to the coordinators.
    pub interval_secs: u64,
    /// Apps silent this long are tombstoned and purged.
    pub app_ttl_secs: u64,
    /// GC sweep cadence.
    pub cleanup_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            app_ttl_secs: 60,
            cleanup_interval_secs: 5,
        }
    }
}

/// Top-level shuffle-server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// RPC bind address.
    pub bind: String,
    /// Host advertised to the coordinator; defaults to the bind host.
    pub advertised_host: Option<String>,
    /// Capability tags advertised with every heartbeat.
    pub tags: BTreeSet<String>,
    /// Coordinator addresses to report to.
    pub coordinators: Vec<String>,
    /// Deadline for the commit drain barrier.
    pub commit_timeout_secs: u64,
    pub heartbeat: HeartbeatConfig,
    pub buffer: BufferConfig,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:19999".to_string(),
            advertised_host: None,
            tags: BTreeSet::new(),
            coordinators: Vec::new(),
            commit_timeout_secs: 600,
            heartbeat: HeartbeatConfig::default(),
            buffer: BufferConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration: defaults, then the TOML file (if given),
    /// then `SKEIN_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("bind", defaults.bind)?
            .set_default("advertised_host", defaults.advertised_host)?
            .set_default(
                "tags",
                defaults.tags.into_iter().collect::<Vec<String>>(),
            )?
            .set_default("coordinators", defaults.coordinators)?
            .set_default("commit_timeout_secs", defaults.commit_timeout_secs)?
            .set_default("heartbeat.interval_secs", defaults.heartbeat.interval_secs)?
            .set_default("heartbeat.app_ttl_secs", defaults.heartbeat.app_ttl_secs)?
            .set_default(
                "heartbeat.cleanup_interval_secs",
                defaults.heartbeat.cleanup_interval_secs,
            )?
            .set_default("buffer.capacity", defaults.buffer.capacity)?
            .set_default("buffer.flush_threshold", defaults.buffer.flush_threshold)?
            .set_default(
                "storage.kind",
                match defaults.storage.kind {
                    skein_types::StorageType::Memory => "memory",
                    skein_types::StorageType::MemoryLocalfile => "memory_localfile",
                    skein_types::StorageType::MemoryLocalfileHdfs => "memory_localfile_hdfs",
                    skein_types::StorageType::MemoryHdfs => "memory_hdfs",
                },
            )?
            .set_default(
                "storage.base_path",
                defaults.storage.base_path.to_string_lossy().into_owned(),
            )?
            .set_default("storage.disk_capacity", defaults.storage.disk_capacity)?
            .set_default("storage.high_watermark", defaults.storage.high_watermark)?
            .set_default(
                "storage.flush_cold_storage_threshold_size",
                defaults.storage.flush_cold_storage_threshold_size,
            )?
            .set_default(
                "storage.flush_queue_capacity",
                defaults.storage.flush_queue_capacity as i64,
            )?
            .set_default("storage.flush_retry_max", defaults.storage.flush_retry_max)?;

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

        let config: Self = builder
            .build()
            .context("failed to build server configuration")?
            .try_deserialize()
            .context("failed to deserialize server configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.storage.high_watermark > 0.0 && self.storage.high_watermark <= 1.0,
            "storage.high_watermark must be in (0, 1]"
        );
        anyhow::ensure!(
            self.buffer.flush_threshold > 0,
            "buffer.flush_threshold must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.storage.kind, StorageType::MemoryLocalfile);
        assert_eq!(config.heartbeat.interval_secs, 5);
    }

    #[test]
    fn storage_kind_parses_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
bind = "127.0.0.1:29999"
coordinators = ["127.0.0.1:21000"]

[storage]
kind = "memory_localfile_hdfs"
base_path = "/tmp/skein-test"
disk_capacity = 1073741824
flush_cold_storage_threshold_size = 2000
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.storage.kind, StorageType::MemoryLocalfileHdfs);
        assert_eq!(config.storage.flush_cold_storage_threshold_size, 2000);
        assert_eq!(config.coordinators.len(), 1);
    }

    #[test]
    fn bad_watermark_is_rejected() {
        let config = ServerConfig {
            storage: StorageConfig {
                high_watermark: 1.5,
                ..StorageConfig::default()
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
