//! Storage-tier selection.
//!
//! Backends are a closed set of tagged variants with a fixed capability
//! surface (select, write, read, purge); adding a tier means extending
//! [`StorageTarget`], not subclassing.

use std::sync::Arc;

use bytes::Bytes;
use skein_types::{AppId, RemoteStorageInfo, StorageType};

use crate::{
    FlushEvent, HdfsStore, LocalFileStore, MemoryStore, PartitionDir, StorageError,
};

/// The tier chosen for one flush event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    Local,
    Remote,
}

/// Routing knobs for tier selection.
#[derive(Debug, Clone, Copy)]
pub struct StoragePolicy {
    pub storage_type: StorageType,
    /// Events strictly larger than this go to cold storage when available.
    pub flush_cold_storage_threshold_size: u64,
}

/// Routes flush events between tiers and fans reads back across them.
///
/// Selection is deterministic and monotone in event size: under a fixed
/// configuration and disk pressure, a larger event never routes to a
/// colder-averse tier than a smaller one.
#[derive(Debug)]
pub struct MultiStorageManager {
    policy: StoragePolicy,
    memory: Option<MemoryStore>,
    local: Option<Arc<LocalFileStore>>,
    remote: Option<Arc<HdfsStore>>,
}

impl MultiStorageManager {
    /// Builds a manager, validating that every tier the storage type
    /// names is actually configured.
    pub fn new(
        policy: StoragePolicy,
        local: Option<Arc<LocalFileStore>>,
        remote: Option<Arc<HdfsStore>>,
    ) -> Result<Self, StorageError> {
        let storage_type = policy.storage_type;
        if storage_type.with_localfile() && local.is_none() {
            return Err(StorageError::TierNotConfigured(storage_type));
        }
        if storage_type.with_remote() && remote.is_none() {
            return Err(StorageError::TierNotConfigured(storage_type));
        }
        let memory = matches!(storage_type, StorageType::Memory).then(MemoryStore::new);
        Ok(Self {
            policy,
            memory,
            local,
            remote,
        })
    }

    pub fn storage_type(&self) -> StorageType {
        self.policy.storage_type
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn local(&self) -> Option<&Arc<LocalFileStore>> {
        self.local.as_ref()
    }

    /// Binds an app's remote storage root, if a remote tier exists.
    pub fn register_remote_app(&self, app_id: AppId, info: &RemoteStorageInfo) {
        if let Some(remote) = &self.remote {
            remote.register_app(app_id, info);
        }
    }

    /// Picks the target tier for a flush event.
    pub fn select(&self, event: &FlushEvent) -> StorageTarget {
        match self.policy.storage_type {
            StorageType::Memory => StorageTarget::Memory,
            StorageType::MemoryHdfs => StorageTarget::Remote,
            StorageType::MemoryLocalfile => StorageTarget::Local,
            StorageType::MemoryLocalfileHdfs => {
                if event.size > self.policy.flush_cold_storage_threshold_size {
                    return StorageTarget::Remote;
                }
                let local = self.local.as_ref().expect("validated at construction");
                if local.is_over_watermark() {
                    // Disk pressure: steer even small events to cold storage.
                    StorageTarget::Remote
                } else {
                    StorageTarget::Local
                }
            }
        }
    }

    /// Writes an event to the given tier.
    pub fn write(&self, target: StorageTarget, event: &FlushEvent) -> Result<(), StorageError> {
        match target {
            StorageTarget::Memory => self
                .memory
                .as_ref()
                .ok_or(StorageError::TierNotConfigured(self.policy.storage_type))?
                .write(event),
            StorageTarget::Local => self
                .local
                .as_ref()
                .ok_or(StorageError::TierNotConfigured(self.policy.storage_type))?
                .write(event),
            StorageTarget::Remote => self
                .remote
                .as_ref()
                .ok_or(StorageError::TierNotConfigured(self.policy.storage_type))?
                .write(event),
        }
    }

    /// Reads a range's index from whichever tier holds it
    /// (memory → local → remote).
    pub fn read_index(&self, dir: &PartitionDir) -> Result<(Bytes, u64), StorageError> {
        let mut last_err = None;
        if let Some(memory) = &self.memory {
            match memory.read_index(dir) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(local) = &self.local {
            match local.read_index(dir) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(remote) = &self.remote {
            match remote.read_index(dir) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StorageError::DataNotFound {
            app_id: dir.app_id.clone(),
            shuffle_id: dir.shuffle_id,
            range: dir.range.to_string(),
        }))
    }

    /// Reads range data from whichever tier holds it.
    pub fn read_data(
        &self,
        dir: &PartitionDir,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let mut last_err = None;
        if let Some(memory) = &self.memory {
            match memory.read_data(dir, offset, length) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(local) = &self.local {
            match local.read_data(dir, offset, length) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(remote) = &self.remote {
            match remote.read_data(dir, offset, length) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StorageError::DataNotFound {
            app_id: dir.app_id.clone(),
            shuffle_id: dir.shuffle_id,
            range: dir.range.to_string(),
        }))
    }

    /// Purges an app from every tier.
    pub fn remove_app(&self, app_id: &AppId) -> Result<(), StorageError> {
        if let Some(memory) = &self.memory {
            memory.remove_app(app_id);
        }
        if let Some(local) = &self.local {
            local.remove_app(app_id)?;
        }
        if let Some(remote) = &self.remote {
            remote.remove_app(app_id)?;
        }
        Ok(())
    }
}
