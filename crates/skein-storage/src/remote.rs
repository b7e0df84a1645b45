//! Remote (cold) storage tier.
//!
//! The distributed filesystem itself is an external collaborator behind
//! the [`RemoteFilesystem`] trait: anything that can create, append,
//! read-at, and delete can back the cold tier. [`MountedFs`] serves a
//! DFS exposed as a mounted path (and doubles as the test double).

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use skein_types::{AppId, RemoteStorageInfo};

use crate::{
    FlushEvent, INDEX_RECORD_SIZE, IndexRecord, PartitionDir, StorageError, data_filename,
    index_filename,
};

/// Filesystem operations the cold tier needs.
///
/// Implementations must be safe for concurrent use; the flush pipeline
/// guarantees a single writer per partition range, but reads and writes
/// to different ranges overlap freely.
pub trait RemoteFilesystem: Send + Sync + 'static {
    fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Appends `data` to the file, creating it if absent.
    fn append(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;

    /// Reads `[offset, offset + length)`, truncated at end of file.
    fn read_at(&self, path: &Path, offset: u64, length: u64) -> std::io::Result<Bytes>;

    /// Reads an entire file.
    fn read(&self, path: &Path) -> std::io::Result<Bytes>;

    fn len(&self, path: &Path) -> std::io::Result<u64>;

    fn exists(&self, path: &Path) -> bool;

    fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;
}

/// A distributed filesystem exposed as a locally mounted path.
#[derive(Debug, Default)]
pub struct MountedFs;

impl RemoteFilesystem for MountedFs {
    fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        fs::create_dir_all(path)
    }

    fn append(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn read_at(&self, path: &Path, offset: u64, length: u64) -> std::io::Result<Bytes> {
        let mut file = fs::File::open(path)?;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(Bytes::new());
        }
        let take = length.min(file_len - offset);
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; take as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read(&self, path: &Path) -> std::io::Result<Bytes> {
        Ok(Bytes::from(fs::read(path)?))
    }

    fn len(&self, path: &Path) -> std::io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// Cold-tier store writing the same relative layout as the local tier
/// under each app's assigned remote root.
pub struct HdfsStore {
    fs: Arc<dyn RemoteFilesystem>,
    /// Remote root per registered app, from `registerShuffle`.
    app_roots: DashMap<AppId, PathBuf>,
}

impl HdfsStore {
    pub fn new(fs: Arc<dyn RemoteFilesystem>) -> Self {
        Self {
            fs,
            app_roots: DashMap::new(),
        }
    }

    /// Binds an app to its remote storage root. Idempotent; the first
    /// registration wins (the coordinator's choice is sticky per app).
    pub fn register_app(&self, app_id: AppId, info: &RemoteStorageInfo) {
        if info.is_empty() {
            return;
        }
        self.app_roots
            .entry(app_id)
            .or_insert_with(|| PathBuf::from(&info.path));
    }

    /// Returns true if the app has a usable remote root.
    pub fn is_registered(&self, app_id: &AppId) -> bool {
        self.app_roots.contains_key(app_id)
    }

    fn dir_path(&self, dir: &PartitionDir) -> Result<PathBuf, StorageError> {
        let root = self
            .app_roots
            .get(&dir.app_id)
            .ok_or_else(|| StorageError::NoRemoteStorage(dir.app_id.clone()))?;
        Ok(root.join(dir.rel_path()))
    }

    /// Appends a flush event's blocks to the range's remote file pair.
    pub fn write(&self, event: &FlushEvent) -> Result<(), StorageError> {
        let dir = event.partition_dir();
        let dir_path = self.dir_path(&dir)?;
        self.fs.create_dir_all(&dir_path)?;

        let data_path = dir_path.join(data_filename(0));
        let index_path = dir_path.join(index_filename(0));

        let mut offset = if self.fs.exists(&data_path) {
            self.fs.len(&data_path)?
        } else {
            0
        };

        let mut data_buf = BytesMut::with_capacity(event.size as usize);
        let mut index_buf = BytesMut::with_capacity(event.blocks.len() * INDEX_RECORD_SIZE);
        for block in &event.blocks {
            IndexRecord::for_block(block, offset).write_to(&mut index_buf);
            data_buf.extend_from_slice(&block.data);
            offset += u64::from(block.length);
        }

        self.fs.append(&data_path, &data_buf)?;
        self.fs.append(&index_path, &index_buf)?;

        tracing::debug!(
            app_id = %event.app_id,
            shuffle_id = %event.shuffle_id,
            range = %event.range,
            event_id = event.event_id,
            bytes = event.size,
            "flushed event to remote storage"
        );
        Ok(())
    }

    /// Returns the range's index plus total data length.
    pub fn read_index(&self, dir: &PartitionDir) -> Result<(Bytes, u64), StorageError> {
        let dir_path = self.dir_path(dir)?;
        let index_path = dir_path.join(index_filename(0));
        if !self.fs.exists(&index_path) {
            return Err(StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            });
        }
        let index = self.fs.read(&index_path)?;
        let data_len = self.fs.len(&dir_path.join(data_filename(0)))?;
        Ok((index, data_len))
    }

    /// Reads `[offset, offset + length)` of the range's data file.
    pub fn read_data(
        &self,
        dir: &PartitionDir,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let dir_path = self.dir_path(dir)?;
        let data_path = dir_path.join(data_filename(0));
        if !self.fs.exists(&data_path) {
            return Err(StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            });
        }
        Ok(self.fs.read_at(&data_path, offset, length)?)
    }

    /// Removes the app's remote tree and forgets its root.
    pub fn remove_app(&self, app_id: &AppId) -> Result<(), StorageError> {
        if let Some((_, root)) = self.app_roots.remove(app_id) {
            self.fs.remove_dir_all(&root.join(app_id.as_str()))?;
            tracing::info!(app_id = %app_id, "purged app from remote storage");
        }
        Ok(())
    }
}

impl std::fmt::Debug for HdfsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdfsStore")
            .field("registered_apps", &self.app_roots.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::{BlockId, PartitionId, PartitionRange, ShuffleBlock, ShuffleId};

    #[test]
    fn remote_write_requires_registration() {
        let store = HdfsStore::new(Arc::new(MountedFs));
        let event = FlushEvent::new(
            1,
            AppId::from("app-r"),
            ShuffleId::new(0),
            PartitionRange::new(0, 1),
            vec![],
        );
        assert!(matches!(
            store.write(&event),
            Err(StorageError::NoRemoteStorage(_))
        ));
    }

    #[test]
    fn remote_round_trip_under_mounted_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = HdfsStore::new(Arc::new(MountedFs));
        let app = AppId::from("app-r");
        store.register_app(
            app.clone(),
            &RemoteStorageInfo::new(tmp.path().to_string_lossy().to_string()),
        );

        let event = FlushEvent::new(
            1,
            app.clone(),
            ShuffleId::new(3),
            PartitionRange::new(0, 1),
            vec![ShuffleBlock::new(
                BlockId::new(0, PartitionId::new(0), 0),
                6,
                Bytes::from_static(b"remote"),
            )],
        );
        store.write(&event).unwrap();

        let dir = event.partition_dir();
        let (index, data_len) = store.read_index(&dir).unwrap();
        assert_eq!(data_len, 6);
        let records = IndexRecord::parse_all(&index).unwrap();
        assert_eq!(records.len(), 1);

        let data = store.read_data(&dir, 0, 6).unwrap();
        assert_eq!(&data[..], b"remote");

        store.remove_app(&app).unwrap();
        assert!(!tmp.path().join("app-r").exists());
    }
}
