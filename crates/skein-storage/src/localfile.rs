//! Local-disk storage tier.
//!
//! Each partition range owns a directory with numbered data/index file
//! pairs. Flush events append to the active sequence; the sequence only
//! advances when a writer is re-opened after a fault, so offsets within a
//! sequence are contiguous.
//!
//! Disk usage is tracked per app so a purge can release exactly the
//! departing app's bytes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use skein_types::AppId;

use crate::{
    FlushEvent, INDEX_RECORD_SIZE, IndexRecord, PartitionDir, StorageError, data_filename,
    index_filename,
};

/// Local-disk block store with capacity accounting.
#[derive(Debug)]
pub struct LocalFileStore {
    base_path: PathBuf,
    capacity: u64,
    high_watermark: f64,
    used: AtomicU64,
    app_used: Mutex<HashMap<AppId, u64>>,
    /// Active write sequence per partition range. Absent means 0.
    sequences: Mutex<HashMap<PartitionDir, u32>>,
}

impl LocalFileStore {
    /// Creates a store rooted at `base_path` with a hard `capacity` in
    /// bytes and a `high_watermark` fraction in `(0, 1]` above which the
    /// storage manager steers flushes elsewhere.
    pub fn new(base_path: impl Into<PathBuf>, capacity: u64, high_watermark: f64) -> Self {
        assert!(
            high_watermark > 0.0 && high_watermark <= 1.0,
            "high watermark must be a fraction in (0, 1]"
        );
        Self {
            base_path: base_path.into(),
            capacity,
            high_watermark,
            used: AtomicU64::new(0),
            app_used: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Returns true if usage has crossed the high watermark.
    pub fn is_over_watermark(&self) -> bool {
        self.used_bytes() as f64 >= self.capacity as f64 * self.high_watermark
    }

    /// Returns true if `size` more bytes fit under the hard capacity.
    pub fn has_capacity_for(&self, size: u64) -> bool {
        self.used_bytes().saturating_add(size) <= self.capacity
    }

    fn active_sequence(&self, dir: &PartitionDir) -> u32 {
        self.sequences
            .lock()
            .expect("sequence table poisoned")
            .get(dir)
            .copied()
            .unwrap_or(0)
    }

    /// Advances the active sequence after a write fault so a fresh file
    /// pair is used on the next attempt.
    pub fn bump_sequence(&self, dir: &PartitionDir) {
        let mut sequences = self.sequences.lock().expect("sequence table poisoned");
        *sequences.entry(dir.clone()).or_insert(0) += 1;
    }

    /// Appends a flush event's blocks to the range's active file pair.
    ///
    /// The data file gets the payloads in block order; the index file gets
    /// one record per block, in lockstep. Both files are fsynced so a
    /// commit observed after this write is durable.
    pub fn write(&self, event: &FlushEvent) -> Result<(), StorageError> {
        if !self.has_capacity_for(event.size) {
            return Err(StorageError::CapacityExceeded {
                needed: event.size,
                available: self.capacity.saturating_sub(self.used_bytes()),
            });
        }

        let dir = event.partition_dir();
        let sequence = self.active_sequence(&dir);
        let dir_path = self.base_path.join(dir.rel_path());
        fs::create_dir_all(&dir_path)?;

        let mut data_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir_path.join(data_filename(sequence)))?;
        let mut index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir_path.join(index_filename(sequence)))?;

        let mut offset = data_file.metadata()?.len();
        let mut data_buf = BytesMut::with_capacity(event.size as usize);
        let mut index_buf = BytesMut::with_capacity(event.blocks.len() * INDEX_RECORD_SIZE);

        for block in &event.blocks {
            IndexRecord::for_block(block, offset).write_to(&mut index_buf);
            data_buf.extend_from_slice(&block.data);
            offset += u64::from(block.length);
        }

        data_file.write_all(&data_buf)?;
        data_file.sync_all()?;
        index_file.write_all(&index_buf)?;
        index_file.sync_all()?;

        self.used.fetch_add(event.size, Ordering::Relaxed);
        *self
            .app_used
            .lock()
            .expect("app usage table poisoned")
            .entry(event.app_id.clone())
            .or_insert(0) += event.size;

        tracing::debug!(
            app_id = %event.app_id,
            shuffle_id = %event.shuffle_id,
            range = %event.range,
            event_id = event.event_id,
            bytes = event.size,
            "flushed event to local disk"
        );
        Ok(())
    }

    /// Sequence numbers present in a range directory, ascending.
    fn sorted_sequences(dir_path: &Path) -> std::io::Result<Vec<u32>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(dir_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".data") {
                if let Ok(seq) = stem.parse::<u32>() {
                    sequences.push(seq);
                }
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Returns the range's full index plus its total data length.
    ///
    /// Offsets are rebased onto the virtual concatenation of the range's
    /// data files, so readers can treat the range as one stream.
    pub fn read_index(&self, dir: &PartitionDir) -> Result<(Bytes, u64), StorageError> {
        let dir_path = self.base_path.join(dir.rel_path());
        if !dir_path.exists() {
            return Err(StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            });
        }

        let mut index_buf = BytesMut::new();
        let mut data_len: u64 = 0;

        for sequence in Self::sorted_sequences(&dir_path)? {
            let index_bytes = fs::read(dir_path.join(index_filename(sequence)))?;
            for mut record in IndexRecord::parse_all(&index_bytes)? {
                record.offset += data_len;
                record.write_to(&mut index_buf);
            }
            data_len += fs::metadata(dir_path.join(data_filename(sequence)))?.len();
        }

        Ok((index_buf.freeze(), data_len))
    }

    /// Reads `[offset, offset + length)` of the range's virtual data
    /// stream. A read past the end returns the available prefix.
    pub fn read_data(
        &self,
        dir: &PartitionDir,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let dir_path = self.base_path.join(dir.rel_path());
        if !dir_path.exists() {
            return Err(StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            });
        }

        let mut out = BytesMut::with_capacity(length.min(64 * 1024 * 1024) as usize);
        let mut skip = offset;
        let mut remaining = length;

        for sequence in Self::sorted_sequences(&dir_path)? {
            if remaining == 0 {
                break;
            }
            let path = dir_path.join(data_filename(sequence));
            let file_len = fs::metadata(&path)?.len();
            if skip >= file_len {
                skip -= file_len;
                continue;
            }
            let take = remaining.min(file_len - skip);
            let mut file = fs::File::open(&path)?;
            file.seek(SeekFrom::Start(skip))?;
            let mut chunk = vec![0u8; take as usize];
            file.read_exact(&mut chunk)?;
            out.extend_from_slice(&chunk);
            remaining -= take;
            skip = 0;
        }

        Ok(out.freeze())
    }

    /// Removes all on-disk state for an app and returns the bytes freed.
    pub fn remove_app(&self, app_id: &AppId) -> Result<u64, StorageError> {
        let app_path = self.base_path.join(app_id.as_str());
        if app_path.exists() {
            fs::remove_dir_all(&app_path)?;
        }

        let freed = self
            .app_used
            .lock()
            .expect("app usage table poisoned")
            .remove(app_id)
            .unwrap_or(0);
        self.used.fetch_sub(freed, Ordering::Relaxed);

        self.sequences
            .lock()
            .expect("sequence table poisoned")
            .retain(|dir, _| dir.app_id != *app_id);

        tracing::info!(app_id = %app_id, freed_bytes = freed, "purged app from local disk");
        Ok(freed)
    }
}
