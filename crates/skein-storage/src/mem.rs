//! Memory-resident storage tier.
//!
//! Used when the server runs with `StorageType::Memory`: flush events
//! move blocks out of the write buffers into per-range memory segments
//! that mirror the on-disk data/index layout, so the read path is
//! identical across tiers.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use skein_types::AppId;

use crate::{FlushEvent, IndexRecord, PartitionDir, StorageError};

#[derive(Debug, Default)]
struct MemSegment {
    data: BytesMut,
    index: BytesMut,
}

/// In-memory mirror of a range's data/index file pair.
#[derive(Debug, Default)]
pub struct MemoryStore {
    segments: DashMap<PartitionDir, MemSegment>,
    used: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Appends a flush event's blocks to the range's memory segment.
    pub fn write(&self, event: &FlushEvent) -> Result<(), StorageError> {
        let mut segment = self.segments.entry(event.partition_dir()).or_default();
        let mut offset = segment.data.len() as u64;
        for block in &event.blocks {
            let mut index = BytesMut::new();
            IndexRecord::for_block(block, offset).write_to(&mut index);
            segment.index.extend_from_slice(&index);
            segment.data.extend_from_slice(&block.data);
            offset += u64::from(block.length);
        }
        self.used.fetch_add(event.size, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the range's index plus total data length.
    pub fn read_index(&self, dir: &PartitionDir) -> Result<(Bytes, u64), StorageError> {
        let segment = self
            .segments
            .get(dir)
            .ok_or_else(|| StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            })?;
        Ok((
            Bytes::copy_from_slice(&segment.index),
            segment.data.len() as u64,
        ))
    }

    /// Reads `[offset, offset + length)` of the range's data.
    pub fn read_data(
        &self,
        dir: &PartitionDir,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let segment = self
            .segments
            .get(dir)
            .ok_or_else(|| StorageError::DataNotFound {
                app_id: dir.app_id.clone(),
                shuffle_id: dir.shuffle_id,
                range: dir.range.to_string(),
            })?;
        let start = (offset as usize).min(segment.data.len());
        let end = ((offset + length) as usize).min(segment.data.len());
        Ok(Bytes::copy_from_slice(&segment.data[start..end]))
    }

    /// Drops all segments for an app and returns the bytes freed.
    pub fn remove_app(&self, app_id: &AppId) -> u64 {
        let mut freed = 0u64;
        self.segments.retain(|dir, segment| {
            if dir.app_id == *app_id {
                freed += segment.data.len() as u64;
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}
