//! In-memory buffer pool for incoming blocks.
//!
//! One buffer per (app, shuffle, partition), each guarded by its own
//! mutex; the pool tracks global usage against a hard capacity and
//! signals `NoBuffer` backpressure when a batch does not fit. A buffer
//! crossing `flush_threshold` asks the caller to emit a flush event.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use skein_types::{AppId, PartitionId, ShuffleBlock, ShuffleId};

use crate::error::{ServerError, ServerResult};

/// Key of one partition buffer.
pub type BufferKey = (AppId, ShuffleId, PartitionId);

#[derive(Debug, Default)]
struct PartitionBuffer {
    blocks: Mutex<Vec<ShuffleBlock>>,
    size: AtomicU64,
}

/// Result of an append: whether the buffer should flush now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub flush_needed: bool,
    pub buffer_size: u64,
}

/// Bounded pool of partition buffers.
#[derive(Debug)]
pub struct BufferPool {
    capacity: u64,
    flush_threshold: u64,
    used: AtomicU64,
    buffers: DashMap<BufferKey, PartitionBuffer>,
}

impl BufferPool {
    pub fn new(capacity: u64, flush_threshold: u64) -> Self {
        Self {
            capacity,
            flush_threshold,
            used: AtomicU64::new(0),
            buffers: DashMap::new(),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used_bytes())
    }

    /// Number of partitions with resident blocks.
    pub fn partition_count(&self) -> u64 {
        self.buffers.len() as u64
    }

    /// Appends a batch to a partition buffer.
    ///
    /// Fails with [`ServerError::NoBuffer`] when the batch would push
    /// the pool past its capacity; nothing is appended in that case.
    pub fn append(&self, key: BufferKey, blocks: Vec<ShuffleBlock>) -> ServerResult<AppendOutcome> {
        let batch_size: u64 = blocks.iter().map(|b| u64::from(b.length)).sum();

        // Optimistic reservation under the global counter.
        let prev = self.used.fetch_add(batch_size, Ordering::AcqRel);
        if prev + batch_size > self.capacity {
            self.used.fetch_sub(batch_size, Ordering::AcqRel);
            crate::metrics::REQUIRE_BUFFER_FAILED_TOTAL.inc();
            return Err(ServerError::NoBuffer {
                needed: batch_size,
                available: self.capacity.saturating_sub(prev),
            });
        }

        let buffer = self.buffers.entry(key).or_default();
        let mut guard = buffer.blocks.lock().expect("partition buffer poisoned");
        guard.extend(blocks);
        let buffer_size = buffer.size.fetch_add(batch_size, Ordering::AcqRel) + batch_size;

        Ok(AppendOutcome {
            flush_needed: buffer_size >= self.flush_threshold,
            buffer_size,
        })
    }

    /// Re-buffers blocks whose flush could not be queued.
    ///
    /// Bypasses the capacity check: the bytes were already accounted
    /// before the flush attempt took them out.
    pub fn restore(&self, key: BufferKey, blocks: Vec<ShuffleBlock>) {
        let batch_size: u64 = blocks.iter().map(|b| u64::from(b.length)).sum();
        let buffer = self.buffers.entry(key).or_default();
        let mut guard = buffer.blocks.lock().expect("partition buffer poisoned");
        guard.extend(blocks);
        buffer.size.fetch_add(batch_size, Ordering::AcqRel);
        self.used.fetch_add(batch_size, Ordering::AcqRel);
    }

    /// Drains a partition buffer for flushing, releasing its bytes from
    /// the pool. Returns an empty vec if nothing is buffered.
    pub fn take(&self, key: &BufferKey) -> Vec<ShuffleBlock> {
        let Some(buffer) = self.buffers.get(key) else {
            return Vec::new();
        };
        let mut guard = buffer.blocks.lock().expect("partition buffer poisoned");
        let blocks = std::mem::take(&mut *guard);
        let size = buffer.size.swap(0, Ordering::AcqRel);
        drop(guard);
        self.used.fetch_sub(size, Ordering::AcqRel);
        blocks
    }

    /// Partitions of a shuffle that currently hold blocks.
    pub fn buffered_partitions(&self, app_id: &AppId, shuffle_id: ShuffleId) -> Vec<PartitionId> {
        self.buffers
            .iter()
            .filter(|e| {
                let (app, shuffle, _) = e.key();
                app == app_id && *shuffle == shuffle_id
            })
            .filter(|e| e.size.load(Ordering::Relaxed) > 0)
            .map(|e| e.key().2)
            .collect()
    }

    /// Drops every buffer of an app and returns the bytes freed.
    pub fn remove_app(&self, app_id: &AppId) -> u64 {
        let mut freed = 0u64;
        self.buffers.retain(|(app, _, _), buffer| {
            if app == app_id {
                freed += buffer.size.load(Ordering::Relaxed);
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::AcqRel);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use skein_types::BlockId;

    fn key(app: &str, partition: u32) -> BufferKey {
        (
            AppId::from(app),
            ShuffleId::new(0),
            PartitionId::new(partition),
        )
    }

    fn block(seq: u64, size: usize) -> ShuffleBlock {
        ShuffleBlock::new(
            BlockId::new(seq, PartitionId::new(0), 0),
            size as u32,
            Bytes::from(vec![1u8; size]),
        )
    }

    #[test]
    fn append_tracks_usage_and_threshold() {
        let pool = BufferPool::new(1000, 100);

        let outcome = pool.append(key("a", 0), vec![block(0, 60)]).unwrap();
        assert!(!outcome.flush_needed);
        assert_eq!(pool.used_bytes(), 60);

        let outcome = pool.append(key("a", 0), vec![block(1, 50)]).unwrap();
        assert!(outcome.flush_needed);
        assert_eq!(outcome.buffer_size, 110);
    }

    #[test]
    fn capacity_exhaustion_is_no_buffer() {
        let pool = BufferPool::new(100, 1000);
        pool.append(key("a", 0), vec![block(0, 80)]).unwrap();

        let err = pool.append(key("a", 1), vec![block(1, 40)]).unwrap_err();
        assert!(matches!(err, ServerError::NoBuffer { needed: 40, .. }));
        // Failed append must not leak usage.
        assert_eq!(pool.used_bytes(), 80);
    }

    #[test]
    fn take_drains_and_releases() {
        let pool = BufferPool::new(1000, 100);
        pool.append(key("a", 0), vec![block(0, 60), block(1, 40)])
            .unwrap();

        let blocks = pool.take(&key("a", 0));
        assert_eq!(blocks.len(), 2);
        assert_eq!(pool.used_bytes(), 0);
        assert!(pool.take(&key("a", 0)).is_empty());
    }

    #[test]
    fn restore_rebuffers_without_capacity_check() {
        let pool = BufferPool::new(100, 1000);
        pool.append(key("a", 0), vec![block(0, 80)]).unwrap();
        let blocks = pool.take(&key("a", 0));
        pool.restore(key("a", 0), blocks);
        assert_eq!(pool.used_bytes(), 80);
        assert_eq!(pool.take(&key("a", 0)).len(), 1);
    }

    #[test]
    fn remove_app_only_touches_that_app() {
        let pool = BufferPool::new(1000, 10_000);
        pool.append(key("a", 0), vec![block(0, 30)]).unwrap();
        pool.append(key("b", 0), vec![block(1, 20)]).unwrap();

        assert_eq!(pool.remove_app(&AppId::from("a")), 30);
        assert_eq!(pool.used_bytes(), 20);
        assert_eq!(pool.take(&key("b", 0)).len(), 1);
    }
}
