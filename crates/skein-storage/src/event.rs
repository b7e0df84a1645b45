//! Flush events: the atomic unit of on-disk durability.

use skein_types::{AppId, PartitionRange, ShuffleBlock, ShuffleId};

use crate::PartitionDir;

/// All blocks of one partition accumulated since the last flush,
/// destined for one write to a storage tier.
///
/// Invariant: `size` equals the sum of the blocks' payload lengths; the
/// storage manager routes on it without touching the payloads.
#[derive(Debug)]
pub struct FlushEvent {
    /// Monotonic event id, for logs and metrics.
    pub event_id: u64,
    pub app_id: AppId,
    pub shuffle_id: ShuffleId,
    /// The partition range whose directory receives the write.
    pub range: PartitionRange,
    pub blocks: Vec<ShuffleBlock>,
    /// Total payload bytes across `blocks`.
    pub size: u64,
}

impl FlushEvent {
    pub fn new(
        event_id: u64,
        app_id: AppId,
        shuffle_id: ShuffleId,
        range: PartitionRange,
        blocks: Vec<ShuffleBlock>,
    ) -> Self {
        let size = blocks.iter().map(|b| u64::from(b.length)).sum();
        Self {
            event_id,
            app_id,
            shuffle_id,
            range,
            blocks,
            size,
        }
    }

    /// The partition-range directory this event writes into.
    pub fn partition_dir(&self) -> PartitionDir {
        PartitionDir::new(self.app_id.clone(), self.shuffle_id, self.range)
    }
}
