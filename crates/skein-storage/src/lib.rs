//! Multi-tier storage for shuffle servers.
//!
//! Incoming blocks accumulate in memory buffers (owned by the server
//! crate). When a buffer crosses its flush threshold, or on commit, the
//! accumulated blocks become a [`FlushEvent`] and enter this crate:
//!
//! 1. [`MultiStorageManager::select`] picks the target tier from the
//!    event's size, the configured [`skein_types::StorageType`], and
//!    local-disk pressure.
//! 2. The [`Flusher`] enqueues the event on the chosen backend's bounded
//!    queue; a single-writer worker per backend drains it. The caller
//!    never blocks on I/O.
//! 3. [`LocalFileStore`] / [`HdfsStore`] append the blocks to a data file
//!    and the matching fixed-width [`IndexRecord`]s to an index file.
//!
//! # File Layout
//!
//! ```text
//! {base_path}/
//! └── {app_id}/
//!     └── {shuffle_id}/
//!         └── {start}-{end}/          <- partition range directory
//!             ├── 000000.data         <- block payloads, appended per flush
//!             └── 000000.index        <- one 40-byte record per block
//! ```
//!
//! The remote tier mirrors the same relative layout under the app's
//! assigned [`skein_types::RemoteStorageInfo`] root.

use std::path::PathBuf;

use skein_types::{AppId, PartitionRange, ShuffleId};

mod error;
mod event;
mod flush;
mod localfile;
mod manager;
mod mem;
mod remote;

pub use error::StorageError;
pub use event::FlushEvent;
pub use flush::{Flusher, RejectedFlush};
pub use skein_types::{INDEX_RECORD_SIZE, IndexRecord};
pub use localfile::LocalFileStore;
pub use manager::{MultiStorageManager, StoragePolicy, StorageTarget};
pub use mem::MemoryStore;
pub use remote::{HdfsStore, MountedFs, RemoteFilesystem};

/// Identity of one partition-range directory: the unit of file placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionDir {
    pub app_id: AppId,
    pub shuffle_id: ShuffleId,
    pub range: PartitionRange,
}

impl PartitionDir {
    pub fn new(app_id: AppId, shuffle_id: ShuffleId, range: PartitionRange) -> Self {
        Self {
            app_id,
            shuffle_id,
            range,
        }
    }

    /// Relative path of this range's directory under a storage root.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(self.app_id.as_str())
            .join(self.shuffle_id.to_string())
            .join(self.range.to_string())
    }
}

/// Formats a data filename from its sequence number.
pub(crate) fn data_filename(sequence: u32) -> String {
    format!("{sequence:06}.data")
}

/// Formats an index filename from its sequence number.
pub(crate) fn index_filename(sequence: u32) -> String {
    format!("{sequence:06}.index")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_dir_layout() {
        let dir = PartitionDir::new(
            AppId::from("app-1"),
            ShuffleId::new(2),
            PartitionRange::new(4, 8),
        );
        assert_eq!(dir.rel_path(), PathBuf::from("app-1/2/4-8"));
        assert_eq!(data_filename(0), "000000.data");
        assert_eq!(index_filename(17), "000017.index");
    }
}
