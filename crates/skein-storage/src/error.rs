//! Storage error types.

use skein_types::{AppId, ShuffleId};
use thiserror::Error;

/// Errors from the storage tiers and the flush pipeline.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error on a data or index file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No data has been written for the requested partition range.
    #[error("no data for {app_id}/{shuffle_id} range {range}")]
    DataNotFound {
        app_id: AppId,
        shuffle_id: ShuffleId,
        range: String,
    },

    /// Local disk is at hard capacity.
    #[error("disk capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// The storage type requires a tier that is not configured.
    #[error("storage type {0} requires a tier that is not configured")]
    TierNotConfigured(skein_types::StorageType),

    /// The app never registered a remote storage root on this server.
    #[error("no remote storage registered for app {0}")]
    NoRemoteStorage(AppId),

    /// The flush queue is full; the caller should apply backpressure.
    #[error("flush queue for {0} is full")]
    QueueFull(&'static str),

    /// An index file's length is not a whole number of records.
    #[error("corrupt index: {0}")]
    CorruptIndex(#[from] skein_types::ParseIndexError),

    /// The partition was marked FAULTED after a flush failure.
    #[error("partition range is faulted for {app_id}/{shuffle_id}")]
    Faulted {
        app_id: AppId,
        shuffle_id: ShuffleId,
    },

    /// Waiting for pending flushes exceeded the deadline.
    #[error("flush drain for {app_id}/{shuffle_id} timed out after {timeout_ms} ms")]
    DrainTimeout {
        app_id: AppId,
        shuffle_id: ShuffleId,
        timeout_ms: u64,
    },
}
