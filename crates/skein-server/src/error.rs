//! Shuffle-server error types and their wire translation.

use skein_storage::StorageError;
use skein_types::{AppId, ShuffleId, StatusCode};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by server subsystems.
///
/// These never cross the wire: the handler translates each into a status
/// code plus message on the response envelope via [`ServerError::status`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// The (app, shuffle) was never registered here.
    #[error("no registration for app {app_id} shuffle {shuffle_id}")]
    NoRegister {
        app_id: AppId,
        shuffle_id: ShuffleId,
    },

    /// The shuffle's state machine does not permit the operation.
    #[error("shuffle {shuffle_id} of {app_id} is {actual}, operation needs {needed}")]
    StateUnexpected {
        app_id: AppId,
        shuffle_id: ShuffleId,
        actual: &'static str,
        needed: &'static str,
    },

    /// Buffer capacity exhausted: back off and retry.
    #[error("no buffer: need {needed} bytes, {available} available")]
    NoBuffer { needed: u64, available: u64 },

    /// A block targeted a partition outside the registered ranges.
    #[error("partition {partition} is not in any registered range of shuffle {shuffle_id}")]
    UnknownPartition {
        shuffle_id: ShuffleId,
        partition: u32,
    },

    /// The partition's data was marked FAULTED by the flush pipeline.
    #[error("partition range is faulted for {app_id}/{shuffle_id}")]
    Faulted {
        app_id: AppId,
        shuffle_id: ShuffleId,
    },

    /// Commit drain exceeded its deadline.
    #[error("commit drain timed out: {0}")]
    CommitTimeout(String),

    /// Storage-tier failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ServerError {
    /// The status code this error travels as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRegister { .. } => StatusCode::NoRegister,
            Self::StateUnexpected { .. } => StatusCode::StateUnexpected,
            Self::NoBuffer { .. } => StatusCode::NoBuffer,
            Self::UnknownPartition { .. } => StatusCode::InvalidRequest,
            Self::Faulted { .. } => StatusCode::InternalError,
            Self::CommitTimeout(_) => StatusCode::Timeout,
            Self::Storage(StorageError::QueueFull(_)) => StatusCode::NoBuffer,
            Self::Storage(StorageError::DrainTimeout { .. }) => StatusCode::Timeout,
            Self::Storage(_) => StatusCode::InternalError,
        }
    }
}
