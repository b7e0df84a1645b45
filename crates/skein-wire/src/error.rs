//! Wire protocol error types.

use thiserror::Error;

/// Transport-level errors.
///
/// Application-level failures never surface here; they travel as status
/// codes inside the response envelope.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Peer sent a frame above [`crate::MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer closed the connection between frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// Deadline expired before the response arrived.
    #[error("rpc deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),

    /// Response id did not match the request id.
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: u64 },

    /// All retry attempts were exhausted.
    #[error("{attempts} rpc attempts to {addr} failed, last: {last}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        last: Box<WireError>,
    },
}

impl WireError {
    /// Returns true if a fresh attempt on a new connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_)
        )
    }
}
