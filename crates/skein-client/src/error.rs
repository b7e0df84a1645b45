//! Client error types.

use skein_types::{BlockId, PartitionId, StatusCode};
use skein_wire::WireError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to the compute engine.
///
/// Quorum failures are fatal per shuffle: the engine reruns the affected
/// tasks, which allocate fresh block IDs. The client never retries past
/// a quorum verdict.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport fault after RPC-layer retries.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A server answered with a terminal status.
    #[error("rpc to {addr} failed: {status} {message}")]
    Rpc {
        addr: String,
        status: StatusCode,
        message: String,
    },

    /// An assigned server has no registered transport.
    #[error("no transport registered for server {server_id}")]
    UnknownServer { server_id: skein_types::ServerId },

    /// Every coordinator in the list failed.
    #[error("all {attempted} coordinators unavailable, last: {last}")]
    CoordinatorsUnavailable { attempted: usize, last: String },

    /// Fewer than `replica_write` servers acknowledged a shuffle-result
    /// report for a partition.
    #[error(
        "report quorum failed for partition {partition}: {acks} acks, need {required}"
    )]
    ReportQuorumFailed {
        partition: PartitionId,
        acks: u32,
        required: u32,
    },

    /// Fewer than `replica_read` servers answered a result read.
    #[error("read quorum failed for partition {partition}: {successes} reads, need {required}")]
    ReadQuorumFailed {
        partition: PartitionId,
        successes: u32,
        required: u32,
    },

    /// Expected blocks could not be reconstructed from any replica.
    #[error("{missing} expected blocks missing for partition {partition} after all replicas")]
    MissingBlocks {
        partition: PartitionId,
        missing: u64,
    },

    /// A block's payload failed its CRC on every replica that holds it.
    #[error("crc mismatch for block {block_id} on every replica")]
    CrcMismatch { block_id: BlockId },

    /// Commit counts did not reach `num_maps` within the check timeout.
    #[error("commit check timed out after {timeout_ms} ms: {observed}/{expected} commits")]
    CommitCheckTimeout {
        timeout_ms: u64,
        observed: u32,
        expected: u32,
    },

    /// Invalid client configuration.
    #[error("invalid client config: {0}")]
    Config(String),
}
