//! Wire protocol for Skein.
//!
//! Request/response RPCs, one [`RequestPayload`] variant per verb, carried
//! as length-prefixed postcard frames over TCP. Every response travels in
//! the same envelope: a [`StatusCode`], a message, and a typed payload.
//! Servers never raise errors across the wire - failures become status
//! codes, and [`WireError`] is reserved for transport-level faults.
//!
//! ## Coordinator verbs
//! - [`RequestPayload::GetShuffleAssignments`] - place partition ranges
//! - [`RequestPayload::AccessCluster`] - admission control
//! - [`RequestPayload::FetchClientConf`] - dynamic client config
//! - [`RequestPayload::FetchRemoteStorage`] - per-app cold-storage root
//! - [`RequestPayload::ServerHeartbeat`] - server load report
//!
//! ## Shuffle-server verbs
//! - [`RequestPayload::RegisterShuffle`] / [`RequestPayload::SendShuffleData`]
//! - [`RequestPayload::SendCommit`] / [`RequestPayload::FinishShuffle`]
//! - [`RequestPayload::ReportShuffleResult`] / [`RequestPayload::GetShuffleResult`]
//! - [`RequestPayload::GetShuffleIndex`] / [`RequestPayload::GetShuffleData`]
//!
//! `AppHeartbeat` is accepted by both daemons.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use skein_types::{
    AppId, BlockId, PartitionId, PartitionRange, RemoteStorageInfo, ShuffleBlock, ShuffleId,
    ShuffleServerInfo, StatusCode,
};

mod client;
mod codec;
mod error;
mod server;

pub use client::RpcClient;
pub use codec::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use error::WireError;
pub use server::{RpcHandler, serve};

/// Wire protocol version, bumped on incompatible envelope changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Unique (per connection) request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(id: RequestId, payload: RequestPayload) -> Self {
        Self { id, payload }
    }
}

/// Load statistics a shuffle server reports with each heartbeat.
///
/// The coordinator orders assignment candidates by `(app_count,
/// used_memory)` ascending, so both fields must be kept honest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoadStats {
    /// Bytes currently held in shuffle buffers.
    pub used_memory: u64,
    /// Bytes reserved but not yet written.
    pub pre_allocated_size: u64,
    /// Bytes of buffer capacity still available.
    pub available_memory: u64,
    /// Flush events queued but not yet written.
    pub event_num: u64,
    /// Live applications on this server.
    pub app_count: u64,
    /// Partitions with resident state.
    pub partition_num: u64,
}

/// Blocks for one partition within a [`ShuffleData`] batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedData {
    pub partition_id: PartitionId,
    pub blocks: Vec<ShuffleBlock>,
}

/// Blocks for one shuffle within a `SendShuffleData` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleData {
    pub shuffle_id: ShuffleId,
    pub partitions: Vec<PartitionedData>,
}

/// One verb per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    // ------------------------------------------------------------------
    // Coordinator
    // ------------------------------------------------------------------
    GetShuffleAssignments {
        app_id: AppId,
        shuffle_id: ShuffleId,
        partition_num: u32,
        partition_num_per_range: u32,
        replica: u32,
        required_tags: BTreeSet<String>,
    },
    AccessCluster {
        access_id: String,
        tags: BTreeSet<String>,
    },
    FetchClientConf,
    FetchRemoteStorage {
        app_id: AppId,
    },
    ServerHeartbeat {
        info: ShuffleServerInfo,
        stats: ServerLoadStats,
    },

    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------
    AppHeartbeat {
        app_id: AppId,
    },

    // ------------------------------------------------------------------
    // Shuffle server
    // ------------------------------------------------------------------
    RegisterShuffle {
        app_id: AppId,
        shuffle_id: ShuffleId,
        ranges: Vec<PartitionRange>,
        remote_storage: RemoteStorageInfo,
    },
    SendShuffleData {
        app_id: AppId,
        data: Vec<ShuffleData>,
    },
    SendCommit {
        app_id: AppId,
        shuffle_id: ShuffleId,
    },
    FinishShuffle {
        app_id: AppId,
        shuffle_id: ShuffleId,
    },
    ReportShuffleResult {
        app_id: AppId,
        shuffle_id: ShuffleId,
        task_attempt_id: u64,
        partition_to_block_ids: Vec<(PartitionId, Vec<BlockId>)>,
    },
    GetShuffleResult {
        app_id: AppId,
        shuffle_id: ShuffleId,
        partition_id: PartitionId,
    },
    GetShuffleIndex {
        app_id: AppId,
        shuffle_id: ShuffleId,
        partition_id: PartitionId,
    },
    GetShuffleData {
        app_id: AppId,
        shuffle_id: ShuffleId,
        partition_id: PartitionId,
        offset: u64,
        length: u64,
    },
}

/// A response envelope: status code + message + typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub status: StatusCode,
    pub message: String,
    pub payload: ResponsePayload,
}

impl Response {
    /// A successful response carrying a payload.
    pub fn success(id: RequestId, payload: ResponsePayload) -> Self {
        Self {
            id,
            status: StatusCode::Success,
            message: "SUCCESS".to_string(),
            payload,
        }
    }

    /// A response with an explicit status and message, no payload.
    pub fn status(id: RequestId, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            message: message.into(),
            payload: ResponsePayload::None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Typed response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    None,
    ShuffleAssignments {
        /// partition → ordered replica servers (length = `replica`).
        partition_to_servers: Vec<(PartitionId, Vec<ShuffleServerInfo>)>,
        /// server → ranges it must pre-allocate.
        server_to_ranges: Vec<(ShuffleServerInfo, Vec<PartitionRange>)>,
    },
    ClientConf {
        conf: BTreeMap<String, String>,
    },
    RemoteStorage {
        info: RemoteStorageInfo,
    },
    CommitCount {
        count: u32,
    },
    ShuffleResult {
        /// Serialized [`skein_types::BlockIdBitmap`].
        bitmap: Bytes,
    },
    ShuffleIndex {
        /// Fixed-width index records, stride-readable.
        index: Bytes,
        /// Total length of the partition's data file.
        data_len: u64,
    },
    ShuffleData {
        data: Bytes,
    },
}
