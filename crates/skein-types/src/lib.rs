//! # skein-types: Core types for Skein
//!
//! This crate contains shared types used across the Skein remote shuffle
//! service:
//! - Entity IDs ([`AppId`], [`ShuffleId`], [`PartitionId`], [`BlockId`])
//! - Partition placement ([`PartitionRange`], [`ShuffleServerInfo`])
//! - Storage descriptors ([`RemoteStorageInfo`], [`StorageType`])
//! - Wire status codes ([`StatusCode`])
//! - Shuffle payloads ([`ShuffleBlock`], [`BlockIdBitmap`])

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod block;
mod index;

pub use block::{BlockIdBitmap, ShuffleBlock};
pub use index::{INDEX_RECORD_SIZE, IndexRecord, ParseIndexError};

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a compute-engine application.
///
/// Application IDs are engine-assigned strings, globally unique for the
/// lifetime of the app (e.g. `application_1690000000000_0042`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the application ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of one shuffle within an application.
///
/// A shuffle is immutable after registration: its partition count and
/// remote-storage binding never change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShuffleId(u32);

impl ShuffleId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShuffleId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Identifier of one reducer partition within a shuffle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ============================================================================
// Block IDs
// ============================================================================

/// Bits reserved for the per-task block sequence number.
pub const SEQUENCE_NO_BITS: u32 = 18;
/// Bits reserved for the partition ID.
pub const PARTITION_ID_BITS: u32 = 24;
/// Bits reserved for the task attempt ID.
pub const TASK_ATTEMPT_ID_BITS: u32 = 21;

/// Maximum encodable sequence number (exclusive).
pub const MAX_SEQUENCE_NO: u64 = 1 << SEQUENCE_NO_BITS;
/// Maximum encodable partition ID (exclusive).
pub const MAX_PARTITION_ID: u64 = 1 << PARTITION_ID_BITS;
/// Maximum encodable task attempt ID (exclusive).
pub const MAX_TASK_ATTEMPT_ID: u64 = 1 << TASK_ATTEMPT_ID_BITS;

/// Globally unique identifier of a shuffle block within (app, shuffle).
///
/// **Bit Layout** (63 bits used):
/// - Bits 45..63: sequence number within the task attempt (18 bits)
/// - Bits 21..45: partition ID (24 bits)
/// - Bits 0..21: task attempt ID (21 bits)
///
/// The layout makes block IDs unique without coordination: a task attempt
/// allocates sequence numbers locally, and a rescheduled task gets a fresh
/// attempt ID, so its blocks never collide with the failed attempt's.
///
/// # Examples
///
/// ```
/// # use skein_types::{BlockId, PartitionId};
/// let id = BlockId::new(7, PartitionId::new(3), 11);
/// assert_eq!(id.sequence_no(), 7);
/// assert_eq!(id.partition_id(), PartitionId::new(3));
/// assert_eq!(id.task_attempt_id(), 11);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockId(u64);

impl BlockId {
    /// Encodes a block ID from its three components.
    ///
    /// # Panics
    ///
    /// Panics if any component exceeds its bit budget. Overflowing a field
    /// would silently corrupt a neighbouring field, which is never
    /// recoverable downstream.
    pub fn new(sequence_no: u64, partition_id: PartitionId, task_attempt_id: u64) -> Self {
        assert!(sequence_no < MAX_SEQUENCE_NO, "sequence number overflow");
        assert!(
            u64::from(partition_id.as_u32()) < MAX_PARTITION_ID,
            "partition id overflow"
        );
        assert!(
            task_attempt_id < MAX_TASK_ATTEMPT_ID,
            "task attempt id overflow"
        );
        Self(
            (sequence_no << (PARTITION_ID_BITS + TASK_ATTEMPT_ID_BITS))
                | (u64::from(partition_id.as_u32()) << TASK_ATTEMPT_ID_BITS)
                | task_attempt_id,
        )
    }

    /// Returns the sequence number component.
    pub fn sequence_no(self) -> u64 {
        self.0 >> (PARTITION_ID_BITS + TASK_ATTEMPT_ID_BITS)
    }

    /// Returns the partition ID component.
    pub fn partition_id(self) -> PartitionId {
        PartitionId::new(((self.0 >> TASK_ATTEMPT_ID_BITS) & (MAX_PARTITION_ID - 1)) as u32)
    }

    /// Returns the task attempt ID component.
    pub fn task_attempt_id(self) -> u64 {
        self.0 & (MAX_TASK_ATTEMPT_ID - 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u64 {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

// ============================================================================
// Partition placement
// ============================================================================

/// A half-open range `[start, end)` of reducer partitions co-located on a
/// shuffle server.
///
/// Ranges within one shuffle never overlap; the coordinator forms them by
/// slicing `[0, partition_num)` into strips of `partition_num_per_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionRange {
    start: u32,
    end: u32,
}

impl PartitionRange {
    /// Creates a new range.
    ///
    /// # Panics
    ///
    /// Panics if `start >= end`. Empty ranges are a caller bug.
    pub fn new(start: u32, end: u32) -> Self {
        assert!(start < end, "partition range must be non-empty");
        Self { start, end }
    }

    pub fn start(self) -> u32 {
        self.start
    }

    /// One past the last partition in the range.
    pub fn end(self) -> u32 {
        self.end
    }

    /// Number of partitions covered.
    pub fn width(self) -> u32 {
        self.end - self.start
    }

    /// Returns true if the range contains the given partition.
    pub fn contains(self, partition: PartitionId) -> bool {
        (self.start..self.end).contains(&partition.as_u32())
    }
}

impl Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Directory-name form used by the on-disk layout.
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Unique identifier of a shuffle server (host:port or operator-assigned).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection descriptor of a registered shuffle server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleServerInfo {
    /// Unique server ID.
    pub id: ServerId,
    /// Reachable host name or address.
    pub host: String,
    /// RPC port.
    pub port: u16,
    /// Capability tags the server advertises (e.g. deployment version).
    pub tags: BTreeSet<String>,
}

impl ShuffleServerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: ServerId::new(format!("{host}:{port}")),
            host,
            port,
            tags: BTreeSet::new(),
        }
    }

    /// Adds a capability tag. Builder-style, chainable.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns the `host:port` dial address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if this server's tags cover all `required` tags.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }
}

impl Display for ShuffleServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ============================================================================
// Storage descriptors
// ============================================================================

/// Location of the remote (cold) storage tier assigned to an app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStorageInfo {
    /// Root path under which the app's shuffle data is mirrored.
    pub path: String,
    /// Filesystem-specific configuration overrides.
    pub conf: BTreeMap<String, String>,
}

impl RemoteStorageInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conf: BTreeMap::new(),
        }
    }

    /// Returns true if no remote storage is configured.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

/// Storage tier combination a shuffle server operates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Blocks stay in memory only; nothing is flushed.
    Memory,
    /// Memory buffers flushed to local disk.
    #[default]
    MemoryLocalfile,
    /// Memory buffers flushed to local disk or remote storage by size.
    MemoryLocalfileHdfs,
    /// Memory buffers flushed straight to remote storage.
    MemoryHdfs,
}

impl StorageType {
    /// Returns true if the local-disk tier participates.
    pub fn with_localfile(self) -> bool {
        matches!(self, Self::MemoryLocalfile | Self::MemoryLocalfileHdfs)
    }

    /// Returns true if the remote tier participates.
    pub fn with_remote(self) -> bool {
        matches!(self, Self::MemoryLocalfileHdfs | Self::MemoryHdfs)
    }
}

impl Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "MEMORY",
            Self::MemoryLocalfile => "MEMORY_LOCALFILE",
            Self::MemoryLocalfileHdfs => "MEMORY_LOCALFILE_HDFS",
            Self::MemoryHdfs => "MEMORY_HDFS",
        };
        write!(f, "{name}")
    }
}

/// Error parsing a [`StorageType`] from its configuration spelling.
#[derive(Debug, thiserror::Error)]
#[error("unknown storage type: {0}")]
pub struct ParseStorageTypeError(String);

impl FromStr for StorageType {
    type Err = ParseStorageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MEMORY" => Ok(Self::Memory),
            "MEMORY_LOCALFILE" => Ok(Self::MemoryLocalfile),
            "MEMORY_LOCALFILE_HDFS" => Ok(Self::MemoryLocalfileHdfs),
            "MEMORY_HDFS" => Ok(Self::MemoryHdfs),
            other => Err(ParseStorageTypeError(other.to_string())),
        }
    }
}

// ============================================================================
// Wire status codes
// ============================================================================

/// Status of an RPC response.
///
/// Servers never raise errors across the wire; every response carries one
/// of these codes plus a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    AccessDenied,
    InternalError,
    Timeout,
    /// The target (app, shuffle) was never registered on this server.
    NoRegister,
    InvalidRequest,
    /// Buffer capacity exhausted; the caller should back off and retry.
    NoBuffer,
    /// The shuffle's state machine does not permit the operation.
    StateUnexpected,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if a retry with backoff may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::NoBuffer)
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NoRegister => "NO_REGISTER",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NoBuffer => "NO_BUFFER",
            Self::StateUnexpected => "STATE_UNEXPECTED",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_id_components_round_trip() {
        let id = BlockId::new(5, PartitionId::new(1000), 77);
        assert_eq!(id.sequence_no(), 5);
        assert_eq!(id.partition_id(), PartitionId::new(1000));
        assert_eq!(id.task_attempt_id(), 77);
    }

    #[test]
    fn block_id_zero() {
        let id = BlockId::new(0, PartitionId::new(0), 0);
        assert_eq!(id.as_u64(), 0);
    }

    #[test]
    #[should_panic(expected = "partition id overflow")]
    fn block_id_partition_overflow_panics() {
        let _ = BlockId::new(0, PartitionId::new(1 << 24), 0);
    }

    #[test]
    fn partition_range_contains() {
        let range = PartitionRange::new(4, 8);
        assert!(range.contains(PartitionId::new(4)));
        assert!(range.contains(PartitionId::new(7)));
        assert!(!range.contains(PartitionId::new(8)));
        assert_eq!(range.width(), 4);
        assert_eq!(range.to_string(), "4-8");
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn empty_partition_range_panics() {
        let _ = PartitionRange::new(3, 3);
    }

    #[test]
    fn server_tags_subset() {
        let server = ShuffleServerInfo::new("host-a", 19999)
            .with_tag("ss_v5")
            .with_tag("gpu");
        let mut required = BTreeSet::new();
        required.insert("ss_v5".to_string());
        assert!(server.satisfies(&required));
        required.insert("arm".to_string());
        assert!(!server.satisfies(&required));
    }

    #[test]
    fn storage_type_parsing() {
        assert_eq!(
            "MEMORY_LOCALFILE_HDFS".parse::<StorageType>().unwrap(),
            StorageType::MemoryLocalfileHdfs
        );
        assert_eq!(
            "memory_hdfs".parse::<StorageType>().unwrap(),
            StorageType::MemoryHdfs
        );
        assert!("TACHYON".parse::<StorageType>().is_err());
    }

    #[test]
    fn storage_type_tiers() {
        assert!(!StorageType::Memory.with_localfile());
        assert!(!StorageType::Memory.with_remote());
        assert!(StorageType::MemoryLocalfileHdfs.with_localfile());
        assert!(StorageType::MemoryLocalfileHdfs.with_remote());
        assert!(!StorageType::MemoryHdfs.with_localfile());
        assert!(StorageType::MemoryHdfs.with_remote());
    }

    proptest! {
        #[test]
        fn block_id_encoding_is_lossless(
            seq in 0u64..(1 << 18),
            partition in 0u32..(1 << 24),
            attempt in 0u64..(1 << 21),
        ) {
            let id = BlockId::new(seq, PartitionId::new(partition), attempt);
            prop_assert_eq!(id.sequence_no(), seq);
            prop_assert_eq!(id.partition_id().as_u32(), partition);
            prop_assert_eq!(id.task_attempt_id(), attempt);
        }
    }
}
