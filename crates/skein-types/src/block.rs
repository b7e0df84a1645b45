//! Shuffle block payloads and block-id bitmaps.

use bytes::Bytes;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::BlockId;

/// One shuffle block: the unit a map task ships to the shuffle servers.
///
/// Blocks are immutable once created. The CRC covers the (possibly
/// compressed) payload bytes as shipped; `uncompress_length` records the
/// original size for reader-side buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleBlock {
    /// Unique block ID within (app, shuffle).
    pub block_id: BlockId,
    /// Payload length in bytes.
    pub length: u32,
    /// Uncompressed payload length in bytes.
    pub uncompress_length: u32,
    /// CRC32 of the payload.
    pub crc: u64,
    /// Task attempt that produced the block.
    pub task_attempt_id: u64,
    /// The payload.
    pub data: Bytes,
}

impl ShuffleBlock {
    /// Creates a block, computing the payload CRC.
    pub fn new(block_id: BlockId, uncompress_length: u32, data: Bytes) -> Self {
        let crc = u64::from(crc32fast::hash(&data));
        Self {
            block_id,
            length: data.len() as u32,
            uncompress_length,
            crc,
            task_attempt_id: block_id.task_attempt_id(),
            data,
        }
    }

    /// Returns true if the payload matches the recorded CRC.
    pub fn verify_crc(&self) -> bool {
        u64::from(crc32fast::hash(&self.data)) == self.crc
    }
}

/// Compressed set of 64-bit block IDs for one (app, shuffle, partition).
///
/// Built on a Roaring treemap. Unions are associative and idempotent, so
/// bitmaps reported to different replica servers can be reconciled in any
/// order at read time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockIdBitmap {
    inner: RoaringTreemap,
}

impl BlockIdBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a block ID. Duplicate insertions collapse.
    pub fn insert(&mut self, block_id: BlockId) {
        self.inner.insert(block_id.as_u64());
    }

    /// Returns true if the set contains the block ID.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.inner.contains(block_id.as_u64())
    }

    /// Unions another bitmap into this one.
    pub fn union_with(&mut self, other: &BlockIdBitmap) {
        self.inner |= &other.inner;
    }

    /// Number of block IDs in the set.
    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates block IDs in ascending numeric order.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.inner.iter().map(BlockId::from)
    }

    /// Serializes to the portable Roaring format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.inner.serialized_size());
        self.inner
            .serialize_into(&mut buf)
            .expect("serializing into a Vec cannot fail");
        Bytes::from(buf)
    }

    /// Deserializes from the portable Roaring format.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        let inner = RoaringTreemap::deserialize_from(bytes)?;
        Ok(Self { inner })
    }
}

impl FromIterator<BlockId> for BlockIdBitmap {
    fn from_iter<T: IntoIterator<Item = BlockId>>(iter: T) -> Self {
        let mut bitmap = Self::new();
        for id in iter {
            bitmap.insert(id);
        }
        bitmap
    }
}
