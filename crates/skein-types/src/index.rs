//! Fixed-width index records.
//!
//! Every block appended to a data file gets one 40-byte record in the
//! sibling index file, and the same bytes travel to readers over the
//! wire. Records are fixed-width so bulk readers can stride them
//! without parsing: record `i` lives at byte `i * INDEX_RECORD_SIZE`.
//!
//! Layout (big-endian):
//!
//! ```text
//! offset  0: u64  byte offset of the block in the data file
//! offset  8: u32  payload length
//! offset 12: u32  uncompressed payload length
//! offset 16: u64  crc32 of the payload
//! offset 24: u64  block id
//! offset 32: u64  task attempt id
//! ```

use bytes::{Buf, BufMut};

use crate::{BlockId, ShuffleBlock};

/// Size of one serialized index record in bytes.
pub const INDEX_RECORD_SIZE: usize = 40;

/// An index file whose length is not a whole number of records.
#[derive(Debug, thiserror::Error)]
#[error("corrupt index: {len} bytes is not a multiple of the record size")]
pub struct ParseIndexError {
    pub len: usize,
}

/// One index entry describing a block's position in its data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Byte offset of the block payload in the data file.
    pub offset: u64,
    /// Payload length in bytes.
    pub length: u32,
    /// Uncompressed payload length in bytes.
    pub uncompress_length: u32,
    /// CRC32 of the payload.
    pub crc: u64,
    /// The block's ID.
    pub block_id: BlockId,
    /// Task attempt that produced the block.
    pub task_attempt_id: u64,
}

impl IndexRecord {
    /// Builds a record for `block` written at `offset`.
    pub fn for_block(block: &ShuffleBlock, offset: u64) -> Self {
        Self {
            offset,
            length: block.length,
            uncompress_length: block.uncompress_length,
            crc: block.crc,
            block_id: block.block_id,
            task_attempt_id: block.task_attempt_id,
        }
    }

    /// Appends the 40-byte serialization to `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.uncompress_length);
        buf.put_u64(self.crc);
        buf.put_u64(self.block_id.as_u64());
        buf.put_u64(self.task_attempt_id);
    }

    /// Reads one record from `buf`.
    ///
    /// # Panics
    ///
    /// Panics if fewer than [`INDEX_RECORD_SIZE`] bytes remain; callers
    /// validate lengths via [`IndexRecord::parse_all`].
    pub fn read_from(buf: &mut impl Buf) -> Self {
        Self {
            offset: buf.get_u64(),
            length: buf.get_u32(),
            uncompress_length: buf.get_u32(),
            crc: buf.get_u64(),
            block_id: BlockId::from(buf.get_u64()),
            task_attempt_id: buf.get_u64(),
        }
    }

    /// Parses a whole index file or wire payload.
    pub fn parse_all(mut bytes: &[u8]) -> Result<Vec<IndexRecord>, ParseIndexError> {
        if bytes.len() % INDEX_RECORD_SIZE != 0 {
            return Err(ParseIndexError { len: bytes.len() });
        }
        let mut records = Vec::with_capacity(bytes.len() / INDEX_RECORD_SIZE);
        while !bytes.is_empty() {
            records.push(IndexRecord::read_from(&mut bytes));
        }
        Ok(records)
    }
}
