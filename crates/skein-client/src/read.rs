//! The read path: quorum bitmap reconciliation and block reassembly.
//!
//! `get_shuffle_result` contacts the partition's assigned servers in
//! order and unions their bitmaps, stopping after `replica_read`
//! distinct successes; union is commutative and idempotent, so any
//! read-quorum subset yields the same set. Block payloads are then
//! reassembled by striding index records, filtering them against the
//! expected bitmap, and fetching coalesced data spans; a replica that
//! is missing blocks (written under `replica_write < replica`) is
//! papered over by the next replica in the list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use skein_types::{
    AppId, BlockId, BlockIdBitmap, IndexRecord, PartitionId, ShuffleId, ShuffleServerInfo,
};
use skein_wire::{RequestPayload, ResponsePayload};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::{ServerTransport, TransportPool};

/// Upper bound on one coalesced data fetch.
const MAX_FETCH_SPAN: u64 = 16 * 1024 * 1024;

/// A reconstructed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub block_id: BlockId,
    pub task_attempt_id: u64,
    pub uncompress_length: u32,
    pub data: Bytes,
}

/// The engine-linked read client.
pub struct ShuffleReadClient<T: ServerTransport> {
    config: ClientConfig,
    pool: Arc<TransportPool<T>>,
}

impl<T: ServerTransport> ShuffleReadClient<T> {
    pub fn new(config: ClientConfig, pool: Arc<TransportPool<T>>) -> Self {
        Self { config, pool }
    }

    /// Unions the partition's block-id bitmaps from a read quorum.
    pub async fn get_shuffle_result(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
        servers: &[ShuffleServerInfo],
    ) -> ClientResult<BlockIdBitmap> {
        let mut union = BlockIdBitmap::new();
        let mut successes: u32 = 0;

        for server in servers {
            if successes >= self.config.replica_read {
                break;
            }
            let Some(transport) = self.pool.get(&server.id) else {
                continue;
            };
            let response = transport
                .call(
                    RequestPayload::GetShuffleResult {
                        app_id: app_id.clone(),
                        shuffle_id,
                        partition_id: partition,
                    },
                    self.config.retry_max,
                    self.config.retry_interval_max,
                )
                .await;
            match response {
                Ok(response) if response.is_success() => {
                    if let ResponsePayload::ShuffleResult { bitmap } = response.payload {
                        match BlockIdBitmap::from_bytes(&bitmap) {
                            Ok(parsed) => {
                                union.union_with(&parsed);
                                successes += 1;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    server_id = %server.id,
                                    error = %e,
                                    "undecodable bitmap, trying next replica"
                                );
                            }
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(
                        server_id = %server.id,
                        status = %response.status,
                        "result read rejected, trying next replica"
                    );
                }
                Err(e) => {
                    tracing::warn!(server_id = %server.id, error = %e, "result read failed");
                }
            }
        }

        if successes >= self.config.replica_read {
            Ok(union)
        } else {
            Err(ClientError::ReadQuorumFailed {
                partition,
                successes,
                required: self.config.replica_read,
            })
        }
    }

    /// Reconstructs every expected block of a partition.
    ///
    /// The returned set equals the reported set: a block present in the
    /// quorum bitmap but unreadable from every replica is an error.
    pub async fn read_partition(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
        servers: &[ShuffleServerInfo],
    ) -> ClientResult<Vec<ReadBlock>> {
        let expected = self
            .get_shuffle_result(app_id, shuffle_id, partition, servers)
            .await?;
        let mut remaining: HashSet<BlockId> = expected
            .iter()
            .filter(|id| id.partition_id() == partition)
            .collect();
        let mut crc_failed: HashSet<BlockId> = HashSet::new();
        let mut blocks = Vec::with_capacity(remaining.len());

        for server in servers {
            if remaining.is_empty() {
                break;
            }
            match self
                .read_from_server(
                    app_id,
                    shuffle_id,
                    partition,
                    server,
                    &mut remaining,
                    &mut crc_failed,
                )
                .await
            {
                Ok(mut read) => blocks.append(&mut read),
                Err(e) => {
                    tracing::warn!(
                        server_id = %server.id,
                        error = %e,
                        "replica read failed, trying next"
                    );
                }
            }
        }

        if remaining.is_empty() {
            Ok(blocks)
        } else if remaining.iter().all(|id| crc_failed.contains(id)) {
            // Every replica served these blocks, all with corrupt
            // payloads: this is data corruption, not data loss.
            let block_id = *remaining.iter().next().expect("remaining is non-empty");
            Err(ClientError::CrcMismatch { block_id })
        } else {
            Err(ClientError::MissingBlocks {
                partition,
                missing: remaining.len() as u64,
            })
        }
    }

    /// Pulls whatever subset of `remaining` this server holds.
    ///
    /// Blocks whose payload fails its CRC are recorded in `crc_failed`
    /// and left in `remaining` for the next replica.
    async fn read_from_server(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
        server: &ShuffleServerInfo,
        remaining: &mut HashSet<BlockId>,
        crc_failed: &mut HashSet<BlockId>,
    ) -> ClientResult<Vec<ReadBlock>> {
        let transport = self
            .pool
            .get(&server.id)
            .ok_or_else(|| ClientError::UnknownServer {
                server_id: server.id.clone(),
            })?;

        let response = transport
            .call(
                RequestPayload::GetShuffleIndex {
                    app_id: app_id.clone(),
                    shuffle_id,
                    partition_id: partition,
                },
                self.config.retry_max,
                self.config.retry_interval_max,
            )
            .await?;
        if !response.is_success() {
            return Err(ClientError::Rpc {
                addr: server.id.to_string(),
                status: response.status,
                message: response.message,
            });
        }
        let ResponsePayload::ShuffleIndex { index, .. } = response.payload else {
            return Ok(Vec::new());
        };

        // Stride the index; keep the first record seen per wanted block.
        let mut wanted: HashMap<BlockId, IndexRecord> = HashMap::new();
        for record in IndexRecord::parse_all(&index)
            .map_err(|e| ClientError::Rpc {
                addr: server.id.to_string(),
                status: skein_types::StatusCode::InternalError,
                message: e.to_string(),
            })?
        {
            if remaining.contains(&record.block_id) {
                wanted.entry(record.block_id).or_insert(record);
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce adjacent records into bounded fetch spans.
        let mut records: Vec<IndexRecord> = wanted.into_values().collect();
        records.sort_by_key(|r| r.offset);

        let mut blocks = Vec::with_capacity(records.len());
        let mut span_start = 0usize;
        while span_start < records.len() {
            let mut span_end = span_start;
            let base = records[span_start].offset;
            let mut end = base + u64::from(records[span_start].length);
            while span_end + 1 < records.len() {
                let next = &records[span_end + 1];
                if next.offset != end || end - base + u64::from(next.length) > MAX_FETCH_SPAN {
                    break;
                }
                end += u64::from(next.length);
                span_end += 1;
            }

            let response = transport
                .call(
                    RequestPayload::GetShuffleData {
                        app_id: app_id.clone(),
                        shuffle_id,
                        partition_id: partition,
                        offset: base,
                        length: end - base,
                    },
                    self.config.retry_max,
                    self.config.retry_interval_max,
                )
                .await?;
            if !response.is_success() {
                return Err(ClientError::Rpc {
                    addr: server.id.to_string(),
                    status: response.status,
                    message: response.message,
                });
            }
            let ResponsePayload::ShuffleData { data } = response.payload else {
                break;
            };

            for record in &records[span_start..=span_end] {
                let start = (record.offset - base) as usize;
                let stop = start + record.length as usize;
                if stop > data.len() {
                    tracing::warn!(
                        server_id = %server.id,
                        block_id = %record.block_id,
                        "short data read, leaving block for the next replica"
                    );
                    continue;
                }
                let payload = data.slice(start..stop);
                if u64::from(crc32fast::hash(&payload)) != record.crc {
                    tracing::warn!(
                        server_id = %server.id,
                        block_id = %record.block_id,
                        "crc mismatch, leaving block for the next replica"
                    );
                    crc_failed.insert(record.block_id);
                    continue;
                }
                remaining.remove(&record.block_id);
                blocks.push(ReadBlock {
                    block_id: record.block_id,
                    task_attempt_id: record.task_attempt_id,
                    uncompress_length: record.uncompress_length,
                    data: payload,
                });
            }
            span_start = span_end + 1;
        }

        Ok(blocks)
    }
}
