//! The write path: two-round quorum replication.
//!
//! Each block is annotated with an ordered replica list of length
//! `replica`. With `replica_skip_enabled` and `replica_write < replica`,
//! the list splits into a primary group (`[0, replica_write)`) and a
//! secondary group; the primary round goes first, in parallel across
//! servers under a bounded pool, and the secondary round runs only when
//! some primary server failed. A block succeeds iff at least
//! `replica_write` distinct servers acknowledged it.
//!
//! A primary round with *partial* success still sends the entire
//! secondary batch rather than routing individual blocks; trading
//! bandwidth for a simpler protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use skein_types::{
    AppId, BlockId, PartitionId, RemoteStorageInfo, ServerId, ShuffleBlock, ShuffleId,
    ShuffleServerInfo,
};
use skein_wire::{PartitionedData, RequestPayload, ResponsePayload, ShuffleData};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ClientConfig;
use crate::coordinator::ShuffleAssignments;
use crate::error::{ClientError, ClientResult};
use crate::transport::{ServerTransport, TransportPool};

/// One block with its replica target list.
#[derive(Debug, Clone)]
pub struct BlockSendSpec {
    pub shuffle_id: ShuffleId,
    pub partition_id: PartitionId,
    pub block: ShuffleBlock,
    /// Ordered replica servers, length = `replica`.
    pub servers: Vec<ShuffleServerInfo>,
}

/// Partition of the input block IDs after a send.
#[derive(Debug, Default)]
pub struct SendResult {
    pub success: Vec<BlockId>,
    pub failed: Vec<BlockId>,
}

/// Blocks bound for one server in one round.
#[derive(Default)]
struct ServerBatch {
    /// shuffle → partition → blocks, mirroring the wire shape.
    data: HashMap<ShuffleId, HashMap<PartitionId, Vec<ShuffleBlock>>>,
    block_ids: Vec<BlockId>,
}

impl ServerBatch {
    fn push(&mut self, spec: &BlockSendSpec) {
        self.data
            .entry(spec.shuffle_id)
            .or_default()
            .entry(spec.partition_id)
            .or_default()
            .push(spec.block.clone());
        self.block_ids.push(spec.block.block_id);
    }

    fn to_wire(&self) -> Vec<ShuffleData> {
        self.data
            .iter()
            .map(|(&shuffle_id, partitions)| ShuffleData {
                shuffle_id,
                partitions: partitions
                    .iter()
                    .map(|(&partition_id, blocks)| PartitionedData {
                        partition_id,
                        blocks: blocks.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// The engine-linked write client.
pub struct ShuffleWriteClient<T: ServerTransport> {
    config: ClientConfig,
    pool: Arc<TransportPool<T>>,
}

impl<T: ServerTransport> ShuffleWriteClient<T> {
    pub fn new(config: ClientConfig, pool: Arc<TransportPool<T>>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers the shuffle on every assigned server.
    pub async fn register_shuffle(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        assignments: &ShuffleAssignments,
        remote_storage: &RemoteStorageInfo,
    ) -> ClientResult<()> {
        for (server, ranges) in &assignments.server_to_ranges {
            let transport = self.transport_for(&server.id)?;
            let response = transport
                .call(
                    RequestPayload::RegisterShuffle {
                        app_id: app_id.clone(),
                        shuffle_id,
                        ranges: ranges.clone(),
                        remote_storage: remote_storage.clone(),
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
        }
        tracing::info!(
            app_id = %app_id,
            shuffle_id = %shuffle_id,
            servers = assignments.server_to_ranges.len(),
            "registered shuffle"
        );
        Ok(())
    }

    fn transport_for(&self, server_id: &ServerId) -> ClientResult<Arc<T>> {
        self.pool
            .get(server_id)
            .ok_or_else(|| ClientError::UnknownServer {
                server_id: server_id.clone(),
            })
    }

    /// Ships a batch of blocks to their replica sets.
    ///
    /// Never errors as a whole: the outcome is the per-block partition
    /// into `{success, failed}`. A block is a success iff at least
    /// `replica_write` of its servers acknowledged it.
    pub async fn send_shuffle_data(
        &self,
        app_id: &AppId,
        specs: Vec<BlockSendSpec>,
    ) -> SendResult {
        let counters: HashMap<BlockId, Arc<AtomicU32>> = specs
            .iter()
            .map(|spec| (spec.block.block_id, Arc::new(AtomicU32::new(0))))
            .collect();

        // Split each block's replica list into rounds.
        let primary_width = if self.config.two_round_send() {
            self.config.replica_write as usize
        } else {
            usize::MAX
        };
        let mut primary: HashMap<ServerId, ServerBatch> = HashMap::new();
        let mut secondary: HashMap<ServerId, ServerBatch> = HashMap::new();
        for spec in &specs {
            for (index, server) in spec.servers.iter().enumerate() {
                let round = if index < primary_width {
                    &mut primary
                } else {
                    &mut secondary
                };
                round.entry(server.id.clone()).or_default().push(spec);
            }
        }

        let primary_ok = self.send_round(app_id, &primary, &counters).await;
        if !primary_ok && !secondary.is_empty() {
            tracing::warn!(
                app_id = %app_id,
                "primary round had failures, sending secondary replica group"
            );
            self.send_round(app_id, &secondary, &counters).await;
        }

        let mut result = SendResult::default();
        for spec in &specs {
            let acks = counters[&spec.block.block_id].load(Ordering::Acquire);
            if acks >= self.config.replica_write {
                result.success.push(spec.block.block_id);
            } else {
                result.failed.push(spec.block.block_id);
            }
        }
        if !result.failed.is_empty() {
            tracing::error!(
                app_id = %app_id,
                failed = result.failed.len(),
                required = self.config.replica_write,
                "blocks missed their write quorum"
            );
        }
        result
    }

    /// Sends one round in parallel, bounded by the transfer pool.
    ///
    /// Returns true iff every server in the round acknowledged its batch.
    /// A server-level success increments the counter of every block in
    /// that server's batch.
    async fn send_round(
        &self,
        app_id: &AppId,
        batches: &HashMap<ServerId, ServerBatch>,
        counters: &HashMap<BlockId, Arc<AtomicU32>>,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(self.config.data_transfer_pool_size));
        let mut round = JoinSet::new();
        let mut all_ok = true;

        for (server_id, batch) in batches {
            let Some(transport) = self.pool.get(server_id) else {
                tracing::warn!(server_id = %server_id, "no transport for assigned server");
                all_ok = false;
                continue;
            };
            let payload = RequestPayload::SendShuffleData {
                app_id: app_id.clone(),
                data: batch.to_wire(),
            };
            let batch_counters: Vec<Arc<AtomicU32>> = batch
                .block_ids
                .iter()
                .map(|block_id| Arc::clone(&counters[block_id]))
                .collect();
            let semaphore = Arc::clone(&semaphore);
            let server_id = server_id.clone();
            let retry_max = self.config.retry_max;
            let retry_interval_max = self.config.retry_interval_max;

            round.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("transfer pool semaphore closed");
                match transport.call(payload, retry_max, retry_interval_max).await {
                    Ok(response) if response.is_success() => {
                        for counter in &batch_counters {
                            counter.fetch_add(1, Ordering::AcqRel);
                        }
                        true
                    }
                    Ok(response) => {
                        tracing::warn!(
                            server_id = %server_id,
                            status = %response.status,
                            message = %response.message,
                            "server rejected block batch"
                        );
                        false
                    }
                    Err(e) => {
                        tracing::warn!(server_id = %server_id, error = %e, "block batch send failed");
                        false
                    }
                }
            });
        }

        // Join barrier: accounting happens only after the whole round.
        while let Some(joined) = round.join_next().await {
            all_ok &= joined.unwrap_or(false);
        }
        all_ok
    }

    /// Reports each partition's block IDs to all of its assigned servers
    /// and requires a write quorum of acknowledgements per partition.
    pub async fn report_shuffle_result(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        task_attempt_id: u64,
        partition_to_block_ids: Vec<(PartitionId, Vec<BlockId>)>,
        assignments: &ShuffleAssignments,
    ) -> ClientResult<()> {
        let mut by_server: HashMap<ServerId, Vec<(PartitionId, Vec<BlockId>)>> = HashMap::new();
        let mut acks: HashMap<PartitionId, Arc<AtomicU32>> = HashMap::new();
        for (partition, block_ids) in &partition_to_block_ids {
            acks.insert(*partition, Arc::new(AtomicU32::new(0)));
            let servers = assignments.servers_for(*partition).unwrap_or(&[]);
            for server in servers {
                by_server
                    .entry(server.id.clone())
                    .or_default()
                    .push((*partition, block_ids.clone()));
            }
        }

        let mut calls = JoinSet::new();
        for (server_id, items) in by_server {
            let Ok(transport) = self.transport_for(&server_id) else {
                continue;
            };
            let payload = RequestPayload::ReportShuffleResult {
                app_id: app_id.clone(),
                shuffle_id,
                task_attempt_id,
                partition_to_block_ids: items.clone(),
            };
            let item_acks: Vec<Arc<AtomicU32>> = items
                .iter()
                .map(|(partition, _)| Arc::clone(&acks[partition]))
                .collect();
            let retry_max = self.config.retry_max;
            let retry_interval_max = self.config.retry_interval_max;
            calls.spawn(async move {
                if let Ok(response) = transport.call(payload, retry_max, retry_interval_max).await {
                    if response.is_success() {
                        for ack in &item_acks {
                            ack.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                }
            });
        }
        while calls.join_next().await.is_some() {}

        for (partition, ack) in &acks {
            let observed = ack.load(Ordering::Acquire);
            if observed < self.config.replica_write {
                return Err(ClientError::ReportQuorumFailed {
                    partition: *partition,
                    acks: observed,
                    required: self.config.replica_write,
                });
            }
        }
        Ok(())
    }

    /// Sends one commit to every server; returns the minimum commit
    /// count observed across them.
    pub async fn send_commit(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        servers: &[ShuffleServerInfo],
    ) -> ClientResult<u32> {
        let mut min_count = u32::MAX;
        for server in servers {
            let transport = self.transport_for(&server.id)?;
            let response = transport
                .call(
                    RequestPayload::SendCommit {
                        app_id: app_id.clone(),
                        shuffle_id,
                    },
                    self.config.retry_max,
                    self.config.retry_interval_max,
                )
                .await?;
            match response.payload {
                ResponsePayload::CommitCount { count } if response.is_success() => {
                    min_count = min_count.min(count);
                }
                _ => {
                    return Err(ClientError::Rpc {
                        addr: server.id.to_string(),
                        status: response.status,
                        message: response.message,
                    });
                }
            }
        }
        Ok(if servers.is_empty() { 0 } else { min_count })
    }

    /// Marks the shuffle read-ready on every server.
    pub async fn finish_shuffle(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        servers: &[ShuffleServerInfo],
    ) -> ClientResult<()> {
        for server in servers {
            let transport = self.transport_for(&server.id)?;
            let response = transport
                .call(
                    RequestPayload::FinishShuffle {
                        app_id: app_id.clone(),
                        shuffle_id,
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
        }
        Ok(())
    }

    /// Polls commit counts until every server has seen `num_maps` map
    /// commits, then finishes the shuffle. Bounded by
    /// `send_check_timeout`, checking every `send_check_interval`.
    pub async fn wait_commit_and_finish(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        servers: &[ShuffleServerInfo],
        num_maps: u32,
    ) -> ClientResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.send_check_timeout;
        loop {
            let observed = self.send_commit(app_id, shuffle_id, servers).await?;
            if observed >= num_maps {
                return self.finish_shuffle(app_id, shuffle_id, servers).await;
            }
            if tokio::time::Instant::now() + self.config.send_check_interval > deadline {
                return Err(ClientError::CommitCheckTimeout {
                    timeout_ms: self.config.send_check_timeout.as_millis() as u64,
                    observed,
                    expected: num_maps,
                });
            }
            tokio::time::sleep(self.config.send_check_interval).await;
        }
    }

    /// One app heartbeat to a single server (no retries; the deadline
    /// belongs to the heartbeat fan-out).
    pub async fn heartbeat_server(&self, app_id: &AppId, server_id: &ServerId) -> ClientResult<()> {
        let transport = self.transport_for(server_id)?;
        transport
            .call(
                RequestPayload::AppHeartbeat {
                    app_id: app_id.clone(),
                },
                0,
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfigBuilder;
    use crate::transport::mock::MockTransport;
    use bytes::Bytes;
    use skein_types::PartitionRange;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn three_server_pool() -> (Arc<TransportPool<MockTransport>>, Vec<ShuffleServerInfo>) {
        let pool = Arc::new(TransportPool::new());
        let mut infos = Vec::new();
        for name in ["s-a", "s-b", "s-c"] {
            pool.register(MockTransport::new(name));
            let mut info = ShuffleServerInfo::new(name, 0);
            info.id = ServerId::new(name);
            infos.push(info);
        }
        (pool, infos)
    }

    fn specs(servers: &[ShuffleServerInfo], count: u64) -> Vec<BlockSendSpec> {
        (0..count)
            .map(|seq| BlockSendSpec {
                shuffle_id: ShuffleId::new(0),
                partition_id: PartitionId::new(0),
                block: ShuffleBlock::new(
                    BlockId::new(seq, PartitionId::new(0), 1),
                    4,
                    Bytes::from_static(b"data"),
                ),
                servers: servers.to_vec(),
            })
            .collect()
    }

    fn quorum_config() -> ClientConfig {
        ClientConfigBuilder::new()
            .replica(3)
            .replica_write(2)
            .replica_read(2)
            .replica_skip_enabled(true)
            .retry_max(0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn secondary_round_is_skipped_when_primary_succeeds() {
        let (pool, infos) = three_server_pool();
        let client = ShuffleWriteClient::new(quorum_config(), Arc::clone(&pool));

        let result = client
            .send_shuffle_data(&AppId::from("app-w"), specs(&infos, 5))
            .await;
        assert_eq!(result.success.len(), 5);
        assert!(result.failed.is_empty());

        // Primary group is servers[0..2]; the third server is never hit.
        let third = pool.get(&ServerId::new("s-c")).unwrap();
        assert_eq!(third.send_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_failure_triggers_whole_secondary_round() {
        let (pool, infos) = three_server_pool();
        // One primary server errors: counts reach 1 in the primary
        // round, then the secondary round lifts every block to 2.
        pool.get(&ServerId::new("s-b"))
            .unwrap()
            .fail_sends
            .store(true, AtomicOrdering::SeqCst);

        let client = ShuffleWriteClient::new(quorum_config(), Arc::clone(&pool));
        let result = client
            .send_shuffle_data(&AppId::from("app-w"), specs(&infos, 4))
            .await;

        assert_eq!(result.success.len(), 4);
        assert!(result.failed.is_empty());

        let third = pool.get(&ServerId::new("s-c")).unwrap();
        assert_eq!(third.send_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(third.acked().len(), 4);
    }

    #[tokio::test]
    async fn blocks_below_write_quorum_fail() {
        let (pool, infos) = three_server_pool();
        for name in ["s-b", "s-c"] {
            pool.get(&ServerId::new(name))
                .unwrap()
                .fail_sends
                .store(true, AtomicOrdering::SeqCst);
        }

        let client = ShuffleWriteClient::new(quorum_config(), Arc::clone(&pool));
        let result = client
            .send_shuffle_data(&AppId::from("app-w"), specs(&infos, 3))
            .await;

        // Only one ack per block: below replica_write = 2.
        assert!(result.success.is_empty());
        assert_eq!(result.failed.len(), 3);
    }

    #[tokio::test]
    async fn skip_disabled_sends_one_round_to_all() {
        let (pool, infos) = three_server_pool();
        let config = ClientConfigBuilder::new()
            .replica(3)
            .replica_write(2)
            .replica_read(2)
            .replica_skip_enabled(false)
            .retry_max(0)
            .build()
            .unwrap();
        let client = ShuffleWriteClient::new(config, Arc::clone(&pool));

        let result = client
            .send_shuffle_data(&AppId::from("app-w"), specs(&infos, 2))
            .await;
        assert_eq!(result.success.len(), 2);

        for name in ["s-a", "s-b", "s-c"] {
            let server = pool.get(&ServerId::new(name)).unwrap();
            assert_eq!(server.send_calls.load(AtomicOrdering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn report_requires_write_quorum() {
        let (pool, infos) = three_server_pool();
        let client = ShuffleWriteClient::new(quorum_config(), Arc::clone(&pool));
        let assignments = ShuffleAssignments {
            partition_to_servers: vec![(PartitionId::new(0), infos.clone())],
            server_to_ranges: infos
                .iter()
                .map(|info| (info.clone(), vec![PartitionRange::new(0, 1)]))
                .collect(),
        };

        let ids = vec![BlockId::new(0, PartitionId::new(0), 1)];
        client
            .report_shuffle_result(
                &AppId::from("app-w"),
                ShuffleId::new(0),
                1,
                vec![(PartitionId::new(0), ids.clone())],
                &assignments,
            )
            .await
            .unwrap();

        // With no assigned servers for the partition, quorum cannot hold.
        let empty = ShuffleAssignments {
            partition_to_servers: vec![(PartitionId::new(0), Vec::new())],
            server_to_ranges: Vec::new(),
        };
        let err = client
            .report_shuffle_result(
                &AppId::from("app-w"),
                ShuffleId::new(0),
                1,
                vec![(PartitionId::new(0), ids)],
                &empty,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ReportQuorumFailed { .. }));
    }
}
