//! RPC dispatch for the shuffle server.
//!
//! Every operation returns a [`ServerResult`]; the [`RpcHandler`] impl
//! translates errors into status codes on the response envelope, so
//! nothing ever propagates across the wire as a failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use skein_storage::{
    Flusher, HdfsStore, LocalFileStore, MountedFs, MultiStorageManager, PartitionDir,
    StorageError, StoragePolicy,
};
use skein_types::{
    AppId, PartitionId, PartitionRange, RemoteStorageInfo, ShuffleId, ShuffleServerInfo,
};
use skein_wire::{
    Request, RequestPayload, Response, ResponsePayload, RpcHandler, ServerLoadStats, ShuffleData,
};

use crate::app::{AppRegistry, ShuffleMeta};
use crate::buffer::BufferPool;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Handles to the server's background tasks.
pub struct BackgroundTasks {
    /// Per-backend flush workers; they drain and exit after shutdown.
    pub flush_workers: Vec<tokio::task::JoinHandle<()>>,
    /// The app-TTL GC sweep; runs until aborted.
    pub gc: tokio::task::JoinHandle<()>,
}

/// The shuffle server's RPC surface and owned state.
pub struct ShuffleServerHandler {
    info: ShuffleServerInfo,
    apps: Arc<AppRegistry>,
    buffers: Arc<BufferPool>,
    manager: Arc<MultiStorageManager>,
    flusher: Arc<Flusher>,
    commit_timeout: Duration,
    cleanup_interval: Duration,
    event_seq: AtomicU64,
}

impl ShuffleServerHandler {
    /// Assembles buffers, storage tiers, and the flush pipeline from a
    /// validated config.
    pub fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        let storage = &config.storage;
        let local = storage.kind.with_localfile().then(|| {
            Arc::new(LocalFileStore::new(
                storage.base_path.clone(),
                storage.disk_capacity,
                storage.high_watermark,
            ))
        });
        let remote = storage
            .kind
            .with_remote()
            .then(|| Arc::new(HdfsStore::new(Arc::new(MountedFs))));

        let manager = Arc::new(MultiStorageManager::new(
            StoragePolicy {
                storage_type: storage.kind,
                flush_cold_storage_threshold_size: storage.flush_cold_storage_threshold_size,
            },
            local,
            remote,
        )?);
        let flusher = Flusher::new(
            Arc::clone(&manager),
            storage.flush_queue_capacity,
            storage.flush_retry_max,
        );

        Ok(Self {
            info: server_info(config),
            apps: Arc::new(AppRegistry::new(Duration::from_secs(
                config.heartbeat.app_ttl_secs,
            ))),
            buffers: Arc::new(BufferPool::new(
                config.buffer.capacity,
                config.buffer.flush_threshold,
            )),
            manager,
            flusher,
            commit_timeout: Duration::from_secs(config.commit_timeout_secs),
            cleanup_interval: Duration::from_secs(config.heartbeat.cleanup_interval_secs),
            event_seq: AtomicU64::new(0),
        })
    }

    /// This server's identity, as advertised to the coordinator.
    pub fn info(&self) -> &ShuffleServerInfo {
        &self.info
    }

    /// Load statistics for the next heartbeat.
    pub fn load_stats(&self) -> ServerLoadStats {
        let used = self.buffers.used_bytes();
        crate::metrics::USED_MEMORY.set(used as i64);
        crate::metrics::APP_NUMBER.set(self.apps.app_count() as i64);
        ServerLoadStats {
            used_memory: used,
            pre_allocated_size: 0,
            available_memory: self.buffers.available_bytes(),
            event_num: self.flusher.event_num(),
            app_count: self.apps.app_count(),
            partition_num: self.buffers.partition_count(),
        }
    }

    /// Spawns the flush workers and the app-TTL GC sweep.
    ///
    /// Flush workers exit on their own after [`Self::shutdown`] once
    /// their queues are empty; the GC sweep runs until aborted.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let flush_workers = self.flusher.spawn_workers();

        let handler = Arc::clone(self);
        let gc = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(handler.cleanup_interval);
            loop {
                ticker.tick().await;
                handler.gc_expired_apps().await;
            }
        });
        BackgroundTasks { flush_workers, gc }
    }

    /// Stops the flush pipeline (drains queues first).
    pub fn shutdown(&self) {
        self.flusher.close();
    }

    /// Purges every trace of apps whose heartbeat TTL expired.
    async fn gc_expired_apps(&self) {
        for app_id in self.apps.evict_expired() {
            self.buffers.remove_app(&app_id);
            self.flusher.remove_app(&app_id);
            let manager = Arc::clone(&self.manager);
            let id = app_id.clone();
            let result =
                tokio::task::spawn_blocking(move || manager.remove_app(&id)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(app_id = %app_id, error = %e, "failed to purge app storage");
                }
                Err(e) => {
                    tracing::error!(app_id = %app_id, error = %e, "storage purge task panicked");
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Operations
    // --------------------------------------------------------------------

    fn register_shuffle(
        &self,
        app_id: AppId,
        shuffle_id: ShuffleId,
        ranges: Vec<PartitionRange>,
        remote_storage: RemoteStorageInfo,
    ) -> ServerResult<ResponsePayload> {
        if !remote_storage.is_empty() {
            self.manager
                .register_remote_app(app_id.clone(), &remote_storage);
        }
        self.apps
            .register_shuffle(app_id, shuffle_id, ranges, remote_storage);
        Ok(ResponsePayload::None)
    }

    fn send_shuffle_data(
        &self,
        app_id: &AppId,
        data: Vec<ShuffleData>,
    ) -> ServerResult<ResponsePayload> {
        for shuffle_data in data {
            let shuffle = self.apps.get_shuffle(app_id, shuffle_data.shuffle_id)?;
            shuffle.accept_writes()?;

            for partitioned in shuffle_data.partitions {
                let partition = partitioned.partition_id;
                let range = shuffle.range_for(partition).ok_or_else(|| {
                    ServerError::UnknownPartition {
                        shuffle_id: shuffle_data.shuffle_id,
                        partition: partition.as_u32(),
                    }
                })?;

                let batch_bytes: u64 =
                    partitioned.blocks.iter().map(|b| u64::from(b.length)).sum();
                let key = (app_id.clone(), shuffle_data.shuffle_id, partition);
                let outcome = self.buffers.append(key.clone(), partitioned.blocks)?;
                crate::metrics::RECEIVED_DATA_TOTAL.inc_by(batch_bytes);

                if outcome.flush_needed {
                    self.flush_partition(app_id, &shuffle, partition, range)?;
                }
            }
        }
        Ok(ResponsePayload::None)
    }

    /// Drains one partition buffer into a flush event.
    fn flush_partition(
        &self,
        app_id: &AppId,
        shuffle: &ShuffleMeta,
        partition: PartitionId,
        range: PartitionRange,
    ) -> ServerResult<()> {
        let key = (app_id.clone(), shuffle.shuffle_id(), partition);
        let blocks = self.buffers.take(&key);
        if blocks.is_empty() {
            return Ok(());
        }
        let event = skein_storage::FlushEvent::new(
            self.event_seq.fetch_add(1, Ordering::Relaxed),
            app_id.clone(),
            key.1,
            range,
            blocks,
        );
        match self.flusher.submit(event) {
            Ok(_target) => Ok(()),
            Err(rejected) => {
                // Blocks stay buffered; the client sees backpressure and
                // retries, by which time the queue has drained.
                self.buffers.restore(key, rejected.event.blocks);
                Err(ServerError::Storage(rejected.reason))
            }
        }
    }

    async fn send_commit(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
    ) -> ServerResult<ResponsePayload> {
        let shuffle = self.apps.get_shuffle(app_id, shuffle_id)?;
        shuffle.begin_commit()?;

        // Flush everything still buffered for this shuffle, then wait for
        // the pipeline to drain: the commit barrier.
        for partition in self.buffers.buffered_partitions(app_id, shuffle_id) {
            let Some(range) = shuffle.range_for(partition) else {
                continue;
            };
            self.flush_partition(app_id, &shuffle, partition, range)?;
        }
        self.flusher
            .drain(app_id, shuffle_id, self.commit_timeout)
            .await?;

        let count = shuffle.complete_commit();
        tracing::debug!(
            app_id = %app_id,
            shuffle_id = %shuffle_id,
            commit_count = count,
            "commit barrier complete"
        );
        Ok(ResponsePayload::CommitCount { count })
    }

    fn finish_shuffle(&self, app_id: &AppId, shuffle_id: ShuffleId) -> ServerResult<ResponsePayload> {
        let shuffle = self.apps.get_shuffle(app_id, shuffle_id)?;
        shuffle.finish()?;
        tracing::info!(app_id = %app_id, shuffle_id = %shuffle_id, "shuffle is readable");
        Ok(ResponsePayload::None)
    }

    fn report_shuffle_result(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition_to_block_ids: Vec<(PartitionId, Vec<skein_types::BlockId>)>,
    ) -> ServerResult<ResponsePayload> {
        let shuffle = self.apps.get_shuffle(app_id, shuffle_id)?;
        shuffle.require_live()?;
        for (partition, block_ids) in partition_to_block_ids {
            shuffle.report_block_ids(partition, &block_ids);
        }
        Ok(ResponsePayload::None)
    }

    fn get_shuffle_result(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
    ) -> ServerResult<ResponsePayload> {
        let shuffle = self.apps.get_shuffle(app_id, shuffle_id)?;
        shuffle.require_live()?;
        Ok(ResponsePayload::ShuffleResult {
            bitmap: shuffle.block_ids(partition).to_bytes(),
        })
    }

    /// Resolves the partition's range and checks the fault ledger.
    fn readable_dir(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
    ) -> ServerResult<PartitionDir> {
        let shuffle = self.apps.get_shuffle(app_id, shuffle_id)?;
        shuffle.require_readable()?;
        let range = shuffle
            .range_for(partition)
            .ok_or_else(|| ServerError::UnknownPartition {
                shuffle_id,
                partition: partition.as_u32(),
            })?;
        if self.flusher.is_faulted(app_id, shuffle_id, range) {
            return Err(ServerError::Faulted {
                app_id: app_id.clone(),
                shuffle_id,
            });
        }
        Ok(PartitionDir::new(app_id.clone(), shuffle_id, range))
    }

    async fn get_shuffle_index(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
    ) -> ServerResult<ResponsePayload> {
        let dir = self.readable_dir(app_id, shuffle_id, partition)?;
        let manager = Arc::clone(&self.manager);
        let result = tokio::task::spawn_blocking(move || manager.read_index(&dir))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        match result {
            Ok((index, data_len)) => Ok(ResponsePayload::ShuffleIndex { index, data_len }),
            // A partition that never produced blocks has no files; that
            // is an empty read, not an error.
            Err(StorageError::DataNotFound { .. }) => Ok(ResponsePayload::ShuffleIndex {
                index: Bytes::new(),
                data_len: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_shuffle_data(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition: PartitionId,
        offset: u64,
        length: u64,
    ) -> ServerResult<ResponsePayload> {
        let dir = self.readable_dir(app_id, shuffle_id, partition)?;
        let manager = Arc::clone(&self.manager);
        let data = tokio::task::spawn_blocking(move || manager.read_data(&dir, offset, length))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        crate::metrics::READ_DATA_TOTAL.inc_by(data.len() as u64);
        Ok(ResponsePayload::ShuffleData { data })
    }
}

/// Builds this server's advertised identity from config.
fn server_info(config: &ServerConfig) -> ShuffleServerInfo {
    let (bind_host, port) = config
        .bind
        .rsplit_once(':')
        .map(|(h, p)| (h.to_string(), p.parse::<u16>().unwrap_or(19999)))
        .unwrap_or_else(|| (config.bind.clone(), 19999));
    let host = config
        .advertised_host
        .clone()
        .unwrap_or(bind_host);
    let mut info = ShuffleServerInfo::new(host, port);
    for tag in &config.tags {
        info = info.with_tag(tag.clone());
    }
    info
}

impl RpcHandler for ShuffleServerHandler {
    async fn handle(&self, request: Request) -> Response {
        let id = request.id;
        let result: ServerResult<ResponsePayload> = match request.payload {
            RequestPayload::RegisterShuffle {
                app_id,
                shuffle_id,
                ranges,
                remote_storage,
            } => self.register_shuffle(app_id, shuffle_id, ranges, remote_storage),

            RequestPayload::SendShuffleData { app_id, data } => {
                self.send_shuffle_data(&app_id, data)
            }

            RequestPayload::SendCommit { app_id, shuffle_id } => {
                self.send_commit(&app_id, shuffle_id).await
            }

            RequestPayload::FinishShuffle { app_id, shuffle_id } => {
                self.finish_shuffle(&app_id, shuffle_id)
            }

            RequestPayload::ReportShuffleResult {
                app_id,
                shuffle_id,
                task_attempt_id: _,
                partition_to_block_ids,
            } => self.report_shuffle_result(&app_id, shuffle_id, partition_to_block_ids),

            RequestPayload::GetShuffleResult {
                app_id,
                shuffle_id,
                partition_id,
            } => self.get_shuffle_result(&app_id, shuffle_id, partition_id),

            RequestPayload::GetShuffleIndex {
                app_id,
                shuffle_id,
                partition_id,
            } => self.get_shuffle_index(&app_id, shuffle_id, partition_id).await,

            RequestPayload::GetShuffleData {
                app_id,
                shuffle_id,
                partition_id,
                offset,
                length,
            } => {
                self.get_shuffle_data(&app_id, shuffle_id, partition_id, offset, length)
                    .await
            }

            RequestPayload::AppHeartbeat { app_id } => {
                self.apps.heartbeat(&app_id);
                Ok(ResponsePayload::None)
            }

            other => {
                return Response::status(
                    id,
                    skein_types::StatusCode::InvalidRequest,
                    format!("not a shuffle-server verb: {other:?}"),
                );
            }
        };

        match result {
            Ok(payload) => Response::success(id, payload),
            Err(e) => Response::status(id, e.status(), e.to_string()),
        }
    }
}
