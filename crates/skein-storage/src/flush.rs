//! The flush pipeline.
//!
//! Accepted blocks become [`FlushEvent`]s which are enqueued on the
//! chosen backend's bounded queue and written by that backend's
//! single-writer worker, so callers never block on storage I/O and
//! events for one partition range stay in submission order.
//!
//! A full queue surfaces as backpressure to the caller
//! ([`StorageError::QueueFull`], translated to `NO_BUFFER` at the RPC
//! edge). A local write failure promotes the event to the remote tier
//! when one exists; a remote failure after `flush_retry_max` attempts
//! marks the partition range FAULTED, and subsequent reads fail fast.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use skein_types::{AppId, PartitionRange, ShuffleId};
use tokio::sync::Notify;

use crate::{FlushEvent, MultiStorageManager, StorageError, StorageTarget};

/// Delay between retries of a failed backend write.
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How long an idle worker waits before re-checking for shutdown.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct BackendQueue {
    name: &'static str,
    queue: ArrayQueue<FlushEvent>,
    notify: Notify,
}

impl BackendQueue {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: AtomicU64,
    drained: Notify,
}

/// A flush event the pipeline could not accept, handed back to the
/// caller together with the reason.
#[derive(Debug)]
pub struct RejectedFlush {
    pub event: FlushEvent,
    pub reason: StorageError,
}

/// Routes flush events to per-backend queues and tracks completion.
#[derive(Debug)]
pub struct Flusher {
    manager: Arc<MultiStorageManager>,
    local_queue: BackendQueue,
    remote_queue: BackendQueue,
    /// In-flight events per (app, shuffle); the commit barrier waits on this.
    pending: DashMap<(AppId, ShuffleId), Arc<Pending>>,
    /// Ranges whose flush failed terminally.
    faulted: DashMap<(AppId, ShuffleId, PartitionRange), ()>,
    flushed_events: AtomicU64,
    flush_retry_max: u32,
    closed: AtomicBool,
}

impl Flusher {
    pub fn new(
        manager: Arc<MultiStorageManager>,
        queue_capacity: usize,
        flush_retry_max: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            local_queue: BackendQueue::new("local", queue_capacity),
            remote_queue: BackendQueue::new("remote", queue_capacity),
            pending: DashMap::new(),
            faulted: DashMap::new(),
            flushed_events: AtomicU64::new(0),
            flush_retry_max,
            closed: AtomicBool::new(false),
        })
    }

    /// Spawns one single-writer worker per configured backend.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.manager.local().is_some() {
            let flusher = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                flusher.worker_loop(StorageTarget::Local).await;
            }));
        }
        if self.manager.has_remote() {
            let flusher = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                flusher.worker_loop(StorageTarget::Remote).await;
            }));
        }
        handles
    }

    /// Number of events queued but not yet written.
    pub fn event_num(&self) -> u64 {
        (self.local_queue.queue.len() + self.remote_queue.queue.len()) as u64
    }

    /// Total events flushed since startup.
    pub fn flushed_events(&self) -> u64 {
        self.flushed_events.load(Ordering::Relaxed)
    }

    /// Returns true if the range was marked FAULTED.
    pub fn is_faulted(&self, app_id: &AppId, shuffle_id: ShuffleId, range: PartitionRange) -> bool {
        self.faulted
            .contains_key(&(app_id.clone(), shuffle_id, range))
    }

    /// Submits an event to its selected backend.
    ///
    /// Memory-tier events are written inline (a buffer-to-buffer move);
    /// disk tiers are queued. Returns the chosen target so the caller can
    /// account, or a [`RejectedFlush`] handing the event back so its
    /// blocks can be re-buffered while the caller signals backpressure.
    pub fn submit(&self, event: FlushEvent) -> Result<StorageTarget, RejectedFlush> {
        let target = self.manager.select(&event);
        match target {
            StorageTarget::Memory => {
                if let Err(reason) = self.manager.write(StorageTarget::Memory, &event) {
                    return Err(RejectedFlush { event, reason });
                }
                self.flushed_events.fetch_add(1, Ordering::Relaxed);
                Ok(StorageTarget::Memory)
            }
            StorageTarget::Local | StorageTarget::Remote => {
                let backend = match target {
                    StorageTarget::Local => &self.local_queue,
                    _ => &self.remote_queue,
                };
                let pending = self
                    .pending
                    .entry((event.app_id.clone(), event.shuffle_id))
                    .or_default()
                    .clone();
                pending.count.fetch_add(1, Ordering::AcqRel);

                if let Err(event) = backend.queue.push(event) {
                    // Undo the reservation; the caller sees backpressure.
                    if pending.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                        pending.drained.notify_waiters();
                    }
                    return Err(RejectedFlush {
                        event,
                        reason: StorageError::QueueFull(backend.name),
                    });
                }
                backend.notify.notify_one();
                Ok(target)
            }
        }
    }

    /// Waits until no events are pending for (app, shuffle).
    ///
    /// This is the commit barrier: once it returns, every event accepted
    /// before the call is durable on its tier.
    pub async fn drain(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        timeout: Duration,
    ) -> Result<(), StorageError> {
        let key = (app_id.clone(), shuffle_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(pending) = self.pending.get(&key).map(|e| Arc::clone(e.value())) else {
                return Ok(());
            };
            if pending.count.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            let notified = pending.drained.notified();
            // Re-check after registering to close the wakeup race.
            if pending.count.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StorageError::DrainTimeout {
                    app_id: app_id.clone(),
                    shuffle_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Forgets all pipeline state for an app.
    pub fn remove_app(&self, app_id: &AppId) {
        self.pending.retain(|(app, _), _| app != app_id);
        self.faulted.retain(|(app, _, _), _| app != app_id);
    }

    /// Stops accepting signals and lets workers exit once their queues
    /// are empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.local_queue.notify.notify_waiters();
        self.remote_queue.notify.notify_waiters();
    }

    async fn worker_loop(self: Arc<Self>, target: StorageTarget) {
        let backend = match target {
            StorageTarget::Local => &self.local_queue,
            _ => &self.remote_queue,
        };
        tracing::info!(backend = backend.name, "flush worker started");
        loop {
            while let Some(event) = backend.queue.pop() {
                self.process(target, event).await;
            }
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let _ = tokio::time::timeout(WORKER_IDLE_WAIT, backend.notify.notified()).await;
        }
        tracing::info!(backend = backend.name, "flush worker stopped");
    }

    /// Writes one event, retrying and promoting per the failure policy.
    async fn process(&self, initial_target: StorageTarget, event: FlushEvent) {
        let key = (event.app_id.clone(), event.shuffle_id);
        let fault_key = (event.app_id.clone(), event.shuffle_id, event.range);

        let mut target = initial_target;
        let mut attempts = 0u32;
        let mut event = event;

        loop {
            let manager = Arc::clone(&self.manager);
            let result = tokio::task::spawn_blocking(move || {
                let result = manager.write(target, &event);
                (event, result)
            })
            .await;

            let (returned, write_result) = match result {
                Ok(pair) => pair,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "flush write task panicked");
                    self.faulted.insert(fault_key, ());
                    break;
                }
            };
            event = returned;

            match write_result {
                Ok(()) => {
                    self.flushed_events.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    if target == StorageTarget::Local && self.manager.has_remote() {
                        tracing::warn!(
                            app_id = %event.app_id,
                            shuffle_id = %event.shuffle_id,
                            range = %event.range,
                            error = %e,
                            "local flush failed, promoting event to remote storage"
                        );
                        target = StorageTarget::Remote;
                        attempts = 0;
                        continue;
                    }
                    attempts += 1;
                    if attempts <= self.flush_retry_max {
                        tracing::warn!(
                            app_id = %event.app_id,
                            shuffle_id = %event.shuffle_id,
                            error = %e,
                            attempt = attempts,
                            "flush failed, retrying"
                        );
                        tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                        continue;
                    }
                    tracing::error!(
                        app_id = %event.app_id,
                        shuffle_id = %event.shuffle_id,
                        range = %event.range,
                        error = %e,
                        "flush failed terminally, marking partition range faulted"
                    );
                    self.faulted.insert(fault_key, ());
                    break;
                }
            }
        }

        if let Some(pending) = self.pending.get(&key) {
            if pending.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                pending.drained.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HdfsStore, LocalFileStore, MountedFs, StoragePolicy};
    use bytes::Bytes;
    use skein_types::{BlockId, PartitionId, RemoteStorageInfo, ShuffleBlock, StorageType};

    fn test_event(app: &str, size: usize) -> FlushEvent {
        let block = ShuffleBlock::new(
            BlockId::new(0, PartitionId::new(0), 0),
            size as u32,
            Bytes::from(vec![7u8; size]),
        );
        FlushEvent::new(
            1,
            AppId::from(app),
            ShuffleId::new(0),
            PartitionRange::new(0, 1),
            vec![block],
        )
    }

    fn local_only(capacity: u64) -> (Arc<MultiStorageManager>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalFileStore::new(tmp.path(), capacity, 0.95));
        let manager = MultiStorageManager::new(
            StoragePolicy {
                storage_type: StorageType::MemoryLocalfile,
                flush_cold_storage_threshold_size: 2000,
            },
            Some(local),
            None,
        )
        .unwrap();
        (Arc::new(manager), tmp)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_flush_drain() {
        let (manager, _tmp) = local_only(1 << 20);
        let flusher = Flusher::new(Arc::clone(&manager), 16, 1);
        let _workers = flusher.spawn_workers();

        let event = test_event("app-f", 128);
        let dir = event.partition_dir();
        assert_eq!(flusher.submit(event).unwrap(), StorageTarget::Local);

        flusher
            .drain(&AppId::from("app-f"), ShuffleId::new(0), Duration::from_secs(5))
            .await
            .unwrap();

        let (_, data_len) = manager.read_index(&dir).unwrap();
        assert_eq!(data_len, 128);
        assert_eq!(flusher.flushed_events(), 1);
        flusher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_failure_promotes_to_remote() {
        let local_tmp = tempfile::tempdir().unwrap();
        let remote_tmp = tempfile::tempdir().unwrap();
        // Hard capacity far below the event size, watermark permissive.
        let local = Arc::new(LocalFileStore::new(local_tmp.path(), 4, 1.0));
        let remote = Arc::new(HdfsStore::new(Arc::new(MountedFs)));
        let app = AppId::from("app-p");
        remote.register_app(
            app.clone(),
            &RemoteStorageInfo::new(remote_tmp.path().to_string_lossy().to_string()),
        );
        let manager = Arc::new(
            MultiStorageManager::new(
                StoragePolicy {
                    storage_type: StorageType::MemoryLocalfileHdfs,
                    flush_cold_storage_threshold_size: 2000,
                },
                Some(local),
                Some(Arc::clone(&remote)),
            )
            .unwrap(),
        );
        let flusher = Flusher::new(Arc::clone(&manager), 16, 1);
        let _workers = flusher.spawn_workers();

        let event = test_event("app-p", 100);
        let dir = event.partition_dir();
        assert_eq!(flusher.submit(event).unwrap(), StorageTarget::Local);

        flusher
            .drain(&app, ShuffleId::new(0), Duration::from_secs(5))
            .await
            .unwrap();

        // Promoted write landed on the remote tier.
        let (_, data_len) = remote.read_index(&dir).unwrap();
        assert_eq!(data_len, 100);
        assert!(!flusher.is_faulted(&app, ShuffleId::new(0), PartitionRange::new(0, 1)));
        flusher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_failure_marks_fault() {
        let (manager, _tmp) = local_only(4);
        let flusher = Flusher::new(manager, 16, 0);
        let _workers = flusher.spawn_workers();

        let app = AppId::from("app-f");
        flusher.submit(test_event("app-f", 100)).unwrap();
        flusher
            .drain(&app, ShuffleId::new(0), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(flusher.is_faulted(&app, ShuffleId::new(0), PartitionRange::new(0, 1)));
        flusher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_is_backpressure() {
        let (manager, _tmp) = local_only(1 << 20);
        let flusher = Flusher::new(manager, 1, 1);
        // No workers: the queue cannot drain.
        flusher.submit(test_event("app-q", 8)).unwrap();
        let rejected = flusher.submit(test_event("app-q", 8)).unwrap_err();
        assert!(matches!(rejected.reason, StorageError::QueueFull(_)));
        // The event comes back intact so its blocks can be re-buffered.
        assert_eq!(rejected.event.blocks.len(), 1);
    }
}
