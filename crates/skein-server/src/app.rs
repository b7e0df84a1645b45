//! Application and shuffle lifecycles on the data plane.
//!
//! Per (app, shuffle) the server runs this state machine:
//!
//! ```text
//! (absent) --register--> Registered --sendShuffleData*--> Writing
//! Writing --sendCommit--> Committing --(drain)--> Committed
//! Committed --finishShuffle--> Readable
//! any state --app heartbeat TTL--> Tombstoned --gc--> (absent)
//! ```
//!
//! Data and index reads require `Readable`; writes after `Readable` are
//! `STATE_UNEXPECTED`. The block-id bitmaps are append-only and merged
//! by union at read time, so reporting is idempotent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_types::{
    AppId, BlockId, BlockIdBitmap, PartitionId, PartitionRange, RemoteStorageInfo, ShuffleId,
};

use crate::error::{ServerError, ServerResult};

/// States of one shuffle on this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleState {
    Registered,
    Writing,
    Committing,
    Committed,
    Readable,
    Tombstoned,
}

impl ShuffleState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Registered => "Registered",
            Self::Writing => "Writing",
            Self::Committing => "Committing",
            Self::Committed => "Committed",
            Self::Readable => "Readable",
            Self::Tombstoned => "Tombstoned",
        }
    }
}

/// Server-side metadata of one registered shuffle.
#[derive(Debug)]
pub struct ShuffleMeta {
    app_id: AppId,
    shuffle_id: ShuffleId,
    ranges: Vec<PartitionRange>,
    state: Mutex<ShuffleState>,
    /// Map-task commits observed so far; monotonically non-decreasing.
    commit_count: AtomicU32,
    /// Reported block IDs per partition.
    bitmaps: DashMap<PartitionId, BlockIdBitmap>,
}

impl ShuffleMeta {
    fn new(app_id: AppId, shuffle_id: ShuffleId, ranges: Vec<PartitionRange>) -> Self {
        Self {
            app_id,
            shuffle_id,
            ranges,
            state: Mutex::new(ShuffleState::Registered),
            commit_count: AtomicU32::new(0),
            bitmaps: DashMap::new(),
        }
    }

    pub fn shuffle_id(&self) -> ShuffleId {
        self.shuffle_id
    }

    pub fn state(&self) -> ShuffleState {
        *self.state.lock().expect("shuffle state poisoned")
    }

    pub fn ranges(&self) -> &[PartitionRange] {
        &self.ranges
    }

    /// The registered range containing `partition`, if any.
    pub fn range_for(&self, partition: PartitionId) -> Option<PartitionRange> {
        self.ranges.iter().copied().find(|r| r.contains(partition))
    }

    fn state_error(&self, actual: ShuffleState, needed: &'static str) -> ServerError {
        ServerError::StateUnexpected {
            app_id: self.app_id.clone(),
            shuffle_id: self.shuffle_id,
            actual: actual.name(),
            needed,
        }
    }

    /// Transition for incoming write batches.
    pub fn accept_writes(&self) -> ServerResult<()> {
        let mut state = self.state.lock().expect("shuffle state poisoned");
        match *state {
            ShuffleState::Registered
            | ShuffleState::Writing
            | ShuffleState::Committing
            | ShuffleState::Committed => {
                *state = ShuffleState::Writing;
                Ok(())
            }
            other => Err(self.state_error(other, "a writable state")),
        }
    }

    /// Transition into the commit barrier.
    pub fn begin_commit(&self) -> ServerResult<()> {
        let mut state = self.state.lock().expect("shuffle state poisoned");
        match *state {
            ShuffleState::Registered
            | ShuffleState::Writing
            | ShuffleState::Committing
            | ShuffleState::Committed => {
                *state = ShuffleState::Committing;
                Ok(())
            }
            other => Err(self.state_error(other, "a committable state")),
        }
    }

    /// Completes a commit after the flush drain; returns the new count.
    pub fn complete_commit(&self) -> u32 {
        let mut state = self.state.lock().expect("shuffle state poisoned");
        if *state == ShuffleState::Committing {
            *state = ShuffleState::Committed;
        }
        self.commit_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count.load(Ordering::Acquire)
    }

    /// Transition on `finishShuffle`: the shuffle becomes read-ready and
    /// rejects further writes.
    pub fn finish(&self) -> ServerResult<()> {
        let mut state = self.state.lock().expect("shuffle state poisoned");
        match *state {
            ShuffleState::Committed | ShuffleState::Readable => {
                *state = ShuffleState::Readable;
                Ok(())
            }
            other => Err(self.state_error(other, "Committed")),
        }
    }

    /// Guard for data and index reads.
    pub fn require_readable(&self) -> ServerResult<()> {
        let state = self.state();
        if state == ShuffleState::Readable {
            Ok(())
        } else {
            Err(self.state_error(state, "Readable"))
        }
    }

    /// Guard for any operation on a live shuffle.
    pub fn require_live(&self) -> ServerResult<()> {
        let state = self.state();
        if state == ShuffleState::Tombstoned {
            Err(self.state_error(state, "a live state"))
        } else {
            Ok(())
        }
    }

    fn tombstone(&self) {
        *self.state.lock().expect("shuffle state poisoned") = ShuffleState::Tombstoned;
    }

    /// Unions reported block IDs into the partition's bitmap.
    pub fn report_block_ids(&self, partition: PartitionId, block_ids: &[BlockId]) {
        let mut bitmap = self.bitmaps.entry(partition).or_default();
        for &id in block_ids {
            bitmap.insert(id);
        }
    }

    /// Snapshot of the partition's bitmap (empty if none reported).
    pub fn block_ids(&self, partition: PartitionId) -> BlockIdBitmap {
        self.bitmaps
            .get(&partition)
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

/// One live application with its registered shuffles.
#[derive(Debug)]
pub struct App {
    app_id: AppId,
    remote_storage: RemoteStorageInfo,
    last_heartbeat: Mutex<Instant>,
    shuffles: DashMap<ShuffleId, Arc<ShuffleMeta>>,
}

impl App {
    pub fn remote_storage(&self) -> &RemoteStorageInfo {
        &self.remote_storage
    }

    fn touch(&self) {
        *self.last_heartbeat.lock().expect("heartbeat poisoned") = Instant::now();
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.last_heartbeat
            .lock()
            .expect("heartbeat poisoned")
            .elapsed()
            >= ttl
    }
}

/// All applications known to this server.
#[derive(Debug)]
pub struct AppRegistry {
    apps: DashMap<AppId, Arc<App>>,
    ttl: Duration,
}

impl AppRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            apps: DashMap::new(),
            ttl,
        }
    }

    pub fn app_count(&self) -> u64 {
        self.apps.len() as u64
    }

    /// Registers a shuffle, creating the app on first contact.
    ///
    /// Shuffles are immutable after registration: re-registering an
    /// existing shuffle is a no-op (idempotent retries).
    pub fn register_shuffle(
        &self,
        app_id: AppId,
        shuffle_id: ShuffleId,
        ranges: Vec<PartitionRange>,
        remote_storage: RemoteStorageInfo,
    ) -> Arc<ShuffleMeta> {
        let app = self
            .apps
            .entry(app_id.clone())
            .or_insert_with(|| {
                tracing::info!(app_id = %app_id, "first registration for application");
                Arc::new(App {
                    app_id: app_id.clone(),
                    remote_storage,
                    last_heartbeat: Mutex::new(Instant::now()),
                    shuffles: DashMap::new(),
                })
            })
            .clone();
        app.touch();

        app.shuffles
            .entry(shuffle_id)
            .or_insert_with(|| {
                tracing::info!(app_id = %app.app_id, shuffle_id = %shuffle_id, "registered shuffle");
                Arc::new(ShuffleMeta::new(app.app_id.clone(), shuffle_id, ranges))
            })
            .clone()
    }

    pub fn get_app(&self, app_id: &AppId) -> Option<Arc<App>> {
        self.apps.get(app_id).map(|a| a.clone())
    }

    /// Looks up a registered shuffle.
    pub fn get_shuffle(&self, app_id: &AppId, shuffle_id: ShuffleId) -> ServerResult<Arc<ShuffleMeta>> {
        self.apps
            .get(app_id)
            .and_then(|app| app.shuffles.get(&shuffle_id).map(|s| s.clone()))
            .ok_or_else(|| ServerError::NoRegister {
                app_id: app_id.clone(),
                shuffle_id,
            })
    }

    /// Refreshes an app's heartbeat. Unknown apps are ignored (they may
    /// simply not have registered a shuffle here).
    pub fn heartbeat(&self, app_id: &AppId) {
        if let Some(app) = self.apps.get(app_id) {
            app.touch();
        }
    }

    /// Tombstones and removes apps past their TTL, returning their IDs.
    pub fn evict_expired(&self) -> Vec<AppId> {
        let mut expired = Vec::new();
        self.apps.retain(|app_id, app| {
            if app.expired(self.ttl) {
                for shuffle in app.shuffles.iter() {
                    shuffle.tombstone();
                }
                expired.push(app_id.clone());
                false
            } else {
                true
            }
        });
        for app_id in &expired {
            tracing::warn!(app_id = %app_id, "tombstoned application after heartbeat timeout");
        }
        expired
    }
}
