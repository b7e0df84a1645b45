//! App heartbeats to every coordinator and shuffle server.
//!
//! Heartbeats fan out in parallel under a wall-clock deadline; calls
//! still in flight when the deadline expires are aborted. A missed
//! heartbeat is harmless as long as the next one lands inside the
//! server-side TTL.

use std::sync::Arc;
use std::time::Duration;

use skein_types::AppId;
use skein_wire::RequestPayload;
use tokio::task::JoinSet;

use crate::coordinator::CoordinatorClient;
use crate::transport::{ServerTransport, TransportPool};

/// Keeps one app alive on the control and data planes.
pub struct AppHeartbeater<T: ServerTransport> {
    app_id: AppId,
    coordinators: Arc<CoordinatorClient>,
    pool: Arc<TransportPool<T>>,
    interval: Duration,
    deadline: Duration,
}

impl<T: ServerTransport> AppHeartbeater<T> {
    pub fn new(
        app_id: AppId,
        coordinators: Arc<CoordinatorClient>,
        pool: Arc<TransportPool<T>>,
        interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            app_id,
            coordinators,
            pool,
            interval,
            deadline,
        }
    }

    /// One parallel fan-out to every known target.
    pub async fn beat_once(&self) {
        let mut calls: JoinSet<()> = JoinSet::new();

        for client in self.coordinators.clients() {
            let client = Arc::clone(client);
            let app_id = self.app_id.clone();
            calls.spawn(async move {
                if let Err(e) = client
                    .call(RequestPayload::AppHeartbeat { app_id })
                    .await
                {
                    tracing::debug!(coordinator = client.addr(), error = %e, "app heartbeat failed");
                }
            });
        }
        for transport in self.pool.all() {
            let app_id = self.app_id.clone();
            calls.spawn(async move {
                if let Err(e) = transport
                    .call(
                        RequestPayload::AppHeartbeat { app_id },
                        0,
                        Duration::ZERO,
                    )
                    .await
                {
                    tracing::debug!(server_id = %transport.server_id(), error = %e, "app heartbeat failed");
                }
            });
        }

        let drained = tokio::time::timeout(self.deadline, async {
            while calls.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // Cancel stragglers; the next tick will try again.
            calls.abort_all();
            tracing::warn!(
                app_id = %self.app_id,
                deadline_ms = self.deadline.as_millis() as u64,
                "heartbeat deadline expired, cancelled in-flight calls"
            );
        }
    }

    /// Spawns the periodic heartbeat loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.beat_once().await;
            }
        })
    }
}
