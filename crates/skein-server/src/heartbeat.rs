//! Load reporting to the coordinators.

use std::sync::Arc;
use std::time::Duration;

use skein_wire::{RequestPayload, RpcClient};
use tokio::task::JoinSet;

use crate::handler::ShuffleServerHandler;

/// Deadline for one heartbeat RPC.
const HEARTBEAT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically reports this server's load to every coordinator.
pub struct Heartbeater {
    clients: Vec<Arc<RpcClient>>,
    handler: Arc<ShuffleServerHandler>,
    interval: Duration,
}

impl Heartbeater {
    pub fn new(
        coordinators: &[String],
        handler: Arc<ShuffleServerHandler>,
        interval: Duration,
    ) -> Self {
        Self {
            clients: coordinators
                .iter()
                .map(|addr| Arc::new(RpcClient::new(addr.clone(), HEARTBEAT_RPC_TIMEOUT)))
                .collect(),
            handler,
            interval,
        }
    }

    /// Spawns the reporting loop. Coordinators are contacted in parallel
    /// each tick; failures are logged and retried next tick.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let stats = self.handler.load_stats();
                let info = self.handler.info().clone();

                let mut calls = JoinSet::new();
                for client in &self.clients {
                    let client = Arc::clone(client);
                    let info = info.clone();
                    calls.spawn(async move {
                        let addr = client.addr().to_string();
                        let result = client
                            .call(RequestPayload::ServerHeartbeat { info, stats })
                            .await;
                        (addr, result)
                    });
                }
                while let Some(joined) = calls.join_next().await {
                    match joined {
                        Ok((_, Ok(response))) if response.is_success() => {}
                        Ok((addr, Ok(response))) => {
                            tracing::warn!(
                                coordinator = %addr,
                                status = %response.status,
                                "coordinator rejected heartbeat"
                            );
                        }
                        Ok((addr, Err(e))) => {
                            tracing::debug!(coordinator = %addr, error = %e, "heartbeat failed");
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "heartbeat task failed");
                        }
                    }
                }
            }
        })
    }
}
