//! Coordinator client with failover across the coordinator list.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use skein_types::{
    AppId, PartitionId, PartitionRange, RemoteStorageInfo, ShuffleId, ShuffleServerInfo,
    StatusCode,
};
use skein_wire::{RequestPayload, Response, ResponsePayload, RpcClient};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// A shuffle placement as returned by the coordinator.
#[derive(Debug, Clone)]
pub struct ShuffleAssignments {
    pub partition_to_servers: Vec<(PartitionId, Vec<ShuffleServerInfo>)>,
    pub server_to_ranges: Vec<(ShuffleServerInfo, Vec<PartitionRange>)>,
}

impl ShuffleAssignments {
    /// Every distinct server participating in the assignment.
    pub fn all_servers(&self) -> Vec<ShuffleServerInfo> {
        self.server_to_ranges
            .iter()
            .map(|(server, _)| server.clone())
            .collect()
    }

    /// The ordered replica list for one partition.
    pub fn servers_for(&self, partition: PartitionId) -> Option<&[ShuffleServerInfo]> {
        self.partition_to_servers
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, servers)| servers.as_slice())
    }
}

/// Outcome of an `accessCluster` call.
#[derive(Debug, Clone)]
pub struct AccessOutcome {
    pub granted: bool,
    /// `SUCCESS` or `Denied by <CheckerName>: <reason>`.
    pub message: String,
}

/// Talks to any coordinator in the configured list, failing over on
/// transport faults. Application-level statuses are returned to the
/// caller, not retried.
pub struct CoordinatorClient {
    clients: Vec<Arc<RpcClient>>,
    retry_max: u32,
    retry_interval_max: Duration,
}

impl CoordinatorClient {
    pub fn new(addrs: &[String], config: &ClientConfig) -> Self {
        Self {
            clients: addrs
                .iter()
                .map(|addr| Arc::new(RpcClient::new(addr.clone(), config.rpc_timeout)))
                .collect(),
            retry_max: config.retry_max,
            retry_interval_max: config.retry_interval_max,
        }
    }

    /// The underlying per-coordinator clients (for heartbeat fan-out).
    pub fn clients(&self) -> &[Arc<RpcClient>] {
        &self.clients
    }

    /// Calls the first coordinator that answers.
    async fn call(&self, payload: RequestPayload) -> ClientResult<Response> {
        let mut last_error = String::from("no coordinators configured");
        for client in &self.clients {
            match client
                .call_with_retry(payload.clone(), self.retry_max, self.retry_interval_max)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        coordinator = client.addr(),
                        error = %e,
                        "coordinator unavailable, trying next"
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(ClientError::CoordinatorsUnavailable {
            attempted: self.clients.len(),
            last: last_error,
        })
    }

    fn reject(response: Response, addr: &str) -> ClientError {
        ClientError::Rpc {
            addr: addr.to_string(),
            status: response.status,
            message: response.message,
        }
    }

    /// Fetches partition placements for a new shuffle.
    pub async fn get_shuffle_assignments(
        &self,
        app_id: &AppId,
        shuffle_id: ShuffleId,
        partition_num: u32,
        partition_num_per_range: u32,
        replica: u32,
        required_tags: BTreeSet<String>,
    ) -> ClientResult<ShuffleAssignments> {
        let response = self
            .call(RequestPayload::GetShuffleAssignments {
                app_id: app_id.clone(),
                shuffle_id,
                partition_num,
                partition_num_per_range,
                replica,
                required_tags,
            })
            .await?;
        match response.payload {
            ResponsePayload::ShuffleAssignments {
                partition_to_servers,
                server_to_ranges,
            } if response.status.is_success() => Ok(ShuffleAssignments {
                partition_to_servers,
                server_to_ranges,
            }),
            _ => Err(Self::reject(response, "coordinator")),
        }
    }

    /// Asks the admission pipeline whether this app may use the cluster.
    pub async fn access_cluster(
        &self,
        access_id: &str,
        tags: BTreeSet<String>,
    ) -> ClientResult<AccessOutcome> {
        let response = self
            .call(RequestPayload::AccessCluster {
                access_id: access_id.to_string(),
                tags,
            })
            .await?;
        match response.status {
            StatusCode::Success => Ok(AccessOutcome {
                granted: true,
                message: response.message,
            }),
            StatusCode::AccessDenied => Ok(AccessOutcome {
                granted: false,
                message: response.message,
            }),
            _ => Err(Self::reject(response, "coordinator")),
        }
    }

    /// Fetches the dynamic client config map.
    pub async fn fetch_client_conf(&self) -> ClientResult<BTreeMap<String, String>> {
        let response = self.call(RequestPayload::FetchClientConf).await?;
        match response.payload {
            ResponsePayload::ClientConf { conf } if response.status.is_success() => Ok(conf),
            _ => Err(Self::reject(response, "coordinator")),
        }
    }

    /// Fetches this app's assigned remote storage.
    pub async fn fetch_remote_storage(&self, app_id: &AppId) -> ClientResult<RemoteStorageInfo> {
        let response = self
            .call(RequestPayload::FetchRemoteStorage {
                app_id: app_id.clone(),
            })
            .await?;
        match response.payload {
            ResponsePayload::RemoteStorage { info } if response.status.is_success() => Ok(info),
            _ => Err(Self::reject(response, "coordinator")),
        }
    }
}
