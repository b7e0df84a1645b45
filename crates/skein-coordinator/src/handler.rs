//! RPC dispatch for the coordinator.

use std::sync::Arc;
use std::time::Duration;

use skein_types::StatusCode;
use skein_wire::{Request, RequestPayload, Response, ResponsePayload, RpcHandler};

use crate::CoordinatorError;
use crate::access::{AccessDecision, AccessInfo, AccessManager};
use crate::apps::AppManager;
use crate::assignment;
use crate::conf::{ClientConfManager, RemoteStorageSelector};
use crate::config::CoordinatorConfig;
use crate::registry::ServerRegistry;

/// Routes coordinator RPCs to the owning subsystem.
pub struct CoordinatorHandler {
    registry: Arc<ServerRegistry>,
    apps: Arc<AppManager>,
    access: AccessManager,
    client_conf: ClientConfManager,
    remote_storage: Arc<RemoteStorageSelector>,
    cleanup_interval: Duration,
}

impl CoordinatorHandler {
    /// Assembles all subsystems from a validated config.
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let registry = Arc::new(ServerRegistry::new(Duration::from_secs(
            config.heartbeat.server_timeout_secs,
        )));
        let access = AccessManager::from_config(&config.access, Arc::clone(&registry))?;
        Ok(Self {
            registry,
            apps: Arc::new(AppManager::new(Duration::from_secs(
                config.heartbeat.app_ttl_secs,
            ))),
            access,
            client_conf: ClientConfManager::new(
                config.client_conf_path.clone(),
                Duration::from_secs(config.access.refresh_interval_secs),
            ),
            remote_storage: Arc::new(RemoteStorageSelector::new(
                config.remote_storage.paths.clone(),
                config.remote_storage.conf.clone(),
            )),
            cleanup_interval: Duration::from_secs(config.heartbeat.cleanup_interval_secs),
        })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Spawns the registry and app eviction sweeps.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.registry.spawn_cleaner(self.cleanup_interval),
            self.apps
                .spawn_cleaner(Arc::clone(&self.remote_storage), self.cleanup_interval),
        ]
    }
}

impl RpcHandler for CoordinatorHandler {
    async fn handle(&self, request: Request) -> Response {
        let id = request.id;
        match request.payload {
            RequestPayload::GetShuffleAssignments {
                app_id,
                shuffle_id,
                partition_num,
                partition_num_per_range,
                replica,
                required_tags,
            } => {
                self.apps.heartbeat(&app_id);
                let candidates = self.registry.candidates(&required_tags);
                match assignment::assign(
                    candidates,
                    partition_num,
                    partition_num_per_range,
                    replica,
                ) {
                    Ok(assignments) => {
                        crate::metrics::ASSIGNMENTS_TOTAL.inc();
                        tracing::info!(
                            app_id = %app_id,
                            shuffle_id = %shuffle_id,
                            partition_num = partition_num,
                            replica = replica,
                            "served shuffle assignments"
                        );
                        Response::success(
                            id,
                            ResponsePayload::ShuffleAssignments {
                                partition_to_servers: assignments.partition_to_servers,
                                server_to_ranges: assignments.server_to_ranges,
                            },
                        )
                    }
                    Err(e) => Response::status(id, StatusCode::InvalidRequest, e.to_string()),
                }
            }

            RequestPayload::AccessCluster { access_id, tags } => {
                match self.access.check(&AccessInfo { access_id, tags }) {
                    AccessDecision::Granted => Response::success(id, ResponsePayload::None),
                    AccessDecision::Denied { message } => {
                        Response::status(id, StatusCode::AccessDenied, message)
                    }
                }
            }

            RequestPayload::FetchClientConf => Response::success(
                id,
                ResponsePayload::ClientConf {
                    conf: self.client_conf.fetch(),
                },
            ),

            RequestPayload::FetchRemoteStorage { app_id } => Response::success(
                id,
                ResponsePayload::RemoteStorage {
                    info: self.remote_storage.select(&app_id),
                },
            ),

            RequestPayload::AppHeartbeat { app_id } => {
                self.apps.heartbeat(&app_id);
                Response::success(id, ResponsePayload::None)
            }

            RequestPayload::ServerHeartbeat { info, stats } => {
                self.registry.heartbeat(info, stats);
                Response::success(id, ResponsePayload::None)
            }

            other => Response::status(
                id,
                StatusCode::InvalidRequest,
                format!("not a coordinator verb: {other:?}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::{AppId, ShuffleId, ShuffleServerInfo};
    use skein_wire::{RequestId, ServerLoadStats};
    use std::collections::BTreeSet;

    fn handler() -> CoordinatorHandler {
        CoordinatorHandler::from_config(&CoordinatorConfig::default()).unwrap()
    }

    fn request(payload: RequestPayload) -> Request {
        Request::new(RequestId(1), payload)
    }

    #[tokio::test]
    async fn assignments_need_enough_servers() {
        let handler = handler();
        let response = handler
            .handle(request(RequestPayload::GetShuffleAssignments {
                app_id: AppId::from("app-h"),
                shuffle_id: ShuffleId::new(0),
                partition_num: 4,
                partition_num_per_range: 2,
                replica: 2,
                required_tags: BTreeSet::new(),
            }))
            .await;
        assert_eq!(response.status, StatusCode::InvalidRequest);
        assert!(response.message.contains("insufficient servers"));
    }

    #[tokio::test]
    async fn assignments_after_heartbeats() {
        let handler = handler();
        for host in ["a", "b"] {
            handler
                .handle(request(RequestPayload::ServerHeartbeat {
                    info: ShuffleServerInfo::new(host, 19999),
                    stats: ServerLoadStats::default(),
                }))
                .await;
        }

        let response = handler
            .handle(request(RequestPayload::GetShuffleAssignments {
                app_id: AppId::from("app-h"),
                shuffle_id: ShuffleId::new(0),
                partition_num: 4,
                partition_num_per_range: 2,
                replica: 2,
                required_tags: BTreeSet::new(),
            }))
            .await;
        assert!(response.is_success());
        match response.payload {
            ResponsePayload::ShuffleAssignments {
                partition_to_servers,
                server_to_ranges,
            } => {
                assert_eq!(partition_to_servers.len(), 4);
                assert_eq!(server_to_ranges.len(), 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_verbs_are_rejected() {
        let handler = handler();
        let response = handler
            .handle(request(RequestPayload::SendCommit {
                app_id: AppId::from("app-h"),
                shuffle_id: ShuffleId::new(0),
            }))
            .await;
        assert_eq!(response.status, StatusCode::InvalidRequest);
    }
}
