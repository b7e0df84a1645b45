//! One complete shuffle over real sockets: coordinator placement,
//! replicated writes, commit barrier, quorum reads.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use skein_client::{
    AppHeartbeater, BlockSendSpec, ClientConfigBuilder, CoordinatorClient, ShuffleReadClient,
    ShuffleWriteClient, TcpTransport, TransportPool,
};
use skein_coordinator::{CoordinatorConfig, CoordinatorHandler};
use skein_server::config::{ServerConfig, StorageConfig};
use skein_server::ShuffleServerHandler;
use skein_types::{AppId, BlockId, PartitionId, ShuffleBlock, ShuffleId, StorageType};
use skein_wire::{RequestPayload, RpcClient};
use tokio::net::TcpListener;

async fn spawn_coordinator() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(CoordinatorHandler::from_config(&CoordinatorConfig::default()).unwrap());
    tokio::spawn(skein_wire::serve(listener, handler));
    addr
}

async fn spawn_server(tmp: &tempfile::TempDir, name: &str) -> (String, Arc<ShuffleServerHandler>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind: addr.to_string(),
        storage: StorageConfig {
            kind: StorageType::MemoryLocalfile,
            base_path: tmp.path().join(name),
            disk_capacity: 1 << 30,
            ..StorageConfig::default()
        },
        ..ServerConfig::default()
    };
    let handler = Arc::new(ShuffleServerHandler::from_config(&config).unwrap());
    let _background = handler.spawn_background();
    tokio::spawn(skein_wire::serve(listener, Arc::clone(&handler)));
    (addr.to_string(), handler)
}

/// Announces a server to the coordinator the way its heartbeat loop would.
async fn heartbeat_to_coordinator(coordinator: &str, server: &Arc<ShuffleServerHandler>) {
    let client = RpcClient::new(coordinator.to_string(), Duration::from_secs(5));
    let response = client
        .call(RequestPayload::ServerHeartbeat {
            info: server.info().clone(),
            stats: server.load_stats(),
        })
        .await
        .unwrap();
    assert!(response.is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn shuffle_round_trip_over_tcp() {
    let tmp = tempfile::tempdir().unwrap();
    let coordinator_addr = spawn_coordinator().await;
    let (_addr_a, server_a) = spawn_server(&tmp, "server-a").await;
    let (_addr_b, server_b) = spawn_server(&tmp, "server-b").await;
    heartbeat_to_coordinator(&coordinator_addr, &server_a).await;
    heartbeat_to_coordinator(&coordinator_addr, &server_b).await;

    let app_id = AppId::from("app-e2e");
    let shuffle_id = ShuffleId::new(0);

    // Dynamic conf overlay (empty here) still goes through the real path.
    let bootstrap = ClientConfigBuilder::new().build().unwrap();
    let coordinator = Arc::new(CoordinatorClient::new(
        std::slice::from_ref(&coordinator_addr),
        &bootstrap,
    ));

    let access = coordinator
        .access_cluster("app-e2e", BTreeSet::new())
        .await
        .unwrap();
    assert!(access.granted, "{}", access.message);

    let dynamic = coordinator.fetch_client_conf().await.unwrap();
    let config = ClientConfigBuilder::new()
        .replica(2)
        .replica_write(2)
        .replica_read(1)
        .rpc_timeout(Duration::from_secs(10))
        .retry_max(1)
        .build_with_dynamic(&dynamic)
        .unwrap();

    let assignments = coordinator
        .get_shuffle_assignments(&app_id, shuffle_id, 4, 2, config.replica, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(assignments.partition_to_servers.len(), 4);
    for (_, servers) in &assignments.partition_to_servers {
        assert_eq!(servers.len(), 2);
    }

    let pool = Arc::new(TransportPool::<TcpTransport>::new());
    pool.register_servers(&assignments.all_servers(), config.rpc_timeout);

    let remote_storage = coordinator.fetch_remote_storage(&app_id).await.unwrap();
    let writer = ShuffleWriteClient::new(config.clone(), Arc::clone(&pool));
    writer
        .register_shuffle(&app_id, shuffle_id, &assignments, &remote_storage)
        .await
        .unwrap();

    // Three blocks per partition across four partitions.
    let mut specs = Vec::new();
    let mut sent_ids: Vec<(PartitionId, Vec<BlockId>)> = Vec::new();
    for partition in 0..4u32 {
        let partition_id = PartitionId::new(partition);
        let servers = assignments.servers_for(partition_id).unwrap().to_vec();
        let mut ids = Vec::new();
        for seq in 0..3u64 {
            let payload = Bytes::from(format!("partition-{partition}-block-{seq}"));
            let block = ShuffleBlock::new(
                BlockId::new(seq, partition_id, 1),
                payload.len() as u32,
                payload,
            );
            ids.push(block.block_id);
            specs.push(BlockSendSpec {
                shuffle_id,
                partition_id,
                block,
                servers: servers.clone(),
            });
        }
        sent_ids.push((partition_id, ids));
    }

    let result = writer.send_shuffle_data(&app_id, specs).await;
    assert_eq!(result.success.len(), 12, "failed: {:?}", result.failed);
    assert!(result.failed.is_empty());

    writer
        .report_shuffle_result(&app_id, shuffle_id, 1, sent_ids.clone(), &assignments)
        .await
        .unwrap();

    // A heartbeat fan-out keeps the app alive on every plane.
    let heartbeater = AppHeartbeater::new(
        app_id.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&pool),
        Duration::from_secs(10),
        Duration::from_secs(5),
    );
    heartbeater.beat_once().await;

    writer
        .wait_commit_and_finish(&app_id, shuffle_id, &assignments.all_servers(), 1)
        .await
        .unwrap();

    // Reduce side: every partition reconstructs exactly what was sent.
    let reader = ShuffleReadClient::new(config, pool);
    for (partition_id, ids) in sent_ids {
        let servers = assignments.servers_for(partition_id).unwrap();
        let blocks = reader
            .read_partition(&app_id, shuffle_id, partition_id, servers)
            .await
            .unwrap();

        let got: HashSet<BlockId> = blocks.iter().map(|b| b.block_id).collect();
        let expected: HashSet<BlockId> = ids.into_iter().collect();
        assert_eq!(got, expected);

        for block in blocks {
            let seq = block.block_id.sequence_no();
            let partition = block.block_id.partition_id().as_u32();
            assert_eq!(
                block.data,
                Bytes::from(format!("partition-{partition}-block-{seq}"))
            );
        }
    }

    server_a.shutdown();
    server_b.shutdown();
}
