//! Full shuffle lifecycle against the assembled server handler.

use std::time::Duration;

use bytes::Bytes;
use skein_server::config::{HeartbeatConfig, ServerConfig, StorageConfig};
use skein_server::ShuffleServerHandler;
use skein_types::{
    AppId, BlockId, BlockIdBitmap, IndexRecord, PartitionId, PartitionRange, RemoteStorageInfo,
    ShuffleBlock, ShuffleId, StatusCode, StorageType,
};
use skein_wire::{
    PartitionedData, Request, RequestId, RequestPayload, ResponsePayload, RpcHandler, ShuffleData,
};
use std::sync::Arc;

fn test_handler(tmp: &tempfile::TempDir) -> Arc<ShuffleServerHandler> {
    let config = ServerConfig {
        bind: "127.0.0.1:19999".to_string(),
        storage: StorageConfig {
            kind: StorageType::MemoryLocalfile,
            base_path: tmp.path().to_path_buf(),
            disk_capacity: 1 << 30,
            ..StorageConfig::default()
        },
        ..ServerConfig::default()
    };
    Arc::new(ShuffleServerHandler::from_config(&config).unwrap())
}

fn request(payload: RequestPayload) -> Request {
    Request::new(RequestId(1), payload)
}

fn app() -> AppId {
    AppId::from("app-lifecycle")
}

fn block(seq: u64, partition: u32, payload: &'static [u8]) -> ShuffleBlock {
    ShuffleBlock::new(
        BlockId::new(seq, PartitionId::new(partition), 1),
        payload.len() as u32,
        Bytes::from_static(payload),
    )
}

fn send_request(blocks_by_partition: Vec<(u32, Vec<ShuffleBlock>)>) -> Request {
    request(RequestPayload::SendShuffleData {
        app_id: app(),
        data: vec![ShuffleData {
            shuffle_id: ShuffleId::new(0),
            partitions: blocks_by_partition
                .into_iter()
                .map(|(partition, blocks)| PartitionedData {
                    partition_id: PartitionId::new(partition),
                    blocks,
                })
                .collect(),
        }],
    })
}

async fn register(handler: &ShuffleServerHandler) {
    let response = handler
        .handle(request(RequestPayload::RegisterShuffle {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
            ranges: vec![PartitionRange::new(0, 2), PartitionRange::new(2, 4)],
            remote_storage: RemoteStorageInfo::default(),
        }))
        .await;
    assert!(response.is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn write_commit_finish_read_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = test_handler(&tmp);
    let _background = handler.spawn_background();

    register(&handler).await;

    // Two partitions in different ranges, two blocks each.
    let sent = vec![
        (0u32, vec![block(0, 0, b"part0-a"), block(1, 0, b"part0-b")]),
        (3u32, vec![block(0, 3, b"part3-a"), block(1, 3, b"part3-b")]),
    ];
    let response = handler.handle(send_request(sent.clone())).await;
    assert!(response.is_success(), "{}", response.message);

    // Report the block IDs reducers should expect.
    let report: Vec<(PartitionId, Vec<BlockId>)> = sent
        .iter()
        .map(|(partition, blocks)| {
            (
                PartitionId::new(*partition),
                blocks.iter().map(|b| b.block_id).collect(),
            )
        })
        .collect();
    let response = handler
        .handle(request(RequestPayload::ReportShuffleResult {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
            task_attempt_id: 1,
            partition_to_block_ids: report,
        }))
        .await;
    assert!(response.is_success());

    // Data reads before finish hit the state machine.
    let response = handler
        .handle(request(RequestPayload::GetShuffleData {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
            partition_id: PartitionId::new(0),
            offset: 0,
            length: 1024,
        }))
        .await;
    assert_eq!(response.status, StatusCode::StateUnexpected);

    // Commit: flush + drain barrier, count reaches 1.
    let response = handler
        .handle(request(RequestPayload::SendCommit {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
        }))
        .await;
    assert!(response.is_success(), "{}", response.message);
    assert!(matches!(
        response.payload,
        ResponsePayload::CommitCount { count: 1 }
    ));

    let response = handler
        .handle(request(RequestPayload::FinishShuffle {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
        }))
        .await;
    assert!(response.is_success());

    // Writes after finish are rejected.
    let response = handler
        .handle(send_request(vec![(0, vec![block(9, 0, b"late")])]))
        .await;
    assert_eq!(response.status, StatusCode::StateUnexpected);

    // Reconstruct each partition from bitmap + index + data.
    for (partition, blocks) in sent {
        let partition_id = PartitionId::new(partition);

        let response = handler
            .handle(request(RequestPayload::GetShuffleResult {
                app_id: app(),
                shuffle_id: ShuffleId::new(0),
                partition_id,
            }))
            .await;
        let ResponsePayload::ShuffleResult { bitmap } = response.payload else {
            panic!("expected bitmap");
        };
        let bitmap = BlockIdBitmap::from_bytes(&bitmap).unwrap();
        assert_eq!(bitmap.len(), blocks.len() as u64);

        let response = handler
            .handle(request(RequestPayload::GetShuffleIndex {
                app_id: app(),
                shuffle_id: ShuffleId::new(0),
                partition_id,
            }))
            .await;
        assert!(response.is_success());
        let ResponsePayload::ShuffleIndex { index, data_len } = response.payload else {
            panic!("expected index");
        };
        let records = IndexRecord::parse_all(&index).unwrap();
        assert_eq!(records.len(), blocks.len());

        let response = handler
            .handle(request(RequestPayload::GetShuffleData {
                app_id: app(),
                shuffle_id: ShuffleId::new(0),
                partition_id,
                offset: 0,
                length: data_len,
            }))
            .await;
        let ResponsePayload::ShuffleData { data } = response.payload else {
            panic!("expected data");
        };

        for (record, original) in records.iter().zip(&blocks) {
            assert!(bitmap.contains(record.block_id));
            let start = record.offset as usize;
            let stop = start + record.length as usize;
            assert_eq!(&data[start..stop], &original.data[..]);
        }
    }

    handler.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_without_registration_get_no_register() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = test_handler(&tmp);

    let response = handler
        .handle(request(RequestPayload::SendCommit {
            app_id: app(),
            shuffle_id: ShuffleId::new(7),
        }))
        .await;
    assert_eq!(response.status, StatusCode::NoRegister);
}

#[tokio::test(flavor = "multi_thread")]
async fn blocks_outside_registered_ranges_are_invalid() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = test_handler(&tmp);
    register(&handler).await;

    let response = handler
        .handle(send_request(vec![(9, vec![block(0, 9, b"lost")])]))
        .await;
    assert_eq!(response.status, StatusCode::InvalidRequest);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_apps_are_purged_without_touching_others() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind: "127.0.0.1:19999".to_string(),
        storage: StorageConfig {
            kind: StorageType::MemoryLocalfile,
            base_path: tmp.path().to_path_buf(),
            disk_capacity: 1 << 30,
            ..StorageConfig::default()
        },
        heartbeat: HeartbeatConfig {
            app_ttl_secs: 0,
            cleanup_interval_secs: 1,
            ..HeartbeatConfig::default()
        },
        ..ServerConfig::default()
    };
    let handler = Arc::new(ShuffleServerHandler::from_config(&config).unwrap());
    let _background = handler.spawn_background();

    register(&handler).await;
    handler
        .handle(send_request(vec![(0, vec![block(0, 0, b"doomed")])]))
        .await;

    // TTL of zero: the next GC sweep tombstones and purges the app.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let response = handler
        .handle(request(RequestPayload::SendCommit {
            app_id: app(),
            shuffle_id: ShuffleId::new(0),
        }))
        .await;
    assert_eq!(response.status, StatusCode::NoRegister);

    handler.shutdown();
}
