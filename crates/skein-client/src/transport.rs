//! Transport seam between the client and the shuffle servers.
//!
//! The write/read paths are generic over [`ServerTransport`] so the
//! quorum machinery can be exercised against scripted fakes; production
//! code uses [`TcpTransport`] over the framed wire protocol.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

use skein_types::{ServerId, ShuffleServerInfo};
use skein_wire::{RequestPayload, Response, RpcClient, WireError};

/// One logical connection to a shuffle server.
pub trait ServerTransport: Send + Sync + 'static {
    /// The server this transport reaches.
    fn server_id(&self) -> &ServerId;

    /// One request/response exchange with RPC-layer retries.
    fn call(
        &self,
        payload: RequestPayload,
        retry_max: u32,
        retry_interval_max: Duration,
    ) -> impl Future<Output = Result<Response, WireError>> + Send;
}

/// TCP transport over the framed wire protocol.
#[derive(Debug)]
pub struct TcpTransport {
    id: ServerId,
    client: RpcClient,
}

impl TcpTransport {
    pub fn new(info: &ShuffleServerInfo, rpc_timeout: Duration) -> Self {
        Self {
            id: info.id.clone(),
            client: RpcClient::new(info.addr(), rpc_timeout),
        }
    }
}

impl ServerTransport for TcpTransport {
    fn server_id(&self) -> &ServerId {
        &self.id
    }

    async fn call(
        &self,
        payload: RequestPayload,
        retry_max: u32,
        retry_interval_max: Duration,
    ) -> Result<Response, WireError> {
        self.client
            .call_with_retry(payload, retry_max, retry_interval_max)
            .await
    }
}

/// Registry of transports keyed by server ID.
///
/// Shared by the write client, read client, and heartbeater; transports
/// register lazily as assignments arrive.
#[derive(Debug)]
pub struct TransportPool<T: ServerTransport> {
    transports: RwLock<HashMap<ServerId, Arc<T>>>,
}

impl<T: ServerTransport> Default for TransportPool<T> {
    fn default() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: ServerTransport> TransportPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport, keeping an existing one if present.
    pub fn register(&self, transport: T) {
        let mut transports = self.transports.write().expect("transport pool poisoned");
        transports
            .entry(transport.server_id().clone())
            .or_insert_with(|| Arc::new(transport));
    }

    pub fn get(&self, server_id: &ServerId) -> Option<Arc<T>> {
        self.transports
            .read()
            .expect("transport pool poisoned")
            .get(server_id)
            .cloned()
    }

    /// Every registered transport.
    pub fn all(&self) -> Vec<Arc<T>> {
        self.transports
            .read()
            .expect("transport pool poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Registers TCP transports for every server in an assignment.
impl TransportPool<TcpTransport> {
    pub fn register_servers(&self, servers: &[ShuffleServerInfo], rpc_timeout: Duration) {
        for info in servers {
            self.register(TcpTransport::new(info, rpc_timeout));
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted server fakes for quorum tests.

    use super::*;
    use bytes::{Bytes, BytesMut};
    use skein_types::{BlockId, BlockIdBitmap, IndexRecord, ShuffleBlock, StatusCode};
    use skein_wire::ResponsePayload;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// A fake server that records what it was sent.
    pub struct MockTransport {
        id: ServerId,
        /// When set, every data send fails with INTERNAL_ERROR.
        pub fail_sends: AtomicBool,
        /// Block IDs acknowledged by this server, in arrival order.
        pub acked_blocks: Mutex<Vec<BlockId>>,
        /// Number of send calls observed.
        pub send_calls: AtomicU32,
        /// Bitmap served on `GetShuffleResult`.
        pub result_bitmap: Mutex<BlockIdBitmap>,
        /// When set, result reads fail.
        pub fail_results: AtomicBool,
        /// Index records served on `GetShuffleIndex`.
        pub index: Mutex<Vec<u8>>,
        /// Data stream served on `GetShuffleData`.
        pub data: Mutex<Vec<u8>>,
        /// When set, served data bytes are flipped so CRCs fail.
        pub corrupt_data: AtomicBool,
    }

    impl MockTransport {
        pub fn new(name: &str) -> Self {
            Self {
                id: ServerId::new(name),
                fail_sends: AtomicBool::new(false),
                acked_blocks: Mutex::new(Vec::new()),
                send_calls: AtomicU32::new(0),
                result_bitmap: Mutex::new(BlockIdBitmap::new()),
                fail_results: AtomicBool::new(false),
                index: Mutex::new(Vec::new()),
                data: Mutex::new(Vec::new()),
                corrupt_data: AtomicBool::new(false),
            }
        }

        pub fn acked(&self) -> Vec<BlockId> {
            self.acked_blocks.lock().unwrap().clone()
        }

        /// Stores blocks as the index/data pair a real server would
        /// serve, and reports them in the result bitmap.
        pub fn load_partition(&self, blocks: &[ShuffleBlock]) {
            let mut index = self.index.lock().unwrap();
            let mut data = self.data.lock().unwrap();
            let mut bitmap = self.result_bitmap.lock().unwrap();
            let mut offset = data.len() as u64;
            for block in blocks {
                let mut record = BytesMut::new();
                IndexRecord::for_block(block, offset).write_to(&mut record);
                index.extend_from_slice(&record);
                data.extend_from_slice(&block.data);
                offset += u64::from(block.length);
                bitmap.insert(block.block_id);
            }
        }
    }

    impl ServerTransport for MockTransport {
        fn server_id(&self) -> &ServerId {
            &self.id
        }

        async fn call(
            &self,
            payload: RequestPayload,
            _retry_max: u32,
            _retry_interval_max: Duration,
        ) -> Result<Response, WireError> {
            use skein_wire::RequestId;
            let id = RequestId(0);
            let response = match payload {
                RequestPayload::SendShuffleData { data, .. } => {
                    self.send_calls.fetch_add(1, Ordering::SeqCst);
                    if self.fail_sends.load(Ordering::SeqCst) {
                        Response::status(id, StatusCode::InternalError, "scripted failure")
                    } else {
                        let mut acked = self.acked_blocks.lock().unwrap();
                        for shuffle in data {
                            for partition in shuffle.partitions {
                                for block in partition.blocks {
                                    acked.push(block.block_id);
                                }
                            }
                        }
                        Response::success(id, ResponsePayload::None)
                    }
                }
                RequestPayload::ReportShuffleResult {
                    partition_to_block_ids,
                    ..
                } => {
                    let mut bitmap = self.result_bitmap.lock().unwrap();
                    for (_, ids) in partition_to_block_ids {
                        for block_id in ids {
                            bitmap.insert(block_id);
                        }
                    }
                    Response::success(id, ResponsePayload::None)
                }
                RequestPayload::GetShuffleResult { .. } => {
                    if self.fail_results.load(Ordering::SeqCst) {
                        Response::status(id, StatusCode::InternalError, "scripted failure")
                    } else {
                        Response::success(
                            id,
                            ResponsePayload::ShuffleResult {
                                bitmap: self.result_bitmap.lock().unwrap().to_bytes(),
                            },
                        )
                    }
                }
                RequestPayload::GetShuffleIndex { .. } => {
                    let index = self.index.lock().unwrap().clone();
                    let data_len = self.data.lock().unwrap().len() as u64;
                    Response::success(
                        id,
                        ResponsePayload::ShuffleIndex {
                            index: Bytes::from(index),
                            data_len,
                        },
                    )
                }
                RequestPayload::GetShuffleData { offset, length, .. } => {
                    let data = self.data.lock().unwrap();
                    let start = (offset as usize).min(data.len());
                    let stop = ((offset + length) as usize).min(data.len());
                    let mut slice = data[start..stop].to_vec();
                    if self.corrupt_data.load(Ordering::SeqCst) {
                        for byte in &mut slice {
                            *byte ^= 0xFF;
                        }
                    }
                    Response::success(
                        id,
                        ResponsePayload::ShuffleData {
                            data: Bytes::from(slice),
                        },
                    )
                }
                RequestPayload::RegisterShuffle { .. }
                | RequestPayload::FinishShuffle { .. }
                | RequestPayload::AppHeartbeat { .. } => {
                    Response::success(id, ResponsePayload::None)
                }
                RequestPayload::SendCommit { .. } => {
                    Response::success(id, ResponsePayload::CommitCount { count: 1 })
                }
                _ => Response::status(id, StatusCode::InvalidRequest, "unsupported by mock"),
            };
            Ok(response)
        }
    }
}
