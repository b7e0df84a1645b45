//! Engine-linked client for the Skein remote shuffle service.
//!
//! One shuffle lifecycle through this crate:
//!
//! 1. [`CoordinatorClient::access_cluster`] - admission.
//! 2. [`CoordinatorClient::fetch_client_conf`] +
//!    [`config::ClientConfigBuilder::build_with_dynamic`] - config
//!    overlay (explicit > dynamic > default), applied once at startup.
//! 3. [`CoordinatorClient::get_shuffle_assignments`] - placement.
//! 4. [`ShuffleWriteClient::register_shuffle`] - register on every
//!    assigned server.
//! 5. Map tasks: [`ShuffleWriteClient::send_shuffle_data`] (two-round
//!    quorum) and [`ShuffleWriteClient::report_shuffle_result`].
//! 6. [`ShuffleWriteClient::wait_commit_and_finish`] - commit barrier,
//!    then the shuffle turns readable.
//! 7. Reduce tasks: [`ShuffleReadClient::get_shuffle_result`] and
//!    [`ShuffleReadClient::read_partition`].
//!
//! An [`AppHeartbeater`] keeps the app alive on every coordinator and
//! server so orphaned state is garbage-collected only after real
//! failures.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod read;
pub mod transport;
pub mod write;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use coordinator::{AccessOutcome, CoordinatorClient, ShuffleAssignments};
pub use error::{ClientError, ClientResult};
pub use heartbeat::AppHeartbeater;
pub use read::{ReadBlock, ShuffleReadClient};
pub use transport::{ServerTransport, TcpTransport, TransportPool};
pub use write::{BlockSendSpec, SendResult, ShuffleWriteClient};
