//! Skein coordinator: the control plane.
//!
//! The coordinator is soft-state: everything it knows is rebuilt from
//! server heartbeats after a restart. It owns
//! - the live-server registry ([`registry::ServerRegistry`]),
//! - partition-range placement ([`assignment`]),
//! - the admission pipeline ([`access::AccessManager`]),
//! - dynamic client configuration and remote-storage selection
//!   ([`conf`]),
//! - application lifecycles ([`apps::AppManager`]).
//!
//! Clients and servers consult it exclusively through RPCs; nothing else
//! mutates its state.

pub mod access;
pub mod apps;
pub mod assignment;
pub mod config;
pub mod conf;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;

pub use config::CoordinatorConfig;
pub use error::CoordinatorError;
pub use handler::CoordinatorHandler;
