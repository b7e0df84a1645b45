//! Client configuration with layered resolution.
//!
//! Precedence per knob: an explicit value set by the engine wins over a
//! coordinator-served dynamic value, which wins over the built-in
//! default. The overlay happens once, at client construction.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Dynamic-config keys served by `fetchClientConf`. The dotted spelling
/// travels as opaque strings, so it is shared verbatim with operators.
pub const CONF_REPLICA: &str = "rss.data.replica";
pub const CONF_REPLICA_WRITE: &str = "rss.data.replica.write";
pub const CONF_REPLICA_READ: &str = "rss.data.replica.read";
pub const CONF_REPLICA_SKIP_ENABLED: &str = "rss.data.replica.skip.enabled";
pub const CONF_TRANSFER_POOL_SIZE: &str = "rss.client.data.transfer.pool.size";
pub const CONF_RETRY_MAX: &str = "rss.client.retry.max";
pub const CONF_RETRY_INTERVAL_MAX_MS: &str = "rss.client.retry.interval.max";
pub const CONF_SEND_CHECK_INTERVAL_MS: &str = "rss.client.send.check.interval.ms";
pub const CONF_SEND_CHECK_TIMEOUT_MS: &str = "rss.client.send.check.timeout.ms";
pub const CONF_HEARTBEAT_INTERVAL_S: &str = "rss.heartbeat.interval";

/// Resolved, validated client configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total copies of every block.
    pub replica: u32,
    /// Minimum acks for a block write to succeed.
    pub replica_write: u32,
    /// Minimum distinct servers read to reconstruct a partition.
    pub replica_read: u32,
    /// Skip the secondary replica group when the primary round succeeds.
    pub replica_skip_enabled: bool,
    /// Bounded fan-out width for block transfers.
    pub data_transfer_pool_size: usize,
    /// RPC-layer retry attempts.
    pub retry_max: u32,
    /// Cap on the retry backoff.
    pub retry_interval_max: Duration,
    /// Poll cadence while waiting for commit counts.
    pub send_check_interval: Duration,
    /// Deadline while waiting for commit counts.
    pub send_check_timeout: Duration,
    /// Per-RPC deadline.
    pub rpc_timeout: Duration,
    /// App-heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Wall-clock deadline for one heartbeat fan-out.
    pub heartbeat_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            replica: 1,
            replica_write: 1,
            replica_read: 1,
            replica_skip_enabled: true,
            data_transfer_pool_size: 10,
            retry_max: 3,
            retry_interval_max: Duration::from_secs(2),
            send_check_interval: Duration::from_millis(500),
            send_check_timeout: Duration::from_secs(600),
            rpc_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder tracking which knobs the engine set explicitly.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    replica: Option<u32>,
    replica_write: Option<u32>,
    replica_read: Option<u32>,
    replica_skip_enabled: Option<bool>,
    data_transfer_pool_size: Option<usize>,
    retry_max: Option<u32>,
    retry_interval_max: Option<Duration>,
    send_check_interval: Option<Duration>,
    send_check_timeout: Option<Duration>,
    rpc_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica(mut self, value: u32) -> Self {
        self.replica = Some(value);
        self
    }

    pub fn replica_write(mut self, value: u32) -> Self {
        self.replica_write = Some(value);
        self
    }

    pub fn replica_read(mut self, value: u32) -> Self {
        self.replica_read = Some(value);
        self
    }

    pub fn replica_skip_enabled(mut self, value: bool) -> Self {
        self.replica_skip_enabled = Some(value);
        self
    }

    pub fn data_transfer_pool_size(mut self, value: usize) -> Self {
        self.data_transfer_pool_size = Some(value);
        self
    }

    pub fn retry_max(mut self, value: u32) -> Self {
        self.retry_max = Some(value);
        self
    }

    pub fn retry_interval_max(mut self, value: Duration) -> Self {
        self.retry_interval_max = Some(value);
        self
    }

    pub fn send_check_interval(mut self, value: Duration) -> Self {
        self.send_check_interval = Some(value);
        self
    }

    pub fn send_check_timeout(mut self, value: Duration) -> Self {
        self.send_check_timeout = Some(value);
        self
    }

    pub fn rpc_timeout(mut self, value: Duration) -> Self {
        self.rpc_timeout = Some(value);
        self
    }

    pub fn heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = Some(value);
        self
    }

    pub fn heartbeat_timeout(mut self, value: Duration) -> Self {
        self.heartbeat_timeout = Some(value);
        self
    }

    /// Resolves with no dynamic overlay.
    pub fn build(self) -> ClientResult<ClientConfig> {
        self.build_with_dynamic(&BTreeMap::new())
    }

    /// Resolves explicit > dynamic > default, then validates.
    pub fn build_with_dynamic(
        self,
        dynamic: &BTreeMap<String, String>,
    ) -> ClientResult<ClientConfig> {
        let defaults = ClientConfig::default();

        fn overlay<T: FromStr + Copy>(
            explicit: Option<T>,
            dynamic: &BTreeMap<String, String>,
            key: &str,
            default: T,
        ) -> T {
            if let Some(value) = explicit {
                return value;
            }
            if let Some(raw) = dynamic.get(key) {
                if let Ok(parsed) = raw.trim().parse::<T>() {
                    return parsed;
                }
                tracing::warn!(key = key, value = %raw, "ignoring unparsable dynamic config value");
            }
            default
        }

        fn overlay_ms(
            explicit: Option<Duration>,
            dynamic: &BTreeMap<String, String>,
            key: &str,
            default: Duration,
        ) -> Duration {
            explicit.unwrap_or_else(|| {
                dynamic
                    .get(key)
                    .and_then(|raw| raw.trim().parse::<u64>().ok())
                    .map_or(default, Duration::from_millis)
            })
        }

        let replica = overlay(self.replica, dynamic, CONF_REPLICA, defaults.replica);
        let config = ClientConfig {
            replica,
            // By default every replica must ack: write quorum = replica.
            replica_write: overlay(self.replica_write, dynamic, CONF_REPLICA_WRITE, replica),
            replica_read: overlay(
                self.replica_read,
                dynamic,
                CONF_REPLICA_READ,
                defaults.replica_read,
            ),
            replica_skip_enabled: overlay(
                self.replica_skip_enabled,
                dynamic,
                CONF_REPLICA_SKIP_ENABLED,
                defaults.replica_skip_enabled,
            ),
            data_transfer_pool_size: overlay(
                self.data_transfer_pool_size,
                dynamic,
                CONF_TRANSFER_POOL_SIZE,
                defaults.data_transfer_pool_size,
            ),
            retry_max: overlay(self.retry_max, dynamic, CONF_RETRY_MAX, defaults.retry_max),
            retry_interval_max: overlay_ms(
                self.retry_interval_max,
                dynamic,
                CONF_RETRY_INTERVAL_MAX_MS,
                defaults.retry_interval_max,
            ),
            send_check_interval: overlay_ms(
                self.send_check_interval,
                dynamic,
                CONF_SEND_CHECK_INTERVAL_MS,
                defaults.send_check_interval,
            ),
            send_check_timeout: overlay_ms(
                self.send_check_timeout,
                dynamic,
                CONF_SEND_CHECK_TIMEOUT_MS,
                defaults.send_check_timeout,
            ),
            rpc_timeout: self.rpc_timeout.unwrap_or(defaults.rpc_timeout),
            heartbeat_interval: self.heartbeat_interval.unwrap_or_else(|| {
                dynamic
                    .get(CONF_HEARTBEAT_INTERVAL_S)
                    .and_then(|raw| raw.trim().parse::<u64>().ok())
                    .map_or(defaults.heartbeat_interval, Duration::from_secs)
            }),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(defaults.heartbeat_timeout),
        };

        config.validate()?;
        Ok(config)
    }
}

impl ClientConfig {
    fn validate(&self) -> ClientResult<()> {
        if self.replica == 0 || self.replica_write == 0 || self.replica_read == 0 {
            return Err(ClientError::Config(
                "replica, replica_write, and replica_read must be positive".to_string(),
            ));
        }
        if self.replica_write > self.replica {
            return Err(ClientError::Config(format!(
                "replica_write ({}) must not exceed replica ({})",
                self.replica_write, self.replica
            )));
        }
        if self.replica_read > self.replica {
            return Err(ClientError::Config(format!(
                "replica_read ({}) must not exceed replica ({})",
                self.replica_read, self.replica
            )));
        }
        if self.replica_write + self.replica_read <= self.replica {
            // Write and read quorums that do not intersect can miss
            // blocks; legal, but worth flagging loudly.
            tracing::warn!(
                replica = self.replica,
                replica_write = self.replica_write,
                replica_read = self.replica_read,
                "write and read quorums do not overlap"
            );
        }
        if self.data_transfer_pool_size == 0 {
            return Err(ClientError::Config(
                "data_transfer_pool_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the two-round send algorithm applies.
    pub fn two_round_send(&self) -> bool {
        self.replica_skip_enabled && self.replica_write < self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ClientConfigBuilder::new().build().unwrap();
        assert_eq!(config.replica, 1);
        assert!(!config.two_round_send());
    }

    #[test]
    fn explicit_beats_dynamic_beats_default() {
        let mut dynamic = BTreeMap::new();
        dynamic.insert(CONF_REPLICA.to_string(), "3".to_string());
        dynamic.insert(CONF_REPLICA_WRITE.to_string(), "2".to_string());
        dynamic.insert(CONF_RETRY_MAX.to_string(), "7".to_string());

        let config = ClientConfigBuilder::new()
            .replica(3)
            .replica_write(3) // explicit wins over the dynamic "2"
            .replica_read(2)
            .build_with_dynamic(&dynamic)
            .unwrap();

        assert_eq!(config.replica, 3);
        assert_eq!(config.replica_write, 3);
        assert_eq!(config.retry_max, 7); // dynamic wins over default 3
        assert_eq!(config.send_check_interval, Duration::from_millis(500)); // default
    }

    #[test]
    fn quorum_bounds_are_enforced() {
        let err = ClientConfigBuilder::new()
            .replica(2)
            .replica_write(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn two_round_send_requires_skip_and_slack() {
        let config = ClientConfigBuilder::new()
            .replica(3)
            .replica_write(2)
            .replica_read(2)
            .replica_skip_enabled(true)
            .build()
            .unwrap();
        assert!(config.two_round_send());

        let config = ClientConfigBuilder::new()
            .replica(3)
            .replica_write(2)
            .replica_read(2)
            .replica_skip_enabled(false)
            .build()
            .unwrap();
        assert!(!config.two_round_send());
    }

    #[test]
    fn unparsable_dynamic_values_fall_back() {
        let mut dynamic = BTreeMap::new();
        dynamic.insert(CONF_RETRY_MAX.to_string(), "not-a-number".to_string());
        let config = ClientConfigBuilder::new().build_with_dynamic(&dynamic).unwrap();
        assert_eq!(config.retry_max, 3);
    }
}
