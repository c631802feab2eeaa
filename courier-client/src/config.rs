//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::DcTable;
use crate::errors::CacheError;
use crate::socks5::Socks5Config;
use crate::storage::{StorageConfig, StorageError};
use crate::transport::TransportKind;

/// Configuration for [`crate::Client::new`]. Immutable once the client exists.
#[derive(Clone, Debug)]
pub struct Config {
    /// Account name; keys the stored credentials.
    pub account:                      String,
    /// Handler worker threads (default: `min(32, cpus + 4)`).
    pub workers:                      usize,
    /// Concurrent uploads, and separately downloads (default: 1).
    pub max_concurrent_transmissions: usize,
    /// Capacity of the `(chat_id, message_id)` message cache.
    pub message_cache_capacity:       usize,
    /// Capacity of the business-connection cache.
    pub business_cache_capacity:      usize,
    /// Idle time after which the watchdog probes for updates (default: 15 min).
    pub watchdog_interval:            Duration,
    /// Which MTProto transport framing to use (default: Abridged).
    pub transport:                    TransportKind,
    /// Prefer IPv6 datacenter addresses.
    pub ipv6:                         bool,
    /// Connect to port 5222 instead of 443.
    pub alt_port:                     bool,
    /// Use the test network.
    pub test_mode:                    bool,
    /// Optional SOCKS5 proxy; every connection is tunnelled through it.
    pub proxy:                        Option<Socks5Config>,
    /// Credential persistence (default: `./<account>.session`).
    pub storage:                      StorageConfig,
    /// Datacenter to start on when storage has no home DC recorded.
    pub home_dc:                      i32,
    /// How long one `invoke` waits for its answer.
    pub request_timeout:              Duration,
    /// Keep-alive ping period.
    pub ping_interval:                Duration,
}

/// `min(32, cpus + 4)`.
pub fn default_workers() -> usize {
    (num_cpus::get() + 4).min(32)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account:                      "courier".into(),
            workers:                      default_workers(),
            max_concurrent_transmissions: 1,
            message_cache_capacity:       10_000,
            business_cache_capacity:      10_000,
            watchdog_interval:            Duration::from_secs(15 * 60),
            transport:                    TransportKind::Abridged,
            ipv6:                         false,
            alt_port:                     false,
            test_mode:                    false,
            proxy:                        None,
            storage:                      StorageConfig::default(),
            home_dc:                      2,
            request_timeout:              Duration::from_secs(30),
            ping_interval:                Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_concurrent_transmissions(mut self, n: usize) -> Self {
        self.max_concurrent_transmissions = n;
        self
    }

    /// Set both cache capacities.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.message_cache_capacity = capacity;
        self.business_cache_capacity = capacity;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn with_alt_port(mut self, alt_port: bool) -> Self {
        self.alt_port = alt_port;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_proxy(mut self, proxy: Socks5Config) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Keep credentials in memory only.
    pub fn in_memory(self) -> Self {
        self.with_storage(StorageConfig::Memory { session_string: None })
    }

    /// Store `<account>.session` in `workdir`.
    pub fn with_workdir(self, workdir: impl Into<PathBuf>) -> Self {
        self.with_storage(StorageConfig::File { workdir: workdir.into() })
    }

    pub fn with_home_dc(mut self, dc_id: i32) -> Self {
        self.home_dc = dc_id;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// The address table this configuration resolves datacenters with.
    pub fn dc_table(&self) -> DcTable {
        DcTable { test_mode: self.test_mode, ipv6: self.ipv6, alt_port: self.alt_port }
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.is_empty() || self.account.contains(['/', '\\']) {
            return Err(ConfigError::BadAccount(self.account.clone()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.max_concurrent_transmissions == 0 {
            return Err(ConfigError::Zero("max_concurrent_transmissions"));
        }
        if self.message_cache_capacity == 0 || self.business_cache_capacity == 0 {
            return Err(CacheError::ZeroCapacity.into());
        }
        for (name, d) in [
            ("watchdog_interval", self.watchdog_interval),
            ("request_timeout", self.request_timeout),
            ("ping_interval", self.ping_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.dc_table().resolve(self.home_dc, false).is_none() {
            return Err(ConfigError::UnknownHomeDc(self.home_dc));
        }
        Ok(())
    }
}

/// Why a [`Config`] was refused.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid account name {0:?}")]
    BadAccount(String),

    #[error("no address known for home DC{0}")]
    UnknownHomeDc(i32),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("cannot open storage: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot start handler threads: {0}")]
    Threads(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert!(cfg.workers >= 5 && cfg.workers <= 32);
        assert_eq!(cfg.max_concurrent_transmissions, 1);
        assert_eq!(cfg.message_cache_capacity, 10_000);
        assert_eq!(cfg.watchdog_interval, Duration::from_secs(900));
    }

    #[test]
    fn zero_cache_capacity_is_a_cache_error() {
        let err = Config::default().with_cache_capacity(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Cache(CacheError::ZeroCapacity)));
    }

    #[test]
    fn bad_values_are_named() {
        assert!(matches!(
            Config::default().with_workers(0).validate(),
            Err(ConfigError::Zero("workers"))
        ));
        assert!(matches!(
            Config::default().with_test_mode(true).with_home_dc(5).validate(),
            Err(ConfigError::UnknownHomeDc(5))
        ));
        assert!(matches!(
            Config::default().with_account("../etc").validate(),
            Err(ConfigError::BadAccount(_))
        ));
    }
}
