// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shipper configuration.
//!
//! A [`ShipperConfig`] is built once, either in code or from `LOGSHIP_*` environment
//! variables, validated, and then shared read-only by every component.

use crate::errors::ShipperError;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_TARGET: &str = "applogs";

/// What the queue does when a record arrives and it is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the longest-resident record. Enqueue never blocks.
    #[default]
    DropOldest,
    /// Park the producer until space frees up, for at most the given duration, then
    /// fall back to evicting the oldest record.
    BlockWithTimeout(Duration),
}

impl FromStr for OverflowPolicy {
    type Err = ShipperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        if value == "drop-oldest" || value == "drop_oldest" {
            return Ok(OverflowPolicy::DropOldest);
        }
        if let Some(millis) = value.strip_prefix("block:") {
            return millis
                .parse::<u64>()
                .map(|ms| OverflowPolicy::BlockWithTimeout(Duration::from_millis(ms)))
                .map_err(|_| {
                    ShipperError::InvalidConfig(format!("Invalid overflow block timeout '{s}'"))
                });
        }
        Err(ShipperError::InvalidConfig(format!(
            "Invalid overflow policy '{s}'. Must be one of: drop-oldest, block:<millis>"
        )))
    }
}

/// What happens to the startup gate when index provisioning fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateFailurePolicy {
    /// Open the gate anyway and rely on the store's dynamic mapping.
    #[default]
    Open,
    /// Keep the gate closed. Records stay buffered (and eventually get dropped) until
    /// the shipper is stopped.
    KeepClosed,
}

/// Index lifecycle settings applied when provisioning the data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub hot_rollover_gb: u32,
    pub number_of_replicas: u32,
    pub number_of_shards: u32,
    pub warm_min_age: Duration,
    pub delete_min_age: Duration,
    pub warm_shrink_shards: u32,
    pub warm_segments: u32,
    pub configure_ilm: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hot_rollover_gb: 2,
            number_of_replicas: 1,
            number_of_shards: 1,
            warm_min_age: Duration::from_secs(3 * 24 * 3600),
            delete_min_age: Duration::from_secs(30 * 24 * 3600),
            warm_shrink_shards: 1,
            warm_segments: 1,
            configure_ilm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Create templates, lifecycle policy and data stream before the first flush.
    pub enabled: bool,
    pub retention: RetentionConfig,
    pub failure_policy: GateFailurePolicy,
    /// Provisioning still running after this long is treated as failed.
    pub timeout: Option<Duration>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: RetentionConfig::default(),
            failure_policy: GateFailurePolicy::Open,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// How to reach the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9200,
            https: false,
            username: None,
            password: None,
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.https)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Configuration for a [`crate::shipper::LogShipper`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShipperConfig {
    /// Data stream (or index) documents are written to. Also the provisioning prefix.
    pub target: String,
    /// Pending operations that trigger an implicit flush inside the session.
    pub batch_size: usize,
    /// Maximum idle time before the flush loop forces a flush.
    pub flush_interval: Duration,
    /// Period of the flush loop.
    pub tick: Duration,
    /// Bounded wait of the indexer loop on the queue.
    pub poll_interval: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Regex that process-context keys must fully match to be shipped.
    pub context_key_filter: Option<String>,
    /// Diagnostic keys shipped as integers.
    pub long_keys: BTreeSet<String>,
    /// Diagnostic keys shipped as floats.
    pub double_keys: BTreeSet<String>,
    pub context_name: Option<String>,
    /// Process-wide context attached to every record.
    pub context_properties: BTreeMap<String, String>,
    /// Upper bound for the final flush, the indexer drain and the session close on stop.
    pub flush_timeout: Duration,
    /// Attach a captured backtrace to the first exception frame.
    pub capture_backtraces: bool,
    pub provisioning: ProvisioningConfig,
    pub connection: ConnectionConfig,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(1),
            tick: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
            context_key_filter: None,
            long_keys: BTreeSet::new(),
            double_keys: BTreeSet::new(),
            context_name: None,
            context_properties: BTreeMap::new(),
            flush_timeout: Duration::from_secs(5),
            capture_backtraces: false,
            provisioning: ProvisioningConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ShipperConfig {
    /// Create configuration from `LOGSHIP_*` environment variables
    pub fn from_env() -> Result<Self, ShipperError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Unset or unparseable numeric
    /// values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ShipperError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(default)
        };
        let key_set = |key: &str| -> BTreeSet<String> {
            lookup(key)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let overflow_policy = match lookup("LOGSHIP_OVERFLOW") {
            Some(value) => value.parse()?,
            None => OverflowPolicy::DropOldest,
        };

        let failure_policy = match lookup("LOGSHIP_GATE_ON_PROVISIONING_FAILURE")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("open") => GateFailurePolicy::Open,
            Some("closed" | "keep-closed") => GateFailurePolicy::KeepClosed,
            Some(other) => {
                return Err(ShipperError::InvalidConfig(format!(
                    "Invalid gate failure policy '{other}'. Must be one of: open, keep-closed"
                )))
            }
        };

        let retention_defaults = RetentionConfig::default();
        let days = |key: &str, default: Duration| {
            parsed(key)
                .and_then(|d| d.checked_mul(24 * 3600))
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let count = |key: &str, default: u32| {
            parsed(key)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default)
        };
        let retention = RetentionConfig {
            hot_rollover_gb: count("LOGSHIP_ILM_HOT_ROLLOVER_GB", retention_defaults.hot_rollover_gb),
            number_of_replicas: count("LOGSHIP_REPLICAS", retention_defaults.number_of_replicas),
            number_of_shards: count("LOGSHIP_SHARDS", retention_defaults.number_of_shards),
            warm_min_age: days("LOGSHIP_ILM_WARM_DAYS", retention_defaults.warm_min_age),
            delete_min_age: days("LOGSHIP_ILM_DELETE_DAYS", retention_defaults.delete_min_age),
            warm_shrink_shards: count(
                "LOGSHIP_ILM_WARM_SHRINK_SHARDS",
                retention_defaults.warm_shrink_shards,
            ),
            warm_segments: count("LOGSHIP_ILM_WARM_SEGMENTS", retention_defaults.warm_segments),
            configure_ilm: flag("LOGSHIP_CONFIGURE_ILM", retention_defaults.configure_ilm),
        };

        let connection_defaults = ConnectionConfig::default();
        let connection = ConnectionConfig {
            host: lookup("LOGSHIP_HOST").unwrap_or(connection_defaults.host),
            port: lookup("LOGSHIP_PORT")
                .and_then(|p| p.trim().parse::<u16>().ok())
                .unwrap_or(connection_defaults.port),
            https: flag("LOGSHIP_HTTPS", false),
            username: lookup("LOGSHIP_USER"),
            password: lookup("LOGSHIP_PASSWORD"),
            api_key: lookup("LOGSHIP_API_KEY"),
            ..connection_defaults
        };

        let context_properties = lookup("LOGSHIP_CONTEXT_PROPERTIES")
            .map(|v| parse_properties(&v))
            .unwrap_or_default();

        let config = Self {
            target: lookup("LOGSHIP_DATA_STREAM").unwrap_or(defaults.target),
            batch_size: parsed("LOGSHIP_BATCH_SIZE")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.batch_size),
            flush_interval: parsed("LOGSHIP_FLUSH_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
            queue_capacity: parsed("LOGSHIP_QUEUE_CAPACITY")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.queue_capacity),
            overflow_policy,
            context_key_filter: lookup("LOGSHIP_CONTEXT_FILTER").filter(|f| !f.trim().is_empty()),
            long_keys: key_set("LOGSHIP_LONG_FIELDS"),
            double_keys: key_set("LOGSHIP_DOUBLE_FIELDS"),
            context_name: lookup("LOGSHIP_CONTEXT_NAME"),
            context_properties,
            capture_backtraces: flag("LOGSHIP_CAPTURE_BACKTRACES", false),
            provisioning: ProvisioningConfig {
                enabled: flag("LOGSHIP_CREATE_DATA_STREAM", true),
                retention,
                failure_policy,
                timeout: parsed("LOGSHIP_PROVISIONING_TIMEOUT_SECONDS")
                    .map(Duration::from_secs)
                    .or(defaults.provisioning.timeout),
            },
            connection,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ShipperError> {
        if self.target.trim().is_empty() {
            return Err(ShipperError::InvalidConfig(
                "target cannot be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ShipperError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ShipperError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("flush interval", self.flush_interval),
            ("tick", self.tick),
            ("poll interval", self.poll_interval),
            ("flush timeout", self.flush_timeout),
        ] {
            if value.is_zero() {
                return Err(ShipperError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.connection.port == 0 {
            return Err(ShipperError::InvalidConfig(
                "port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses `key=value,key=value` pairs. Malformed pairs are skipped.
fn parse_properties(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}
