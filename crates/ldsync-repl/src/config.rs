//! Replication configuration, loaded from TOML or JSON.
//!
//! ```toml
//! [broker]
//! server_id = 100
//! listen_addr = "0.0.0.0:8989"
//!
//! [[domains]]
//! base_dn = "dc=example,dc=com"
//! server_id = 1
//! replication_servers = ["rs1.example.com:8989"]
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::csn::ServerId;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::flow::DEFAULT_WINDOW;
use crate::heartbeat::HeartbeatConfig;
use crate::pending::DEFAULT_PENDING_CAPACITY;
use crate::protocol::AssuredMode;
use crate::retry::RetryConfig;

/// Default heartbeat interval (ms).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Default missed heartbeats before a session is closed.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
/// Default backlog above which a domain is marked degraded.
pub const DEFAULT_DEGRADED_STATUS_THRESHOLD: u64 = 5000;
/// Default changelog retention (3 days, ms).
pub const DEFAULT_PURGE_DELAY_MS: u64 = 3 * 24 * 60 * 60 * 1000;
/// Default interval between purge runs (ms).
pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 60_000;
/// Default group of domains and replication servers.
pub const DEFAULT_GROUP_ID: u8 = 1;
/// Default wait for an assured acknowledgment (ms).
pub const DEFAULT_ASSURED_TIMEOUT_MS: u64 = 2000;

fn default_listen_addr() -> String {
    "0.0.0.0:8989".to_string()
}
fn default_window() -> u32 {
    DEFAULT_WINDOW
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_max_missed() -> u32 {
    DEFAULT_MAX_MISSED_HEARTBEATS
}
fn default_degraded_threshold() -> u64 {
    DEFAULT_DEGRADED_STATUS_THRESHOLD
}
fn default_purge_delay_ms() -> u64 {
    DEFAULT_PURGE_DELAY_MS
}
fn default_purge_interval_ms() -> u64 {
    DEFAULT_PURGE_INTERVAL_MS
}
fn default_pending_capacity() -> usize {
    DEFAULT_PENDING_CAPACITY
}
fn default_reconnect() -> RetryConfig {
    RetryConfig::reconnect()
}
fn default_true() -> bool {
    true
}
fn default_group_id() -> u8 {
    DEFAULT_GROUP_ID
}
fn default_weight() -> u32 {
    1
}
fn default_assured_timeout_ms() -> u64 {
    DEFAULT_ASSURED_TIMEOUT_MS
}

/// Replication server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Server ID of the replication server.
    pub server_id: u32,
    /// Address accepting domain sessions.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Updates a domain may send before an ack.
    #[serde(default = "default_window")]
    pub window_size: u32,
    /// Heartbeat interval (ms).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a session is closed.
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    /// Backlog (updates not yet delivered) above which a domain is degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_status_threshold: u64,
    /// Changelog retention (ms).
    #[serde(default = "default_purge_delay_ms")]
    pub purge_delay_ms: u64,
    /// Interval between purge runs (ms).
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
    /// Group of this server; assured acknowledgments are only awaited
    /// from domains of the same group.
    #[serde(default = "default_group_id")]
    pub group_id: u8,
    /// Share of the domains this server should carry, relative to the
    /// other servers a domain may choose from.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Wait for safe-read acknowledgments before answering with a timeout (ms).
    #[serde(default = "default_assured_timeout_ms")]
    pub assured_timeout_ms: u64,
}

impl BrokerConfig {
    /// Defaults for `server_id`.
    pub fn new(server_id: u32) -> Self {
        Self {
            server_id,
            listen_addr: default_listen_addr(),
            window_size: DEFAULT_WINDOW,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            degraded_status_threshold: DEFAULT_DEGRADED_STATUS_THRESHOLD,
            purge_delay_ms: DEFAULT_PURGE_DELAY_MS,
            purge_interval_ms: DEFAULT_PURGE_INTERVAL_MS,
            group_id: DEFAULT_GROUP_ID,
            weight: 1,
            assured_timeout_ms: DEFAULT_ASSURED_TIMEOUT_MS,
        }
    }

    /// Safe-read acknowledgment wait.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout_ms)
    }

    /// Server ID as a typed value.
    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.server_id)
    }

    /// Heartbeat timing of broker sessions.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_missed: self.max_missed_heartbeats,
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<()> {
        check(self.server_id != 0, "broker server_id must be non-zero")?;
        check(self.window_size > 0, "broker window_size must be positive")?;
        check(
            self.heartbeat_interval_ms > 0,
            "broker heartbeat_interval_ms must be positive",
        )?;
        check(
            self.max_missed_heartbeats > 0,
            "broker max_missed_heartbeats must be positive",
        )?;
        check(
            self.purge_interval_ms > 0,
            "broker purge_interval_ms must be positive",
        )?;
        check(self.weight > 0, "broker weight must be positive")?;
        check(
            self.assured_timeout_ms > 0,
            "broker assured_timeout_ms must be positive",
        )
    }
}

/// Settings of one replicated base DN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Replicated subtree.
    pub base_dn: String,
    /// Server ID of this replica.
    pub server_id: u32,
    /// Replication servers. With more than one, each connection goes to
    /// the best server by group, generation, freshness and weight.
    #[serde(default)]
    pub replication_servers: Vec<String>,
    /// Group of this replica.
    #[serde(default = "default_group_id")]
    pub group_id: u8,
    /// Acknowledgment awaited by `publish`; `None` publishes without waiting.
    #[serde(default)]
    pub assured: Option<AssuredMode>,
    /// Wait for an assured acknowledgment (ms).
    #[serde(default = "default_assured_timeout_ms")]
    pub assured_timeout_ms: u64,
    /// Updates the replication server may send before an ack.
    #[serde(default = "default_window")]
    pub window_size: u32,
    /// Heartbeat interval (ms).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before the session is closed.
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    /// Updates buffered while waiting for their entry's add.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    /// Backoff of local apply retries.
    #[serde(default)]
    pub apply_retry: RetryConfig,
    /// Backoff between reconnection attempts.
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryConfig,
    /// Request a full update automatically when one is required.
    #[serde(default = "default_true")]
    pub auto_resync: bool,
}

impl DomainConfig {
    /// Defaults for `base_dn` served by `server_id`.
    pub fn new(base_dn: &str, server_id: u32) -> Self {
        Self {
            base_dn: base_dn.to_string(),
            server_id,
            replication_servers: Vec::new(),
            group_id: DEFAULT_GROUP_ID,
            assured: None,
            assured_timeout_ms: DEFAULT_ASSURED_TIMEOUT_MS,
            window_size: DEFAULT_WINDOW,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            apply_retry: RetryConfig::default(),
            reconnect: RetryConfig::reconnect(),
            auto_resync: true,
        }
    }

    /// Base DN as a typed value.
    pub fn base_dn(&self) -> Dn {
        Dn::new(&self.base_dn)
    }

    /// Server ID as a typed value.
    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.server_id)
    }

    /// Assured acknowledgment wait.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout_ms)
    }

    /// Heartbeat timing of the domain session.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_missed: self.max_missed_heartbeats,
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<()> {
        check(!self.base_dn.trim().is_empty(), "domain base_dn is empty")?;
        check(self.server_id != 0, "domain server_id must be non-zero")?;
        check(self.window_size > 0, "domain window_size must be positive")?;
        check(
            self.heartbeat_interval_ms > 0,
            "domain heartbeat_interval_ms must be positive",
        )?;
        check(
            self.max_missed_heartbeats > 0,
            "domain max_missed_heartbeats must be positive",
        )?;
        check(
            self.pending_capacity > 0,
            "domain pending_capacity must be positive",
        )?;
        check(
            self.assured_timeout_ms > 0,
            "domain assured_timeout_ms must be positive",
        )?;
        self.apply_retry.validate()?;
        self.reconnect.validate()
    }
}

/// Top-level configuration of one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplConfig {
    /// Replication server hosted by this process, if any.
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    /// Replicated base DNs hosted by this process.
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

impl ReplConfig {
    /// Parses TOML.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ReplError::Config { msg: e.to_string() })
    }

    /// Reads a `.toml` or `.json` file and validates it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let config = match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&contents)?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ReplError::Config { msg: e.to_string() })?,
            _ => {
                return Err(ReplError::Config {
                    msg: format!("unsupported config file extension: {ext}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        if let Some(broker) = &self.broker {
            broker.validate()?;
        }
        let mut bases = BTreeSet::new();
        for domain in &self.domains {
            domain.validate()?;
            check(
                bases.insert(domain.base_dn().index_key()),
                &format!("base DN {} configured twice", domain.base_dn),
            )?;
            check(
                self.broker.is_some() || !domain.replication_servers.is_empty(),
                &format!("domain {} has no replication server", domain.base_dn),
            )?;
        }
        check(
            self.broker.is_some() || !self.domains.is_empty(),
            "nothing to run: no broker and no domain configured",
        )
    }
}

fn check(ok: bool, msg: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ReplError::Config {
            msg: msg.to_string(),
        })
    }
}
