//! keelson.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackOff;
use crate::error::{CoreError, CoreResult};

pub const DEFAULT_ANNOUNCER_BACKOFF: &str = "2000:10000:4";
pub const DEFAULT_REMOTE_UPDATER_BACKOFF: &str = "1000:5000:5";
pub const DEFAULT_LOCAL_UPDATER_BACKOFF: &str = "1000";
pub const DEFAULT_ETCD_ERROR_BACKOFF: &str = "1000:60000:10";
pub const DEFAULT_IO_ERROR_BACKOFF: &str = "1000:60000:10";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Static properties published by this instance.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub sling_id: String,
    #[serde(default)]
    pub server_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `host:port` of each store member, tried in order.
    pub endpoints: Vec<String>,
    /// Namespace root; announces live under `{root}/announces`.
    pub root: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            root: "/discovery".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Where the logical cluster id comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterIdSource {
    #[default]
    Config,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub source: ClusterIdSource,
    pub id: Option<String>,
    pub default_id: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            source: ClusterIdSource::Config,
            id: None,
            default_id: "default".to_string(),
        }
    }
}

/// Backoff configuration strings, see [`BackOff::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub announcer: String,
    pub remote_updater: String,
    pub local_updater: String,
    pub etcd_error: String,
    pub io_error: String,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            announcer: DEFAULT_ANNOUNCER_BACKOFF.to_string(),
            remote_updater: DEFAULT_REMOTE_UPDATER_BACKOFF.to_string(),
            local_updater: DEFAULT_LOCAL_UPDATER_BACKOFF.to_string(),
            etcd_error: DEFAULT_ETCD_ERROR_BACKOFF.to_string(),
            io_error: DEFAULT_IO_ERROR_BACKOFF.to_string(),
        }
    }
}

impl BackoffConfig {
    pub fn announcer(&self) -> BackOff {
        BackOff::parse_or(&self.announcer, DEFAULT_ANNOUNCER_BACKOFF)
    }

    pub fn remote_updater(&self) -> BackOff {
        BackOff::parse_or(&self.remote_updater, DEFAULT_REMOTE_UPDATER_BACKOFF)
    }

    pub fn local_updater(&self) -> BackOff {
        BackOff::parse_or(&self.local_updater, DEFAULT_LOCAL_UPDATER_BACKOFF)
    }

    pub fn etcd_error(&self) -> BackOff {
        BackOff::parse_or(&self.etcd_error, DEFAULT_ETCD_ERROR_BACKOFF)
    }

    pub fn io_error(&self) -> BackOff {
        BackOff::parse_or(&self.io_error, DEFAULT_IO_ERROR_BACKOFF)
    }
}

impl DiscoveryConfig {
    /// Minimal configuration for one instance with every default.
    pub fn for_instance(sling_id: &str, server_info: &str) -> Self {
        Self {
            instance: InstanceConfig {
                sling_id: sling_id.to_string(),
                server_info: server_info.to_string(),
            },
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: DiscoveryConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.instance.sling_id.trim().is_empty() {
            return Err(CoreError::Config("instance.sling_id must not be empty".into()));
        }
        if self.instance.sling_id.contains('/') {
            return Err(CoreError::Config("instance.sling_id must not contain '/'".into()));
        }
        if self.store.endpoints.is_empty() {
            return Err(CoreError::Config("store.endpoints must not be empty".into()));
        }
        if !self.store.root.starts_with('/') {
            return Err(CoreError::Config("store.root must start with '/'".into()));
        }
        Ok(())
    }
}
