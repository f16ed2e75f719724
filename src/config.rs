//! Bridge configuration
//!
//! Loaded once at startup from a TOML file, then overridden by environment
//! variables. The file path is `$NODEWAVE_CONFIG`, or
//! `<config dir>/nodewave/bridge.toml` when the variable is unset. A missing
//! file is not an error; every section has defaults except the broker
//! credentials, which must come from somewhere.
//!
//! ```toml
//! stats_interval_secs = 60
//!
//! [broker]
//! host = "broker.example.net"
//! username = "bridge"
//! password = "..."
//!
//! [ingest]
//! workers = 4
//!
//! [[provision]]
//! node_id = 1
//! mac = "AA:BB:CC:DD:EE:FF"
//! ```
//!
//! ## Environment overrides
//!
//! | Variable | Field |
//! |---|---|
//! | `MQTT_BROKER` | `broker.host` |
//! | `MQTT_PORT` | `broker.port` |
//! | `MQTT_USERNAME` | `broker.username` |
//! | `MQTT_PASSWORD` | `broker.password` |
//! | `MQTT_CLIENT_ID` | `broker.client_id` |
//! | `MQTT_CA_FILE` | `broker.ca_file` |
//! | `NODEWAVE_DB_PATH` | `store.path` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ingest::ingest_worker::PoolSettings;
use crate::ingest::RetryPolicy;
use crate::mqtt::config::{BrokerSettings, ReconnectSettings};
use crate::node::{MacAddress, MacError, NodeId};

pub const CONFIG_ENV: &str = "NODEWAVE_CONFIG";
const CONFIG_DIR: &str = "nodewave";
const CONFIG_FILE: &str = "bridge.toml";
const DB_FILE: &str = "bridge.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("provisioned MAC {mac:?} is invalid: {source}")]
    InvalidMac {
        mac: String,
        #[source]
        source: MacError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 200,
        }
    }
}

impl IngestSettings {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_retry_attempts,
            initial_backoff: Duration::from_millis(self.store_retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishSettings {
    pub ack_timeout_secs: u64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 10,
        }
    }
}

impl PublishSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// SQLite file; defaults to `<data dir>/nodewave/bridge.db`
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => {
                let mut path = dirs::data_dir().unwrap_or_else(|| {
                    warn!("Could not determine data directory, using current directory");
                    PathBuf::from(".")
                });
                path.push(CONFIG_DIR);
                path.push(DB_FILE);
                path
            }
        }
    }
}

/// Node seeded into the store at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionedNode {
    pub node_id: Option<i64>,
    pub mac: String,
}

impl ProvisionedNode {
    pub fn parsed(&self) -> Result<(Option<NodeId>, MacAddress), ConfigError> {
        let mac = MacAddress::parse(&self.mac).map_err(|source| ConfigError::InvalidMac {
            mac: self.mac.clone(),
            source,
        })?;
        Ok((self.node_id.map(NodeId), mac))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub stats_interval_secs: u64,
    pub broker: BrokerSettings,
    pub reconnect: ReconnectSettings,
    pub ingest: IngestSettings,
    pub publish: PublishSettings,
    pub store: StoreSettings,
    pub provision: Vec<ProvisionedNode>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            broker: BrokerSettings::default(),
            reconnect: ReconnectSettings::default(),
            ingest: IngestSettings::default(),
            publish: PublishSettings::default(),
            store: StoreSettings::default(),
            provision: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Loads from the default location and the process environment
    pub async fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => default_config_path(),
        };
        Self::from_sources(path.as_deref(), |key| std::env::var(key).ok()).await
    }

    pub async fn from_sources(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read_file(path).await?,
            None => {
                warn!("No config location available, using defaults");
                Self::default()
            }
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    async fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if !tokio::fs::try_exists(path).await.map_err(io_err)? {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = env("MQTT_BROKER") {
            self.broker.host = host;
        }
        if let Some(port) = env("MQTT_PORT") {
            self.broker.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MQTT_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(username) = env("MQTT_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = env("MQTT_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(client_id) = env("MQTT_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(ca_file) = env("MQTT_CA_FILE") {
            self.broker.ca_file = Some(PathBuf::from(ca_file));
        }
        if let Some(db_path) = env("NODEWAVE_DB_PATH") {
            self.store.path = Some(PathBuf::from(db_path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Missing("broker.host"));
        }
        if self.broker.username.is_empty() {
            return Err(ConfigError::Missing("broker.username"));
        }
        if self.broker.password.is_empty() {
            return Err(ConfigError::Missing("broker.password"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker.port", "must be between 1 and 65535"));
        }
        // rumqttc rejects empty ids and ids with a leading space
        if self.broker.client_id.is_empty() || self.broker.client_id.starts_with(' ') {
            return Err(invalid(
                "broker.client_id",
                "must be non-empty without leading whitespace",
            ));
        }
        if self.broker.request_capacity == 0 {
            return Err(invalid("broker.request_capacity", "must be at least 1"));
        }
        if self.ingest.workers == 0 {
            return Err(invalid("ingest.workers", "must be at least 1"));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(invalid("ingest.queue_capacity", "must be at least 1"));
        }
        if self.ingest.store_retry_attempts == 0 {
            return Err(invalid("ingest.store_retry_attempts", "must be at least 1"));
        }
        if self.publish.ack_timeout_secs == 0 {
            return Err(invalid("publish.ack_timeout_secs", "must be at least 1"));
        }
        if self.stats_interval_secs == 0 {
            return Err(invalid("stats_interval_secs", "must be at least 1"));
        }
        for node in &self.provision {
            node.parsed()?;
        }
        debug!("Config validated: {:?}", self.redacted());
        Ok(())
    }

    /// Copy safe to log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.broker.password = "***".to_string();
        copy
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    Some(path)
}
