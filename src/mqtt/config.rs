//! Broker connection and reconnect settings
//!
//! Both sections deserialize from the `[broker]` and `[reconnect]` tables of
//! the bridge config file. Values not given in the file fall back to the
//! defaults below.

use std::path::PathBuf;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CLIENT_ID: &str = "NodeWave-Backend";
pub const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Debug, thiserror::Error)]
pub enum BrokerConfigError {
    #[error("could not read CA file {path:?}: {source}")]
    CaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// PEM bundle; the platform trust store is used when unset
    pub ca_file: Option<PathBuf>,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_TLS_PORT,
            username: String::new(),
            password: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive_secs: 30,
            ca_file: None,
            request_capacity: 100,
        }
    }
}

impl BrokerSettings {
    /// Builds the rumqttc options for a persistent TLS session
    pub fn mqtt_options(&self) -> Result<MqttOptions, BrokerConfigError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_credentials(self.username.clone(), self.password.clone())
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true);

        let transport = match &self.ca_file {
            Some(path) => {
                let ca = std::fs::read(path).map_err(|source| BrokerConfigError::CaFile {
                    path: path.clone(),
                    source,
                })?;
                Transport::Tls(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                })
            }
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);

        Ok(options)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(settings: &ReconnectSettings) -> Self {
        let initial = Duration::from_millis(settings.initial_backoff_ms);
        let max = Duration::from_millis(settings.max_backoff_ms.max(settings.initial_backoff_ms));
        Self {
            initial,
            max,
            multiplier: settings.multiplier.max(1.0),
            current: initial,
        }
    }

    /// Delay before the next attempt; grows the delay for the one after
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
