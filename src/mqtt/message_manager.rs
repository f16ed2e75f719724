//! Inbound message decoding and routing
//!
//! Each inbound topic has an explicit schema. A payload is decoded into a
//! tagged [`InboundMessage`] or rejected with a [`DecodeError`]. Rejection
//! covers malformed JSON, unknown fields, a missing or invalid MAC, and a
//! missing required metric. The [`MessageRouter`] hands decoded messages
//! to the ingestion pool.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::Topic;
use crate::ingest::ingest_worker::{IngestSubmitter, SubmitError};
use crate::ingest::IngestStats;
use crate::node::{MacAddress, MacError, NodeId, PerformanceMetric, SenderTimestamp};

/// Reasons a payload is rejected
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not valid JSON for the topic schema (includes unknown fields)
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload has no MAC address")]
    MissingMac,

    #[error("invalid MAC address: {0}")]
    InvalidMac(#[from] MacError),

    /// A required field is absent or null
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
}

/// Registration announcement from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEvent {
    pub mac: MacAddress,
    pub active: bool,
}

/// Telemetry sample from a node
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub mac: MacAddress,
    pub signal_strength: f64,
    pub latency: f64,
    pub data_usage: f64,
    pub data_sent: Option<f64>,
    pub data_received: Option<f64>,
    pub timestamp: Option<SenderTimestamp>,
}

impl MetricsReport {
    pub fn into_metric(self, node_id: NodeId) -> PerformanceMetric {
        PerformanceMetric {
            node_id,
            signal_strength: self.signal_strength,
            latency: self.latency,
            data_usage: self.data_usage,
            data_sent: self.data_sent,
            data_received: self.data_received,
            metric_timestamp: self.timestamp,
        }
    }
}

/// Decoded payload, tagged by the topic it arrived on
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Registration(RegistrationEvent),
    Metrics(MetricsReport),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistrationPayload {
    mac: Option<String>,
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricsPayload {
    mac: Option<String>,
    rssi: Option<f64>,
    latency_ms: Option<f64>,
    data_total: Option<f64>,
    timestamp: Option<SenderTimestamp>,
    data_sent: Option<f64>,
    data_received: Option<f64>,
}

fn require_mac(raw: Option<String>) -> Result<MacAddress, DecodeError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(MacAddress::parse(&raw)?),
        _ => Err(DecodeError::MissingMac),
    }
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField(field))
}

impl InboundMessage {
    /// Decodes `payload` with the schema of `topic`
    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Self, DecodeError> {
        match topic {
            Topic::Registration => {
                let wire: RegistrationPayload = serde_json::from_slice(payload)?;
                Ok(InboundMessage::Registration(RegistrationEvent {
                    mac: require_mac(wire.mac)?,
                    active: wire.active.unwrap_or(false),
                }))
            }
            Topic::Metrics => {
                let wire: MetricsPayload = serde_json::from_slice(payload)?;
                Ok(InboundMessage::Metrics(MetricsReport {
                    mac: require_mac(wire.mac)?,
                    signal_strength: require(wire.rssi, "rssi")?,
                    latency: require(wire.latency_ms, "latency_ms")?,
                    data_usage: require(wire.data_total, "data_total")?,
                    data_sent: wire.data_sent,
                    data_received: wire.data_received,
                    timestamp: wire.timestamp,
                }))
            }
        }
    }

    pub fn mac(&self) -> &MacAddress {
        match self {
            InboundMessage::Registration(event) => &event.mac,
            InboundMessage::Metrics(report) => &report.mac,
        }
    }
}

/// Why a message was not handed to ingestion
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no handler for topic {0}")]
    UnknownTopic(String),

    #[error("dropping message on {topic}: {source}")]
    Decode {
        topic: Topic,
        #[source]
        source: DecodeError,
    },

    #[error("dropping message from {mac}: {source}")]
    Submit {
        mac: MacAddress,
        #[source]
        source: SubmitError,
    },
}

/// Dispatches raw broker messages to the ingestion pool
#[derive(Clone)]
pub struct MessageRouter {
    submitter: IngestSubmitter,
    stats: Arc<IngestStats>,
}

impl MessageRouter {
    pub fn new(submitter: IngestSubmitter, stats: Arc<IngestStats>) -> Self {
        Self { submitter, stats }
    }

    /// Decodes one message and queues it for ingestion
    ///
    /// Never blocks. Every failure is returned to the receive loop for logging.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Topic, RouteError> {
        IngestStats::incr(&self.stats.messages_received);
        debug!(
            "Raw payload on {}: {}",
            topic,
            String::from_utf8_lossy(payload)
        );

        let Some(kind) = Topic::from_name(topic) else {
            IngestStats::incr(&self.stats.unknown_topic);
            return Err(RouteError::UnknownTopic(topic.to_string()));
        };

        let message = InboundMessage::decode(kind, payload).map_err(|source| {
            IngestStats::incr(&self.stats.decode_failures);
            RouteError::Decode {
                topic: kind,
                source,
            }
        })?;

        let mac = message.mac().clone();

        self.submitter.submit(message).map_err(|source| {
            IngestStats::incr(&self.stats.dropped_saturated);
            RouteError::Submit { mac, source }
        })?;

        Ok(kind)
    }
}
