//! # MQTT Integration Module
//!
//! Everything that touches the broker: the long-lived TLS session, decoding
//! of inbound node traffic, and publishing of outbound commands.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs             - Broker settings and rumqttc option building
//! ├── mqtt_handler.rs       - Session state machine, receive loop, reconnect
//! ├── message_manager.rs    - Payload schemas and topic routing
//! ├── command_publisher.rs  - QoS 1 command publishing
//! └── ack_tracker.rs        - Matches PUBACKs to waiting publishers
//! ```
//!
//! ## Topics
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `nodewave/registration` | inbound | `{"mac", "active"?}` |
//! | `/mesh/backend` | inbound | `{"mac", "rssi", "latency_ms", "data_total", "timestamp"?, "data_sent"?, "data_received"?}` |
//! | `/mesh/commands` | outbound | `{"cmd", "target"}` |
//!
//! One connection serves both directions. The receive loop owns the
//! `rumqttc::EventLoop`, and the command publisher holds a clone of the
//! `AsyncClient` that feeds it.

pub mod ack_tracker;
pub mod command_publisher;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use std::fmt;

pub const REGISTRATION_TOPIC: &str = "nodewave/registration";
pub const METRICS_TOPIC: &str = "/mesh/backend";
pub const COMMAND_TOPIC: &str = "/mesh/commands";

/// Inbound topics the bridge subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Registration,
    Metrics,
}

impl Topic {
    pub const SUBSCRIBED: [Topic; 2] = [Topic::Registration, Topic::Metrics];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            REGISTRATION_TOPIC => Some(Topic::Registration),
            METRICS_TOPIC => Some(Topic::Metrics),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topic::Registration => REGISTRATION_TOPIC,
            Topic::Metrics => METRICS_TOPIC,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
