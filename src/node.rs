//! Domain types shared by the bridge
//!
//! A mesh node is known by two identities: the MAC address it reports over
//! MQTT, and the `node_id` it was given when it was provisioned in the store.
//! Everything that crosses a module boundary uses the types below instead of
//! raw strings, so a MAC can only exist in its canonical form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing a MAC address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacError {
    #[error("MAC address is empty")]
    Empty,

    #[error("MAC address contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("MAC address {0:?} is not six groups of two hex digits")]
    InvalidFormat(String),
}

/// Canonical MAC address: uppercase hex digits separated by `:`
///
/// Devices are not consistent about case or separators, so every MAC is
/// normalized on construction. `aa-bb-cc-dd-ee-ff`, ` aa:bb:cc:dd:ee:ff ` and
/// `AA:BB:CC:DD:EE:FF` all produce the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn parse(raw: &str) -> Result<Self, MacError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MacError::Empty);
        }

        let mut canonical = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            match c {
                '0'..='9' | 'A'..='F' | ':' => canonical.push(c),
                'a'..='f' => canonical.push(c.to_ascii_uppercase()),
                '-' => canonical.push(':'),
                other => return Err(MacError::InvalidCharacter(other)),
            }
        }

        // Bare form: AABBCCDDEEFF
        if !canonical.contains(':') && canonical.len() == 12 {
            let grouped = canonical
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair))
                .collect::<Vec<_>>()
                .join(":");
            return Ok(Self(grouped));
        }

        let groups: Vec<&str> = canonical.split(':').collect();
        if groups.len() != 6 || groups.iter().any(|g| g.len() != 2) {
            return Err(MacError::InvalidFormat(trimmed.to_string()));
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical node identifier, the primary key of the `node` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness status of a node as reported by its last registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    #[default]
    Inactive,
}

impl NodeStatus {
    pub fn from_active_flag(active: bool) -> Self {
        if active {
            NodeStatus::Active
        } else {
            NodeStatus::Inactive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "inactive" => Ok(NodeStatus::Inactive),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned node as stored in the durable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: NodeId,
    pub mac_address: MacAddress,
    pub status: NodeStatus,
}

/// Timestamp supplied by the sending node
///
/// Firmware versions disagree on whether this is an epoch number or a
/// formatted string. The value is never replaced by a server-side time. It is
/// stored through its `Display` form: integers and text come back unchanged,
/// a float is written in its shortest form (`1.50` → `1.5`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderTimestamp {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for SenderTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SenderTimestamp::Integer(v) => write!(f, "{}", v),
            SenderTimestamp::Float(v) => write!(f, "{}", v),
            SenderTimestamp::Text(v) => f.write_str(v),
        }
    }
}

/// One append-only performance sample for a node
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetric {
    pub node_id: NodeId,
    pub signal_strength: f64,
    pub latency: f64,
    pub data_usage: f64,
    pub data_sent: Option<f64>,
    pub data_received: Option<f64>,
    pub metric_timestamp: Option<SenderTimestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_normalized_to_uppercase_colon_form() {
        let mac = MacAddress::parse(" aa-bb-cc-dd-ee-0f ").unwrap();
        assert_eq!(mac.as_str(), "AA:BB:CC:DD:EE:0F");
        assert_eq!(mac, "AA:BB:CC:DD:EE:0F".parse().unwrap());
    }

    #[test]
    fn mac_rejects_empty_and_garbage() {
        assert_eq!(MacAddress::parse("   "), Err(MacError::Empty));
        assert_eq!(
            MacAddress::parse("AA:BB:CC:DD:EE:GG"),
            Err(MacError::InvalidCharacter('G'))
        );
    }

    #[test]
    fn mac_must_have_six_two_digit_groups() {
        for raw in [
            "A",
            "::",
            "ABC",
            "AA:BB:CC:DD:EE",
            "AA:BB:CC:DD:EE:FF:00",
            "A:BB:CC:DD:EE:FFF",
            "AA::CC:DD:EE:FF",
        ] {
            assert_eq!(
                MacAddress::parse(raw),
                Err(MacError::InvalidFormat(raw.to_string())),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn bare_mac_is_grouped() {
        let mac = MacAddress::parse("aabbccddee0f").unwrap();
        assert_eq!(mac.as_str(), "AA:BB:CC:DD:EE:0F");
    }

    #[test]
    fn status_follows_active_flag() {
        assert_eq!(NodeStatus::from_active_flag(true), NodeStatus::Active);
        assert_eq!(NodeStatus::from_active_flag(false), NodeStatus::Inactive);
        assert_eq!("inactive".parse::<NodeStatus>(), Ok(NodeStatus::Inactive));
    }

    #[test]
    fn sender_timestamp_keeps_its_shape() {
        let int: SenderTimestamp = serde_json::from_str("1700000000").unwrap();
        let text: SenderTimestamp = serde_json::from_str("\"2024-05-01T10:00:00Z\"").unwrap();
        assert_eq!(int, SenderTimestamp::Integer(1_700_000_000));
        assert_eq!(text.to_string(), "2024-05-01T10:00:00Z");

        let float: SenderTimestamp = serde_json::from_str("1700000000.50").unwrap();
        assert_eq!(float, SenderTimestamp::Float(1_700_000_000.5));
        assert_eq!(float.to_string(), "1700000000.5");
    }
}
