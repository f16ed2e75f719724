//! # NodeWave Bridge
//!
//! Connects a mesh network's MQTT broker to the backend's node store.
//!
//! - Node registrations (`nodewave/registration`) link a MAC to its
//!   provisioned node id and update the node's liveness.
//! - Performance reports (`/mesh/backend`) are appended to the metrics table.
//! - Commands are published to `/mesh/commands` at QoS 1 and confirmed by
//!   the broker before the caller gets `Ok`.
//!
//! ## Module Overview
//!
//! - [`bridge`] - Task wiring and lifecycle ([`bridge::BridgeHandle`])
//! - [`config`] - TOML and environment configuration
//! - [`mqtt`] - Broker session, payload routing, command publishing
//! - [`ingest`] - Sharded workers for registrations and metrics
//! - [`identity`] - In-memory MAC to node id cache
//! - [`persistence`] - SQLite node store
//! - [`node`] - Shared domain types

pub mod bridge;
pub mod config;
pub mod identity;
pub mod ingest;
pub mod mqtt;
pub mod node;
pub mod persistence;
