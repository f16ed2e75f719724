//! # Persistence Module
//!
//! Durable storage for the bridge: the provisioned `node` table and the
//! append-only `performance_metrics` log.
//!
//! ## Key Abstractions
//! - **[`NodeStore`]**: the narrow set of queries the ingestion path needs
//!   (resolve a MAC, update liveness, append a metric). Ingestion only talks to
//!   this trait, so tests and alternative backends can stand in for SQLite.
//! - **[`node_store::SqliteNodeStore`]**: the production implementation on top
//!   of `rusqlite`.
//!
//! ## Concurrency
//! Every method is a single statement and therefore a single atomic unit.
//! Methods are synchronous. Async callers run them through
//! `tokio::task::spawn_blocking` (see [`crate::ingest`]).
//!
//! ## Error Handling Strategy
//! All failures surface as [`StoreError`]. Callers ask
//! [`StoreError::is_transient`] to decide whether a retry can help.

pub mod node_store;

use crate::node::{MacAddress, NodeId, NodeStatus, PerformanceMetric};
use thiserror::Error;

/// Errors raised by a [`NodeStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error reported by SQLite
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store could not be reached at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Row referenced by an update does not exist
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    /// Stored value could not be mapped back into a domain type
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Blocking task running the query was cancelled or panicked
    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Whether retrying the same statement may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
            ),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Queries the bridge issues against the durable store
///
/// Implementations must be safe to share between worker tasks. Each call is
/// expected to block for at most one statement.
pub trait NodeStore: Send + Sync + 'static {
    /// Looks up the node provisioned for `mac` (exact match on the canonical form)
    fn find_node_by_mac(&self, mac: &MacAddress) -> Result<Option<NodeId>, StoreError>;

    /// Sets the liveness status of an existing node
    fn update_node_status(&self, node_id: NodeId, status: NodeStatus) -> Result<(), StoreError>;

    /// Appends one performance record
    fn insert_metric(&self, metric: &PerformanceMetric) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_database_is_transient() {
        let busy = StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        let constraint = StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_transient());
        assert!(!StoreError::NodeNotFound(NodeId(3)).is_transient());
    }
}
