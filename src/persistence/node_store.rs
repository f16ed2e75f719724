//! SQLite backed [`NodeStore`]

use super::{NodeStore, StoreError};
use crate::node::{MacAddress, Node, NodeId, NodeStatus, PerformanceMetric, SenderTimestamp};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS node (
    node_id     INTEGER PRIMARY KEY,
    mac_address TEXT NOT NULL UNIQUE,
    status      TEXT NOT NULL DEFAULT 'inactive'
                CHECK (status IN ('active', 'inactive'))
);

CREATE TABLE IF NOT EXISTS performance_metrics (
    metric_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id          INTEGER NOT NULL REFERENCES node(node_id),
    signal_strength  REAL NOT NULL,
    latency          REAL NOT NULL,
    data_usage       REAL NOT NULL,
    data_sent        REAL,
    data_received    REAL,
    metric_timestamp TEXT,
    recorded_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_performance_metrics_node ON performance_metrics(node_id);
"#;

/// Metric row as read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetric {
    pub metric_id: i64,
    pub node_id: NodeId,
    pub signal_strength: f64,
    pub latency: f64,
    pub data_usage: f64,
    pub data_sent: Option<f64>,
    pub data_received: Option<f64>,
    pub metric_timestamp: Option<String>,
    pub recorded_at: String,
}

/// Connection wrapper shared by all ingestion workers
#[derive(Clone)]
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNodeStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;

        // WAL keeps readers from blocking the ingestion writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::from_connection(conn)?;
        info!("Opened node store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open an in-memory database (tests and dry runs)
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates the node for `mac`, or returns the existing one
    ///
    /// Provisioning happens outside the bridge. This exists for the startup
    /// seed list and for tests.
    pub fn provision_node(
        &self,
        node_id: Option<NodeId>,
        mac: &MacAddress,
    ) -> Result<NodeId, StoreError> {
        let conn = self.conn.lock();

        if let Some(existing) = conn
            .query_row(
                "SELECT node_id FROM node WHERE mac_address = ?1",
                params![mac.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(NodeId(existing));
        }

        conn.execute(
            "INSERT INTO node (node_id, mac_address, status) VALUES (?1, ?2, 'inactive')",
            params![node_id.map(|id| id.0), mac.as_str()],
        )?;
        let id = NodeId(conn.last_insert_rowid());
        debug!("Provisioned node {} for {}", id, mac);
        Ok(id)
    }

    /// Reads a node back by id
    pub fn node(&self, node_id: NodeId) -> Result<Option<Node>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT node_id, mac_address, status FROM node WHERE node_id = ?1",
                params![node_id.0],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, mac, status)) = row else {
            return Ok(None);
        };

        Ok(Some(Node {
            node_id: NodeId(id),
            mac_address: MacAddress::parse(&mac)
                .map_err(|e| StoreError::CorruptRow(format!("node {}: {}", id, e)))?,
            status: status
                .parse()
                .map_err(|e| StoreError::CorruptRow(format!("node {}: {}", id, e)))?,
        }))
    }

    /// All metric rows of a node, oldest first
    pub fn metrics_for_node(&self, node_id: NodeId) -> Result<Vec<StoredMetric>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT metric_id, node_id, signal_strength, latency, data_usage, data_sent,
                    data_received, metric_timestamp, recorded_at
             FROM performance_metrics WHERE node_id = ?1 ORDER BY metric_id",
        )?;

        let rows = stmt.query_map(params![node_id.0], |row| {
            Ok(StoredMetric {
                metric_id: row.get(0)?,
                node_id: NodeId(row.get(1)?),
                signal_strength: row.get(2)?,
                latency: row.get(3)?,
                data_usage: row.get(4)?,
                data_sent: row.get(5)?,
                data_received: row.get(6)?,
                metric_timestamp: row.get(7)?,
                recorded_at: row.get(8)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total number of metric rows
    pub fn metric_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM performance_metrics", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl NodeStore for SqliteNodeStore {
    fn find_node_by_mac(&self, mac: &MacAddress) -> Result<Option<NodeId>, StoreError> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT node_id FROM node WHERE mac_address = ?1 LIMIT 1",
                params![mac.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(NodeId))
    }

    fn update_node_status(&self, node_id: NodeId, status: NodeStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE node SET status = ?1 WHERE node_id = ?2",
            params![status.as_str(), node_id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::NodeNotFound(node_id));
        }
        Ok(())
    }

    fn insert_metric(&self, metric: &PerformanceMetric) -> Result<(), StoreError> {
        let recorded_at = chrono::Utc::now().to_rfc3339();
        let timestamp = metric
            .metric_timestamp
            .as_ref()
            .map(SenderTimestamp::to_string);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO performance_metrics
                (node_id, signal_strength, latency, data_usage, data_sent, data_received,
                 metric_timestamp, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metric.node_id.0,
                metric.signal_strength,
                metric.latency,
                metric.data_usage,
                metric.data_sent,
                metric.data_received,
                timestamp,
                recorded_at,
            ],
        )?;
        Ok(())
    }
}
