//! Metrics path: resolve a node and append one performance record
//!
//! Resolution goes to the store, not the identity cache. A node may report
//! metrics without a registration since the last restart.

use super::{IngestContext, IngestError};
use crate::mqtt::message_manager::MetricsReport;
use crate::node::NodeId;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsOutcome {
    Stored { node_id: NodeId },
    /// MAC is not provisioned; the sample was discarded
    Unresolved,
}

pub async fn ingest_metrics(
    ctx: &IngestContext,
    report: MetricsReport,
) -> Result<MetricsOutcome, IngestError> {
    let mac = report.mac.clone();
    let node_id = ctx
        .store_op("resolve metrics MAC", move |store| store.find_node_by_mac(&mac))
        .await?;

    let Some(node_id) = node_id else {
        info!("MAC {} not recognized, metrics discarded", report.mac);
        return Ok(MetricsOutcome::Unresolved);
    };

    let mac = report.mac.clone();
    let metric = report.into_metric(node_id);
    ctx.store_op("insert performance metric", move |store| {
        store.insert_metric(&metric)
    })
    .await?;

    info!("Stored metrics for node {} from MAC {}", node_id, mac);
    Ok(MetricsOutcome::Stored { node_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityCache;
    use crate::ingest::test_support::{fast_retry, FlakyStore};
    use crate::node::{MacAddress, SenderTimestamp};
    use crate::persistence::node_store::SqliteNodeStore;
    use std::sync::Arc;

    fn report(mac: &MacAddress) -> MetricsReport {
        MetricsReport {
            mac: mac.clone(),
            signal_strength: -72.0,
            latency: 31.0,
            data_usage: 900.0,
            data_sent: Some(400.0),
            data_received: Some(500.0),
            timestamp: Some(SenderTimestamp::Integer(1_715_000_000)),
        }
    }

    #[tokio::test]
    async fn resolved_report_creates_exactly_one_record() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("AA:BB:CC:00:00:20").unwrap();
        let id = store.provision_node(None, &mac).unwrap();
        let ctx = IngestContext::new(Arc::new(store.clone()), IdentityCache::new(), fast_retry(1));

        let outcome = ingest_metrics(&ctx, report(&mac)).await.unwrap();
        assert_eq!(outcome, MetricsOutcome::Stored { node_id: id });

        let rows = store.metrics_for_node(id).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.signal_strength, -72.0);
        assert_eq!(row.latency, 31.0);
        assert_eq!(row.data_usage, 900.0);
        assert_eq!(row.data_sent, Some(400.0));
        assert_eq!(row.data_received, Some(500.0));
        assert_eq!(row.metric_timestamp.as_deref(), Some("1715000000"));

        // The cache is not consulted or filled by metrics
        assert!(ctx.identity.is_empty());
    }

    #[tokio::test]
    async fn redelivery_appends_a_second_record() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("AA:BB:CC:00:00:21").unwrap();
        let id = store.provision_node(None, &mac).unwrap();
        let ctx = IngestContext::new(Arc::new(store.clone()), IdentityCache::new(), fast_retry(1));

        ingest_metrics(&ctx, report(&mac)).await.unwrap();
        ingest_metrics(&ctx, report(&mac)).await.unwrap();

        assert_eq!(store.metrics_for_node(id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unresolved_mac_is_discarded() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let ctx = IngestContext::new(Arc::new(store.clone()), IdentityCache::new(), fast_retry(1));

        let mac = MacAddress::parse("AA:BB:CC:00:00:22").unwrap();
        let outcome = ingest_metrics(&ctx, report(&mac)).await.unwrap();

        assert_eq!(outcome, MetricsOutcome::Unresolved);
        assert_eq!(store.metric_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_outage_is_absorbed_by_retry() {
        let sqlite = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("AA:BB:CC:00:00:23").unwrap();
        let id = sqlite.provision_node(None, &mac).unwrap();
        let flaky = Arc::new(FlakyStore::new(sqlite.clone(), 1));
        let ctx = IngestContext::new(flaky, IdentityCache::new(), fast_retry(3));

        let outcome = ingest_metrics(&ctx, report(&mac)).await.unwrap();
        assert_eq!(outcome, MetricsOutcome::Stored { node_id: id });
        assert_eq!(sqlite.metrics_for_node(id).unwrap().len(), 1);
    }
}
