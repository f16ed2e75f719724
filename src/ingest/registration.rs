//! Registration path: resolve a node and record its identity and liveness

use super::{IngestContext, IngestError};
use crate::mqtt::message_manager::RegistrationEvent;
use crate::node::{NodeId, NodeStatus};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// MAC resolved; cache updated and status written
    Linked { node_id: NodeId, status: NodeStatus },
    /// MAC not provisioned yet; nothing was written
    UnknownDevice,
}

/// Applies one registration event
///
/// The identity cache is written only after the store confirmed the MAC.
/// Unknown devices are an expected condition and produce no writes at all.
pub async fn apply_registration(
    ctx: &IngestContext,
    event: RegistrationEvent,
) -> Result<RegistrationOutcome, IngestError> {
    let mac = event.mac.clone();
    let node_id = ctx
        .store_op("resolve registration MAC", move |store| {
            store.find_node_by_mac(&mac)
        })
        .await?;

    let Some(node_id) = node_id else {
        info!("MAC {} not found in store, registration ignored", event.mac);
        return Ok(RegistrationOutcome::UnknownDevice);
    };

    ctx.identity.record(event.mac.clone(), node_id);
    info!("MAC {} linked to node {}", event.mac, node_id);

    let status = NodeStatus::from_active_flag(event.active);
    ctx.store_op("update node status", move |store| {
        store.update_node_status(node_id, status)
    })
    .await?;

    info!("Node {} ({}) marked as {}", node_id, event.mac, status);
    Ok(RegistrationOutcome::Linked { node_id, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityCache;
    use crate::ingest::test_support::fast_retry;
    use crate::node::MacAddress;
    use crate::persistence::node_store::SqliteNodeStore;
    use std::sync::Arc;

    fn ctx(store: &SqliteNodeStore) -> IngestContext {
        IngestContext::new(Arc::new(store.clone()), IdentityCache::new(), fast_retry(1))
    }

    #[tokio::test]
    async fn known_mac_updates_cache_and_status() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let id = store.provision_node(Some(NodeId(11)), &mac).unwrap();
        let ctx = ctx(&store);

        let outcome = apply_registration(
            &ctx,
            RegistrationEvent {
                mac: mac.clone(),
                active: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            RegistrationOutcome::Linked {
                node_id: id,
                status: NodeStatus::Active
            }
        );
        assert_eq!(ctx.identity.lookup(&mac), Some(id));
        assert_eq!(store.node(id).unwrap().unwrap().status, NodeStatus::Active);

        apply_registration(&ctx, RegistrationEvent { mac, active: false })
            .await
            .unwrap();
        assert_eq!(store.node(id).unwrap().unwrap().status, NodeStatus::Inactive);
    }

    #[tokio::test]
    async fn unknown_mac_writes_nothing() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let known = MacAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        let id = store.provision_node(None, &known).unwrap();
        let ctx = ctx(&store);

        let outcome = apply_registration(
            &ctx,
            RegistrationEvent {
                mac: MacAddress::parse("AA:BB:CC:DD:EE:99").unwrap(),
                active: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, RegistrationOutcome::UnknownDevice);
        assert!(ctx.identity.is_empty());
        assert_eq!(store.node(id).unwrap().unwrap().status, NodeStatus::Inactive);
    }
}
