//! Identity cache: MAC address → node id hints
//!
//! The cache is filled from registration traffic only, and only after the
//! MAC has been resolved against the store. It is never persisted and starts
//! empty after a restart.
//!
//! ```text
//! registration worker ──record()──► IdentityCache ◄──lookup()/available_node()── web layer
//! ```
//!
//! The cache is an owned handle (`Clone` shares the same map) that is passed
//! to whoever needs it. A single `RwLock` guards both the map and the
//! "most recent" pair, so a reader always sees both updated or neither.

use crate::node::{MacAddress, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors returned by cache reads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No registration has been observed yet; callers should report
    /// "service temporarily unavailable" instead of assigning a node
    #[error("no node has registered yet, identity hint unavailable")]
    Unavailable,
}

/// A MAC/node pair handed out as a registration hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssignment {
    pub mac_address: MacAddress,
    pub node_id: NodeId,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<MacAddress, NodeId>,
    latest: Option<NodeAssignment>,
}

/// Shared, cloneable handle to the identity map
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    inner: Arc<RwLock<CacheState>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resolved registration (last write wins)
    pub fn record(&self, mac_address: MacAddress, node_id: NodeId) {
        let mut state = self.inner.write();
        if let Some(previous) = state.entries.insert(mac_address.clone(), node_id) {
            if previous != node_id {
                warn!(
                    "MAC {} moved from node {} to node {}",
                    mac_address, previous, node_id
                );
            }
        }
        state.latest = Some(NodeAssignment {
            mac_address,
            node_id,
        });
        debug!("Identity cache now holds {} entries", state.entries.len());
    }

    pub fn lookup(&self, mac_address: &MacAddress) -> Option<NodeId> {
        self.inner.read().entries.get(mac_address).copied()
    }

    /// Most recently registered node, used as a hint by the web registration flow
    pub fn available_node(&self) -> Result<NodeAssignment, IdentityError> {
        match &self.inner.read().latest {
            Some(assignment) => Ok(assignment.clone()),
            None => {
                warn!("Identity cache is empty, no node MAC detected yet");
                Err(IdentityError::Unavailable)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(raw: &str) -> MacAddress {
        MacAddress::parse(raw).unwrap()
    }

    #[test]
    fn empty_cache_is_unavailable() {
        let cache = IdentityCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.available_node(), Err(IdentityError::Unavailable));
    }

    #[test]
    fn latest_registration_wins() {
        let cache = IdentityCache::new();
        cache.record(mac("AA:00:00:00:00:01"), NodeId(1));
        cache.record(mac("AA:00:00:00:00:02"), NodeId(2));

        let hint = cache.available_node().unwrap();
        assert_eq!(hint.mac_address, mac("AA:00:00:00:00:02"));
        assert_eq!(hint.node_id, NodeId(2));

        cache.record(mac("AA:00:00:00:00:01"), NodeId(1));
        assert_eq!(cache.available_node().unwrap().node_id, NodeId(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let cache = IdentityCache::new();
        let reader = cache.clone();
        cache.record(mac("AA:00:00:00:00:03"), NodeId(3));
        assert_eq!(reader.lookup(&mac("aa:00:00:00:00:03")), Some(NodeId(3)));
    }

    #[test]
    fn concurrent_writers_do_not_cross_contaminate() {
        let cache = IdentityCache::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mac = MacAddress::parse(&format!("BB:00:00:00:00:{:02X}", i)).unwrap();
                    for _ in 0..500 {
                        cache.record(mac.clone(), NodeId(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8 {
            let mac = MacAddress::parse(&format!("BB:00:00:00:00:{:02X}", i)).unwrap();
            assert_eq!(cache.lookup(&mac), Some(NodeId(i)));
        }
    }
}
