//! Ingestion of decoded node events
//!
//! Two paths share one worker pool:
//!
//! 1. [`registration`] - resolve MAC, update the identity cache and node status
//! 2. [`metrics`] - resolve MAC, append a performance record
//!
//! # Architecture
//!
//! ```text
//! MessageRouter ──try_send──► IngestPool shard (by MAC) ──► worker ──spawn_blocking──► NodeStore
//!                                                              └──► IdentityCache
//! ```
//!
//! Store calls are the only operations on this path that may block. They run
//! on the blocking thread pool with a bounded retry for transient failures.

pub mod ingest_worker;
pub mod metrics;
pub mod registration;

use crate::identity::IdentityCache;
use crate::persistence::{NodeStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Errors that end processing of a single job
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Store {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Bounded retry for transient store failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub attempts: u32,
    /// Delay before the first retry, doubled after every further failure
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Counters for the periodic stats log
#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub unknown_topic: AtomicU64,
    pub decode_failures: AtomicU64,
    pub dropped_saturated: AtomicU64,
    pub registrations_linked: AtomicU64,
    pub registrations_unknown: AtomicU64,
    pub metrics_stored: AtomicU64,
    pub metrics_unresolved: AtomicU64,
    pub store_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub messages_received: u64,
    pub unknown_topic: u64,
    pub decode_failures: u64,
    pub dropped_saturated: u64,
    pub registrations_linked: u64,
    pub registrations_unknown: u64,
    pub metrics_stored: u64,
    pub metrics_unresolved: u64,
    pub store_failures: u64,
}

impl IngestStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            unknown_topic: self.unknown_topic.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped_saturated: self.dropped_saturated.load(Ordering::Relaxed),
            registrations_linked: self.registrations_linked.load(Ordering::Relaxed),
            registrations_unknown: self.registrations_unknown.load(Ordering::Relaxed),
            metrics_stored: self.metrics_stored.load(Ordering::Relaxed),
            metrics_unresolved: self.metrics_unresolved.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs to process a job
#[derive(Clone)]
pub struct IngestContext {
    pub store: Arc<dyn NodeStore>,
    pub identity: IdentityCache,
    pub retry: RetryPolicy,
    pub stats: Arc<IngestStats>,
}

impl IngestContext {
    pub fn new(store: Arc<dyn NodeStore>, identity: IdentityCache, retry: RetryPolicy) -> Self {
        Self {
            store,
            identity,
            retry,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Runs one store statement on the blocking pool, retrying transient failures
    pub(crate) async fn store_op<T, F>(
        &self,
        operation: &'static str,
        op: F,
    ) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: Fn(&dyn NodeStore) -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            let store = self.store.clone();
            let op = op.clone();
            let result = match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
                Ok(result) => result,
                Err(e) => Err(StoreError::TaskFailed(e.to_string())),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, attempts, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(IngestError::Store {
                        operation,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::node::{MacAddress, NodeId, NodeStatus, PerformanceMetric};
    use crate::persistence::node_store::SqliteNodeStore;
    use std::sync::atomic::AtomicU32;

    /// Store that fails the first `failures` calls with a transient error
    pub struct FlakyStore {
        pub inner: SqliteNodeStore,
        pub remaining_failures: AtomicU32,
        pub calls: AtomicU32,
    }

    impl FlakyStore {
        pub fn new(inner: SqliteNodeStore, failures: u32) -> Self {
            Self {
                inner,
                remaining_failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn gate(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("simulated outage".into()));
            }
            Ok(())
        }
    }

    impl NodeStore for FlakyStore {
        fn find_node_by_mac(&self, mac: &MacAddress) -> Result<Option<NodeId>, StoreError> {
            self.gate()?;
            self.inner.find_node_by_mac(mac)
        }

        fn update_node_status(&self, node_id: NodeId, status: NodeStatus) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.update_node_status(node_id, status)
        }

        fn insert_metric(&self, metric: &PerformanceMetric) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.insert_metric(metric)
        }
    }

    pub fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::node::MacAddress;
    use crate::persistence::node_store::SqliteNodeStore;

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sqlite = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("AA:BB:CC:00:00:10").unwrap();
        let id = sqlite.provision_node(None, &mac).unwrap();

        let flaky = Arc::new(FlakyStore::new(sqlite, 2));
        let ctx = IngestContext::new(flaky.clone(), IdentityCache::new(), fast_retry(3));

        let lookup_mac = mac.clone();
        let found = ctx
            .store_op("find node", move |store| store.find_node_by_mac(&lookup_mac))
            .await
            .unwrap();
        assert_eq!(found, Some(id));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let flaky = Arc::new(FlakyStore::new(SqliteNodeStore::open_memory().unwrap(), 10));
        let ctx = IngestContext::new(flaky.clone(), IdentityCache::new(), fast_retry(2));

        let mac = MacAddress::parse("AA:BB:CC:00:00:11").unwrap();
        let err = ctx
            .store_op("find node", move |store| store.find_node_by_mac(&mac))
            .await
            .unwrap_err();

        let IngestError::Store { attempts, .. } = err;
        assert_eq!(attempts, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }
}
