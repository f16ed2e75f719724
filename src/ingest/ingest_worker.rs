//! Sharded ingestion worker pool
//!
//! Every worker owns a bounded queue. Jobs are assigned to a shard by hashing
//! the MAC address. Events from one node are therefore handled in delivery
//! order, while different nodes proceed in parallel. Submission never waits:
//! a full shard rejects the job and the receive loop moves on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::metrics::{ingest_metrics, MetricsOutcome};
use super::registration::{apply_registration, RegistrationOutcome};
use super::{IngestContext, IngestStats};
use crate::mqtt::message_manager::InboundMessage;
use crate::node::MacAddress;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("ingest shard {shard} is saturated")]
    Saturated { shard: usize },

    #[error("ingest pool is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// Cheap, cloneable sending side of the pool
#[derive(Clone)]
pub struct IngestSubmitter {
    shards: Arc<Vec<mpsc::Sender<InboundMessage>>>,
}

impl IngestSubmitter {
    fn shard_for(&self, mac: &MacAddress) -> usize {
        let mut hasher = DefaultHasher::new();
        mac.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub fn submit(&self, job: InboundMessage) -> Result<(), SubmitError> {
        let shard = self.shard_for(job.mac());
        match self.shards[shard].try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::Saturated { shard }),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }
}

pub struct IngestPool {
    submitter: IngestSubmitter,
    workers: Vec<JoinHandle<()>>,
}

impl IngestPool {
    pub fn spawn(ctx: IngestContext, settings: PoolSettings, cancel: CancellationToken) -> Self {
        let workers = settings.workers.max(1);
        let capacity = settings.queue_capacity.max(1);
        info!(
            "Spawning {} ingest workers with queue capacity {}",
            workers, capacity
        );

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                rx,
                ctx.clone(),
                cancel.clone(),
            )));
        }

        Self {
            submitter: IngestSubmitter {
                shards: Arc::new(senders),
            },
            workers: handles,
        }
    }

    pub fn submitter(&self) -> IngestSubmitter {
        self.submitter.clone()
    }

    /// Waits for all workers to stop
    ///
    /// Workers stop on cancellation, or once every submitter is dropped and
    /// their queues are drained.
    pub async fn join(self) {
        drop(self.submitter);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Ingest worker terminated abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<InboundMessage>,
    ctx: IngestContext,
    cancel: CancellationToken,
) {
    debug!("Ingest worker {} started", index);
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_job(&ctx, job).await;
    }
    debug!("Ingest worker {} stopped", index);
}

/// Runs one job to completion; failures are logged and counted, never returned
async fn process_job(ctx: &IngestContext, job: InboundMessage) {
    let stats = &ctx.stats;
    match job {
        InboundMessage::Registration(event) => {
            let mac = event.mac.clone();
            match apply_registration(ctx, event).await {
                Ok(RegistrationOutcome::Linked { .. }) => {
                    IngestStats::incr(&stats.registrations_linked)
                }
                Ok(RegistrationOutcome::UnknownDevice) => {
                    IngestStats::incr(&stats.registrations_unknown)
                }
                Err(e) => {
                    IngestStats::incr(&stats.store_failures);
                    error!("Registration for {} dropped: {}", mac, e);
                }
            }
        }
        InboundMessage::Metrics(report) => {
            let mac = report.mac.clone();
            match ingest_metrics(ctx, report).await {
                Ok(MetricsOutcome::Stored { .. }) => IngestStats::incr(&stats.metrics_stored),
                Ok(MetricsOutcome::Unresolved) => IngestStats::incr(&stats.metrics_unresolved),
                Err(e) => {
                    IngestStats::incr(&stats.store_failures);
                    error!("Metrics from {} dropped: {}", mac, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityCache;
    use crate::ingest::test_support::{fast_retry, FlakyStore};
    use crate::mqtt::message_manager::RegistrationEvent;
    use crate::node::{NodeId, NodeStatus};
    use crate::persistence::node_store::SqliteNodeStore;

    fn registration(mac: &MacAddress, active: bool) -> InboundMessage {
        InboundMessage::Registration(RegistrationEvent {
            mac: mac.clone(),
            active,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_registrations_resolve_independently() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let first = MacAddress::parse("CC:00:00:00:00:01").unwrap();
        let second = MacAddress::parse("CC:00:00:00:00:02").unwrap();
        let first_id = store.provision_node(Some(NodeId(100)), &first).unwrap();
        let second_id = store.provision_node(Some(NodeId(200)), &second).unwrap();

        let identity = IdentityCache::new();
        let ctx = IngestContext::new(Arc::new(store.clone()), identity.clone(), fast_retry(1));
        let pool = IngestPool::spawn(
            ctx,
            PoolSettings {
                workers: 4,
                queue_capacity: 64,
            },
            CancellationToken::new(),
        );

        let submitter = pool.submitter();
        for i in 0..20 {
            submitter.submit(registration(&first, i % 2 == 0)).unwrap();
            submitter.submit(registration(&second, i % 2 == 1)).unwrap();
        }
        drop(submitter);
        pool.join().await;

        assert_eq!(identity.lookup(&first), Some(first_id));
        assert_eq!(identity.lookup(&second), Some(second_id));

        // Per-MAC ordering: the last event for each MAC decides its status
        assert_eq!(store.node(first_id).unwrap().unwrap().status, NodeStatus::Inactive);
        assert_eq!(store.node(second_id).unwrap().unwrap().status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn full_shard_rejects_without_blocking() {
        let store = SqliteNodeStore::open_memory().unwrap();
        let ctx = IngestContext::new(Arc::new(store), IdentityCache::new(), fast_retry(1));
        let cancel = CancellationToken::new();
        let pool = IngestPool::spawn(
            ctx,
            PoolSettings {
                workers: 1,
                queue_capacity: 1,
            },
            cancel.clone(),
        );

        // Current-thread runtime: the worker cannot drain until we yield
        let submitter = pool.submitter();
        let mac = MacAddress::parse("CC:00:00:00:00:03").unwrap();
        submitter.submit(registration(&mac, true)).unwrap();
        assert_eq!(
            submitter.submit(registration(&mac, true)),
            Err(SubmitError::Saturated { shard: 0 })
        );

        cancel.cancel();
        pool.join().await;
        assert_eq!(
            submitter.submit(registration(&mac, true)),
            Err(SubmitError::Closed)
        );
    }

    #[tokio::test]
    async fn store_failure_does_not_stop_the_worker() {
        let sqlite = SqliteNodeStore::open_memory().unwrap();
        let mac = MacAddress::parse("CC:00:00:00:00:04").unwrap();
        let id = sqlite.provision_node(None, &mac).unwrap();

        // First job exhausts its single attempt, the second goes through
        let flaky = Arc::new(FlakyStore::new(sqlite.clone(), 1));
        let ctx = IngestContext::new(flaky, IdentityCache::new(), fast_retry(1));
        let stats = ctx.stats.clone();
        let pool = IngestPool::spawn(ctx, PoolSettings::default(), CancellationToken::new());

        let submitter = pool.submitter();
        submitter.submit(registration(&mac, true)).unwrap();
        submitter.submit(registration(&mac, true)).unwrap();
        drop(submitter);
        pool.join().await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.store_failures, 1);
        assert_eq!(snapshot.registrations_linked, 1);
        assert_eq!(sqlite.node(id).unwrap().unwrap().status, NodeStatus::Active);
    }
}
