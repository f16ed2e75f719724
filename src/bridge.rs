//! Bridge Handle - wires the broker session, ingestion pool and publisher
//!
//! [`BridgeHandle::spawn`] starts three kinds of tasks on the current tokio
//! runtime:
//!
//! - the broker session (one task, owns the rumqttc event loop)
//! - the ingestion workers (one task per shard)
//! - the stats reporter (periodic log of the ingestion counters)
//!
//! All of them share one cancellation token. [`BridgeHandle::shutdown`]
//! cancels it, lets the session send DISCONNECT and waits for every task.
//!
//! The handle is the surface an embedding web layer uses: it hands out the
//! [`CommandPublisher`], the [`IdentityCache`] and a status watch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{BridgeConfig, ConfigError, ProvisionedNode};
use crate::identity::IdentityCache;
use crate::ingest::ingest_worker::IngestPool;
use crate::ingest::{IngestContext, IngestStats};
use crate::mqtt::ack_tracker::AckTracker;
use crate::mqtt::command_publisher::CommandPublisher;
use crate::mqtt::config::BrokerConfigError;
use crate::mqtt::message_manager::MessageRouter;
use crate::mqtt::mqtt_handler::{BrokerSession, EventDispatcher, SessionStatus};
use crate::persistence::node_store::SqliteNodeStore;
use crate::persistence::{NodeStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Broker setup failed: {0}")]
    Broker(#[from] BrokerConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub struct BridgeHandle {
    publisher: CommandPublisher,
    identity: IdentityCache,
    status: watch::Receiver<SessionStatus>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
    session: JoinHandle<()>,
    reporter: JoinHandle<()>,
    pool: IngestPool,
}

impl BridgeHandle {
    /// Starts the bridge; must be called from within a tokio runtime
    pub fn spawn(config: &BridgeConfig, store: Arc<dyn NodeStore>) -> Result<Self, BridgeError> {
        let cancel = CancellationToken::new();
        let identity = IdentityCache::new();

        let ctx = IngestContext::new(store, identity.clone(), config.ingest.retry_policy());
        let stats = ctx.stats.clone();
        let pool = IngestPool::spawn(ctx, config.ingest.pool_settings(), cancel.clone());

        let router = MessageRouter::new(pool.submitter(), stats.clone());
        let acks = Arc::new(AckTracker::new());
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let dispatcher = EventDispatcher::new(router, acks.clone(), status_tx);

        let session = match BrokerSession::configure(&config.broker, &config.reconnect, dispatcher)
        {
            Ok(session) => session,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        let publisher = CommandPublisher::new(
            Arc::new(session.client()),
            acks,
            status.clone(),
            config.publish.ack_timeout(),
        );

        let session = tokio::spawn(session.start().run(cancel.clone()));
        let reporter = tokio::spawn(report_stats(
            stats.clone(),
            status.clone(),
            Duration::from_secs(config.stats_interval_secs.max(1)),
            cancel.clone(),
        ));

        info!("Bridge started");
        Ok(Self {
            publisher,
            identity,
            status,
            stats,
            cancel,
            session,
            reporter,
            pool,
        })
    }

    pub fn publisher(&self) -> CommandPublisher {
        self.publisher.clone()
    }

    pub fn identity(&self) -> IdentityCache {
        self.identity.clone()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        self.cancel.cancel();

        if let Err(e) = self.session.await {
            error!("Broker session task failed: {}", e);
        }
        if let Err(e) = self.reporter.await {
            error!("Stats reporter task failed: {}", e);
        }
        self.pool.join().await;

        info!("Bridge stopped. Final stats: {:?}", self.stats.snapshot());
    }
}

/// Seeds the store with the nodes listed in the config
///
/// Returns how many nodes were newly inserted; MACs already present are left
/// untouched.
pub fn provision_nodes(
    store: &SqliteNodeStore,
    nodes: &[ProvisionedNode],
) -> Result<usize, BridgeError> {
    let mut inserted = 0;
    for node in nodes {
        let (node_id, mac) = node.parsed()?;
        if let Some(existing) = store.find_node_by_mac(&mac)? {
            debug!("MAC {} already provisioned as node {}", mac, existing);
            continue;
        }
        store.provision_node(node_id, &mac)?;
        inserted += 1;
    }
    Ok(inserted)
}

async fn report_stats(
    stats: Arc<IngestStats>,
    status: watch::Receiver<SessionStatus>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // First tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let s = stats.snapshot();
        let (state, reconnects) = {
            let status = status.borrow();
            (status.connection_state, status.reconnects)
        };
        info!(
            "Bridge stats: broker {:?} ({} reconnects), {} received, {} unknown topic, {} undecodable, {} dropped (saturated), registrations {} linked / {} unknown, metrics {} stored / {} unresolved, {} store failures",
            state,
            reconnects,
            s.messages_received,
            s.unknown_topic,
            s.decode_failures,
            s.dropped_saturated,
            s.registrations_linked,
            s.registrations_unknown,
            s.metrics_stored,
            s.metrics_unresolved,
            s.store_failures
        );
    }
}
