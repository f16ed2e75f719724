//! Outbound command publishing
//!
//! Commands go to [`COMMAND_TOPIC`] at QoS 1 over the bridge's shared broker
//! connection. [`CommandPublisher::publish`] returns only after the broker has
//! acknowledged the message, or fails with a [`PublishError`]. Retrying is
//! left to the caller.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ack_tracker::AckTracker;
use super::mqtt_handler::{ConnectionState, SessionStatus};
use super::COMMAND_TOPIC;

/// Command addressed to a node (by node id or MAC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    pub target: String,
}

impl Command {
    pub fn new(cmd: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            target: target.into(),
        }
    }

    fn validate(&self) -> Result<(), PublishError> {
        if self.cmd.trim().is_empty() {
            return Err(PublishError::InvalidCommand("cmd is empty"));
        }
        if self.target.trim().is_empty() {
            return Err(PublishError::InvalidCommand("target is empty"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker connection is not established")]
    NotConnected,

    #[error("could not enqueue publish: {0}")]
    Enqueue(String),

    #[error("broker did not acknowledge within {0:?}")]
    AckTimeout(Duration),

    #[error("broker session closed before acknowledgment")]
    ConnectionClosed,
}

/// Transport seam for the publisher
///
/// Implementations must not block: the call only hands the message to the
/// client's request queue.
pub trait PublishSink: Send + Sync + 'static {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), String>;
}

impl PublishSink for AsyncClient {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| e.to_string())
    }
}

struct PublisherInner {
    sink: Arc<dyn PublishSink>,
    acks: Arc<AckTracker>,
    status: watch::Receiver<SessionStatus>,
    ack_timeout: Duration,
    // Keeps register() and enqueue() in the same order across callers
    enqueue_lock: Mutex<()>,
}

/// Cloneable handle for publishing commands
#[derive(Clone)]
pub struct CommandPublisher {
    inner: Arc<PublisherInner>,
}

impl CommandPublisher {
    pub fn new(
        sink: Arc<dyn PublishSink>,
        acks: Arc<AckTracker>,
        status: watch::Receiver<SessionStatus>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                sink,
                acks,
                status,
                ack_timeout,
                enqueue_lock: Mutex::new(()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().connection_state == ConnectionState::Connected
    }

    /// Publishes `command` and waits for the broker acknowledgment
    pub async fn publish(&self, command: &Command) -> Result<(), PublishError> {
        command.validate()?;
        let payload = serde_json::to_vec(command)?;

        if !self.is_connected() {
            warn!(
                "Rejecting command {} for {}: broker not connected",
                command.cmd, command.target
            );
            return Err(PublishError::NotConnected);
        }

        let ack = {
            let _guard = self.inner.enqueue_lock.lock();
            let ack = self.inner.acks.register();
            if let Err(e) = self.inner.sink.enqueue(COMMAND_TOPIC, payload) {
                self.inner.acks.withdraw_last();
                return Err(PublishError::Enqueue(e));
            }
            ack
        };
        debug!(
            "Command {} for {} enqueued, awaiting PUBACK",
            command.cmd, command.target
        );

        match tokio::time::timeout(self.inner.ack_timeout, ack).await {
            Ok(Ok(())) => {
                info!(
                    "Published command {} to {} for {}",
                    command.cmd, COMMAND_TOPIC, command.target
                );
                Ok(())
            }
            Ok(Err(_)) => Err(PublishError::ConnectionClosed),
            Err(_) => {
                warn!(
                    "Command {} for {} not acknowledged within {:?}",
                    command.cmd, command.target, self.inner.ack_timeout
                );
                Err(PublishError::AckTimeout(self.inner.ack_timeout))
            }
        }
    }
}
