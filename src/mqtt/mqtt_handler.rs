//! Broker session and receive loop
//!
//! A [`BrokerSession`] owns the rumqttc event loop for the lifetime of the
//! bridge. It is built in the `Configured` state and moves to `Listening` when
//! started. From then on a single task polls the event loop until the
//! cancellation token fires.
//!
//! ## Event handling
//!
//! Every event is handed to the [`EventDispatcher`]:
//!
//! - `ConnAck` marks the session connected; the session then resubscribes
//! - inbound `Publish` goes to the [`MessageRouter`] (decode + enqueue only)
//! - `Outgoing::Publish`, `Outgoing::AwaitAck` and `PubAck` feed the [`AckTracker`]
//!
//! ## Reconnect
//!
//! A failed `poll()` marks the session `Reconnecting` and sleeps with
//! exponential backoff. The next `poll()` reconnects. The backoff resets on
//! the next `ConnAck`.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode};
use statum::{machine, state};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ack_tracker::AckTracker;
use super::config::{Backoff, BrokerConfigError, BrokerSettings, ReconnectSettings};
use super::message_manager::{MessageRouter, RouteError};
use super::Topic;

/// Number of recent errors kept in [`SessionStatus::error_messages`]
const ERROR_HISTORY: usize = 10;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: u64,
    pub publishes_acknowledged: u64,
    pub reconnects: u64,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl SessionStatus {
    fn push_error(&mut self, message: String) {
        if self.error_messages.len() == ERROR_HISTORY {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// What the session has to do after an event was dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Broker accepted the connection; subscriptions must be (re)issued
    Connected,
    Handled,
}

/// Applies broker events to the bridge state
///
/// Holds no reference to the event loop, so it can be driven directly
/// with constructed events.
pub struct EventDispatcher {
    router: MessageRouter,
    acks: Arc<AckTracker>,
    status: watch::Sender<SessionStatus>,
}

impl EventDispatcher {
    pub fn new(
        router: MessageRouter,
        acks: Arc<AckTracker>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        Self {
            router,
            acks,
            status,
        }
    }

    pub fn dispatch(&self, event: Event) -> Dispatched {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(
                    "Broker accepted connection (session present: {})",
                    ack.session_present
                );
                self.status.send_modify(|s| {
                    s.connection_state = ConnectionState::Connected;
                    s.last_activity = Some(chrono::Local::now());
                });
                return Dispatched::Connected;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.send_modify(|s| {
                    s.messages_received += 1;
                    s.last_activity = Some(chrono::Local::now());
                });
                match self.router.route(&publish.topic, &publish.payload) {
                    Ok(topic) => debug!("Queued message from {}", topic),
                    Err(e @ RouteError::Submit { .. }) => warn!("{}", e),
                    Err(e) => warn!("Ignoring message on {}: {}", publish.topic, e),
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.acks.on_ack(ack.pkid);
                self.status.send_modify(|s| s.publishes_acknowledged += 1);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                for code in &ack.return_codes {
                    match code {
                        SubscribeReasonCode::Success(qos) => {
                            debug!("Subscription {} granted at {:?}", ack.pkid, qos)
                        }
                        SubscribeReasonCode::Failure => {
                            warn!("Broker rejected subscription {}", ack.pkid);
                            self.status.send_modify(|s| {
                                s.push_error(format!("subscription {} rejected", ack.pkid))
                            });
                        }
                    }
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
                self.set_state(ConnectionState::Disconnected);
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.acks.on_outgoing(pkid),
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => self.acks.on_await_ack(pkid),
            Event::Incoming(packet) => debug!("Incoming {:?}", packet),
            Event::Outgoing(outgoing) => debug!("Outgoing {:?}", outgoing),
        }
        Dispatched::Handled
    }

    pub fn connection_lost(&self, reason: &str) {
        self.status.send_modify(|s| {
            if s.connection_state == ConnectionState::Connected {
                s.reconnects += 1;
            }
            s.connection_state = ConnectionState::Reconnecting;
            s.push_error(reason.to_string());
        });
    }

    /// Final state; every publisher still waiting is released
    pub fn closed(&self) {
        self.set_state(ConnectionState::Closed);
        self.acks.fail_all();
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.connection_state = state);
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|s| s.push_error(message));
    }
}

/// Where subscription requests go; the session uses its [`AsyncClient`]
pub trait SubscriptionSink {
    fn request_subscription(&self, topic: &str) -> Result<(), String>;
}

impl SubscriptionSink for AsyncClient {
    fn request_subscription(&self, topic: &str) -> Result<(), String> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| e.to_string())
    }
}

/// Requests every inbound topic at QoS 1; failures end up in the status
pub fn subscribe_topics(sink: &dyn SubscriptionSink, dispatcher: &EventDispatcher) {
    for topic in Topic::SUBSCRIBED {
        match sink.request_subscription(topic.name()) {
            Ok(()) => info!("Subscribed to {}", topic),
            Err(e) => {
                warn!("Could not subscribe to {}: {}", topic, e);
                dispatcher.record_error(format!("subscribe {} failed: {}", topic, e));
            }
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured,
    Listening,
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    client: AsyncClient,
    eventloop: EventLoop,
    dispatcher: EventDispatcher,
    backoff: Backoff,
    endpoint: String,
}

impl<S: SessionState> BrokerSession<S> {
    /// Client handle sharing this session's connection
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

impl BrokerSession<Configured> {
    pub fn configure(
        broker: &BrokerSettings,
        reconnect: &ReconnectSettings,
        dispatcher: EventDispatcher,
    ) -> Result<Self, BrokerConfigError> {
        let options = broker.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, broker.request_capacity.max(1));
        debug!(
            "Configured broker session {} as {}",
            broker.endpoint(),
            broker.client_id
        );

        Ok(Self::new(
            client,
            eventloop,
            dispatcher,
            Backoff::new(reconnect),
            broker.endpoint(),
        ))
    }

    pub fn start(self) -> BrokerSession<Listening> {
        info!("Connecting to broker at {} over TLS", self.endpoint);
        self.dispatcher.set_state(ConnectionState::Connecting);
        self.transition()
    }
}

impl BrokerSession<Listening> {
    /// Receive loop; returns after `cancel` fired and the session is closed
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if self.dispatcher.dispatch(event) == Dispatched::Connected {
                        self.backoff.reset();
                        subscribe_topics(&self.client, &self.dispatcher);
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Connection to {} failed: {}; retrying in {:?}",
                        self.endpoint, e, delay
                    );
                    self.dispatcher.connection_lost(&e.to_string());
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        if self.dispatcher.state() == ConnectionState::Connected {
            info!("Disconnecting from {}", self.endpoint);
            match self.client.try_disconnect() {
                Ok(()) => {
                    let eventloop = &mut self.eventloop;
                    let flush = async {
                        loop {
                            match eventloop.poll().await {
                                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    };
                    if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush)
                        .await
                        .is_err()
                    {
                        warn!("DISCONNECT not flushed within {:?}", DISCONNECT_FLUSH_TIMEOUT);
                    }
                }
                Err(e) => warn!("Could not request DISCONNECT: {}", e),
            }
        }

        self.dispatcher.closed();
        info!("Broker session closed");
    }
}
