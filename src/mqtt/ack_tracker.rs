//! Correlates QoS 1 publishes with broker PUBACKs
//!
//! rumqttc assigns packet ids inside the event loop, so a publisher does not
//! know its id when it enqueues a message. The receive loop reports every
//! `Outgoing::Publish(pkid)` in the order the requests left the client queue.
//! Publishers register their waiters in that same order (under the publisher
//! lock). The oldest unbound waiter therefore belongs to the next outgoing
//! packet id.
//!
//! ```text
//! register() ──► unbound (FIFO) ──on_outgoing(pkid)──► inflight[pkid] ──on_ack(pkid)──► waiter resolved
//! ```
//!
//! A packet id that is already inflight when it shows up again is a
//! retransmission after reconnect and must not consume another waiter.
//!
//! ## Packet id collisions
//!
//! When the next packet id is still unacknowledged, rumqttc holds the new
//! publish back and reports `Outgoing::AwaitAck(pkid)` instead. The waiter
//! is parked in `collided[pkid]`. Once the PUBACK for the older publish
//! arrives, rumqttc emits `Outgoing::Publish(pkid)` for the held publish
//! *before* the `PubAck(pkid)` itself:
//!
//! ```text
//! Publish(1) A · AwaitAck(1) B · Publish(1) B · PubAck(1) → A · PubAck(1) → B
//! ```
//!
//! The collided waiter is kept in `successors[pkid]` until the first ack
//! resolved the older waiter, then it takes over the inflight slot.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct AckState {
    unbound: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    collided: HashMap<u16, oneshot::Sender<()>>,
    successors: HashMap<u16, oneshot::Sender<()>>,
}

impl AckState {
    fn len(&self) -> usize {
        self.unbound.len() + self.inflight.len() + self.collided.len() + self.successors.len()
    }
}

#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a waiter for the next publish that leaves the client
    pub fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unbound.push_back(tx);
        rx
    }

    /// Removes the most recently registered, still unbound waiter
    ///
    /// Used when enqueueing the publish failed after `register`.
    pub fn withdraw_last(&self) {
        self.state.lock().unbound.pop_back();
    }

    /// rumqttc held back the next publish because `pkid` is still unacknowledged
    pub fn on_await_ack(&self, pkid: u16) {
        let mut state = self.state.lock();
        match state.unbound.pop_front() {
            Some(waiter) => {
                debug!("Publish waits for packet id {} to be acknowledged", pkid);
                state.collided.insert(pkid, waiter);
            }
            None => warn!("Held back publish {} has no registered waiter", pkid),
        }
    }

    /// A QoS 1 publish with `pkid` was written to the broker
    pub fn on_outgoing(&self, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(waiter) = state.collided.remove(&pkid) {
            // The older publish is acked right after this event
            if state.inflight.contains_key(&pkid) {
                state.successors.insert(pkid, waiter);
            } else {
                state.inflight.insert(pkid, waiter);
            }
            return;
        }
        if state.inflight.contains_key(&pkid) {
            debug!("Publish {} retransmitted", pkid);
            return;
        }
        match state.unbound.pop_front() {
            Some(waiter) => {
                state.inflight.insert(pkid, waiter);
            }
            None => warn!("Outgoing publish {} has no registered waiter", pkid),
        }
    }

    /// The broker acknowledged `pkid`
    pub fn on_ack(&self, pkid: u16) {
        let waiter = {
            let mut state = self.state.lock();
            let waiter = state.inflight.remove(&pkid);
            if let Some(successor) = state.successors.remove(&pkid) {
                state.inflight.insert(pkid, successor);
            }
            waiter
        };
        match waiter {
            // Receiver may have timed out already
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => debug!("PUBACK {} without a waiter", pkid),
        }
    }

    /// Drops every waiter; pending publishers observe a closed channel
    pub fn fail_all(&self) {
        let mut state = self.state.lock();
        let dropped = state.len();
        state.unbound.clear();
        state.inflight.clear();
        state.collided.clear();
        state.successors.clear();
        if dropped > 0 {
            warn!("Abandoned {} unacknowledged publishes", dropped);
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    #[test]
    fn waiters_bind_in_registration_order() {
        let tracker = AckTracker::new();
        let mut first = tracker.register();
        let mut second = tracker.register();

        tracker.on_outgoing(7);
        tracker.on_outgoing(8);
        tracker.on_ack(8);

        assert_eq!(second.try_recv(), Ok(()));
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));

        tracker.on_ack(7);
        assert_eq!(first.try_recv(), Ok(()));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn retransmission_does_not_consume_a_waiter() {
        let tracker = AckTracker::new();
        let mut first = tracker.register();
        tracker.on_outgoing(1);

        let mut second = tracker.register();
        // Reconnect replays pkid 1 before the new publish goes out
        tracker.on_outgoing(1);
        tracker.on_outgoing(2);

        tracker.on_ack(2);
        assert_eq!(second.try_recv(), Ok(()));
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn collided_publish_waits_for_its_own_ack() {
        let tracker = AckTracker::new();
        let mut first = tracker.register();
        tracker.on_outgoing(1);

        let mut second = tracker.register();
        tracker.on_await_ack(1);
        assert_eq!(tracker.pending(), 2);

        // rumqttc releases the held publish before reporting the ack
        tracker.on_outgoing(1);
        tracker.on_ack(1);
        assert_eq!(first.try_recv(), Ok(()));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(tracker.pending(), 1);

        let mut third = tracker.register();
        tracker.on_outgoing(2);
        tracker.on_ack(2);
        assert_eq!(third.try_recv(), Ok(()));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        tracker.on_ack(1);
        assert_eq!(second.try_recv(), Ok(()));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn collided_waiters_are_released_on_close() {
        let tracker = AckTracker::new();
        let _first = tracker.register();
        tracker.on_outgoing(4);
        let mut held = tracker.register();
        tracker.on_await_ack(4);

        tracker.fail_all();
        assert_eq!(held.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn withdraw_and_fail_all() {
        let tracker = AckTracker::new();
        let mut kept = tracker.register();
        let _withdrawn = tracker.register();
        tracker.withdraw_last();
        assert_eq!(tracker.pending(), 1);

        tracker.fail_all();
        assert_eq!(kept.try_recv(), Err(TryRecvError::Closed));
    }
}
