//! In-process transport backed by a tokio channel.

use std::collections::BTreeSet;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::protocol::{build_frame, split_frame};

use super::{Transport, TransportError};

/// Sender half used to inject frames, e.g. by a replay driver or a test.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: UnboundedSender<Vec<u8>>,
}

impl MemoryBus {
    /// Deliver one frame to the transport.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let frame =
            build_frame(topic, payload).map_err(|e| TransportError::InvalidTopic(e.to_string()))?;
        self.sender.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Subscriber-side prefix filtering, like a SUB socket.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: UnboundedReceiver<Vec<u8>>,
    subscriptions: BTreeSet<String>,
    published: Vec<(String, Vec<u8>)>,
    failing_subscriptions: bool,
    failing_publishes: BTreeSet<String>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryBus) {
        let (sender, inbound) = mpsc::unbounded_channel();
        let transport = Self {
            inbound,
            subscriptions: BTreeSet::new(),
            published: Vec::new(),
            failing_subscriptions: false,
            failing_publishes: BTreeSet::new(),
        };
        (transport, MemoryBus { sender })
    }

    /// Make subsequent subscribe calls fail.
    pub fn fail_subscriptions(&mut self, fail: bool) {
        self.failing_subscriptions = fail;
    }

    /// Make publishes on `topic` fail with `Closed`.
    pub fn fail_publishes_on(&mut self, topic: &str, fail: bool) {
        if fail {
            self.failing_publishes.insert(topic.to_string());
        } else {
            self.failing_publishes.remove(topic);
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    /// Everything published so far.
    pub fn published(&self) -> &[(String, Vec<u8>)] {
        &self.published
    }

    /// Published payloads on one topic.
    pub fn published_on<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.published
            .iter()
            .filter(move |(t, _)| t == topic)
            .map(|(_, payload)| payload.as_slice())
    }

    pub fn clear_published(&mut self) {
        self.published.clear();
    }

    fn accepts(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|s| topic.starts_with(s.as_str()))
    }
}

impl Transport for MemoryTransport {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if topic.contains(' ') {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        if self.failing_publishes.contains(topic) {
            return Err(TransportError::Closed);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self.failing_subscriptions {
            return Err(TransportError::Subscription {
                topic: topic.to_string(),
                reason: "socket not connected".to_string(),
            });
        }
        if topic.contains(' ') {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        self.subscriptions.insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.remove(topic);
        Ok(())
    }

    fn try_receive(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            let frame = match self.inbound.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            };

            match split_frame(&frame) {
                Ok((topic, payload)) if self.accepts(topic) => {
                    return Some((topic.to_string(), payload.to_vec()));
                }
                Ok((topic, _)) => {
                    debug!(topic = %topic, "Dropping frame for unsubscribed topic");
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_prefix_subscription_filters_frames() {
        let (mut transport, bus) = MemoryTransport::new();
        transport.subscribe("trade/M1/").unwrap();

        bus.deliver("trade/M2/S1", b"ignored").unwrap();
        bus.deliver("trade/M1/S1", b"kept").unwrap();

        let (topic, payload) = transport.try_receive().unwrap();
        assert_eq!(topic, "trade/M1/S1");
        assert_eq!(payload, b"kept");
        assert!(transport.try_receive().is_none());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (mut transport, bus) = MemoryTransport::new();
        transport.subscribe("sync/M1/S1").unwrap();
        transport.unsubscribe("sync/M1/S1").unwrap();

        bus.deliver("sync/M1/S1", b"{}").unwrap();
        assert!(transport.try_receive().is_none());
    }

    #[test]
    fn test_publish_records_and_validates_topic() {
        let (mut transport, _bus) = MemoryTransport::new();
        transport.publish("heartbeat", b"{}").unwrap();
        assert!(transport.publish("bad topic", b"{}").is_err());

        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.published_on("heartbeat").count(), 1);
    }

    #[test]
    fn test_failing_subscription() {
        let (mut transport, _bus) = MemoryTransport::new();
        transport.fail_subscriptions(true);
        assert!(matches!(
            transport.subscribe("trade/M1/S1"),
            Err(TransportError::Subscription { .. })
        ));
        assert!(!transport.is_subscribed("trade/M1/S1"));
    }

    #[test]
    fn test_failing_publish_on_one_topic() {
        let (mut transport, _bus) = MemoryTransport::new();
        transport.fail_publishes_on("heartbeat", true);

        let err = assert_err!(transport.publish("heartbeat", b"{}"));
        assert_eq!(err, TransportError::Closed);
        assert_ok!(transport.publish("report/S1", b"{}"));

        transport.fail_publishes_on("heartbeat", false);
        assert_ok!(transport.publish("heartbeat", b"{}"));
        assert_eq!(transport.published().len(), 2);
    }
}
