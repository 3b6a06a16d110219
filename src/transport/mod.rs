//! Message bus capability.
//!
//! The engine polls the transport once per tick and never blocks on it.

mod memory;

use thiserror::Error;

pub use memory::{MemoryBus, MemoryTransport};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("subscription failed for {topic}: {reason}")]
    Subscription { topic: String, reason: String },
    #[error("transport closed")]
    Closed,
}

/// Topic-addressed publish/subscribe.
pub trait Transport: Send {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Receive frames whose topic starts with `topic`.
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next inbound `(topic, payload)`, if one is ready.
    fn try_receive(&mut self) -> Option<(String, Vec<u8>)>;
}
