//! Channel and connector trait seams over a message broker.
//!
//! The traits model the small slice of broker behavior the coordination core
//! needs: declare topology, publish with envelope properties, consume with
//! explicit acks. Backends are swappable behind [`Connector`]; the in-process
//! implementation lives in [`crate::memory`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Connection establishment failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// The channel or its connection is gone
    #[error("channel closed")]
    Closed,

    /// Transport-level I/O failure
    #[error("transport error: {0}")]
    Io(String),

    /// An operation named an exchange or queue that was never declared
    #[error("not found: {0}")]
    NotFound(String),

    /// Queue is held exclusively by another connection
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Redeclaration with conflicting parameters
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl ChannelError {
    /// Whether this failure is transport-level and worth one reconnect.
    ///
    /// Protocol-level errors (unknown exchange, exclusivity violations) are
    /// caller bugs that a reconnect cannot fix.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed | Self::Io(_))
    }
}

/// Result type alias for transport operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// One copy to every bound queue, routing key ignored
    Fanout,
    /// To bound queues whose binding key matches exactly
    Direct,
}

/// Declaration parameters for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restarts and keeps messages while unconsumed
    pub durable: bool,
    /// Owned by one connection, deleted when that connection closes
    pub exclusive: bool,
}

impl QueueSpec {
    /// A durable, shared queue.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
        }
    }

    /// An exclusive, non-durable queue (claim replies).
    #[must_use]
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
        }
    }
}

/// Envelope properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Token pairing an RPC request with its reply
    pub correlation_id: Option<String>,
    /// Queue the receiver should reply to
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds
    pub expiration_ms: Option<u64>,
}

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exchange the message was routed through, `None` for a direct publish
    pub exchange: Option<String>,
    /// Routing key it was published under
    pub routing_key: String,
    /// Message body
    pub body: Vec<u8>,
    /// Envelope properties
    pub properties: PublishProperties,
    /// Tag to acknowledge this delivery with
    pub delivery_tag: u64,
}

/// A registered consumer on one queue.
///
/// Dropping the consumer (or cancelling its tag) stops delivery; messages
/// already queued stay on the broker.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Build a consumer from its tag and delivery stream (backend use).
    #[must_use]
    pub fn new(tag: String, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, receiver }
    }

    /// The consumer tag, used to cancel this consumer
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the underlying channel is gone; callers treat that
    /// as a transport failure and restart their consume cycle.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Operations available on one live broker channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare an exchange (idempotent).
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> ChannelResult<()>;

    /// Declare a queue (idempotent for identical parameters).
    async fn declare_queue(&self, spec: &QueueSpec) -> ChannelResult<()>;

    /// Bind a queue to an exchange under a routing key (idempotent).
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> ChannelResult<()>;

    /// Publish a message.
    ///
    /// `exchange = None` publishes directly to the queue named by
    /// `routing_key`; an unroutable direct publish is silently dropped.
    async fn publish(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> ChannelResult<()>;

    /// Start consuming a queue with a bounded prefetch.
    async fn consume(&self, queue: &str, prefetch: u16) -> ChannelResult<Consumer>;

    /// Acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> ChannelResult<()>;

    /// Cancel a consumer by tag.
    async fn cancel(&self, consumer_tag: &str) -> ChannelResult<()>;

    /// Close the channel, requeueing its unacknowledged deliveries.
    async fn close(&self) -> ChannelResult<()>;
}

/// Factory for live channels; the reconnect seam.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh connection + channel pair.
    async fn connect(&self) -> ChannelResult<Box<dyn Channel>>;
}
