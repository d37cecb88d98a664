//! Transparent reconnect wrapper around a broker channel.
//!
//! `RecoveringChannel` owns the only reference to the live channel; callers
//! never hold one across a reconnect. Every operation gets exactly one
//! retry after a transport failure: close the stale channel (ignoring close
//! errors), reconnect, replay the topology, try again. A second failure
//! propagates unchanged. Backoff, if any, belongs to the caller.

use tokio::sync::Mutex;

use crate::{
    channel::{
        Channel, ChannelError, ChannelResult, Connector, Consumer, PublishProperties, QueueSpec,
    },
    topology::Topology,
};

/// One retryable transport operation, borrowed from the caller so a retry
/// replays exactly the same call.
enum Op<'a> {
    Publish {
        exchange: Option<&'a str>,
        routing_key: &'a str,
        body: &'a [u8],
        properties: &'a PublishProperties,
    },
    DeclareQueue(&'a QueueSpec),
    Ack(u64),
    Cancel(&'a str),
}

impl Op<'_> {
    async fn run(&self, channel: &dyn Channel) -> ChannelResult<()> {
        match self {
            Self::Publish {
                exchange,
                routing_key,
                body,
                properties,
            } => {
                channel
                    .publish(*exchange, routing_key, body.to_vec(), (*properties).clone())
                    .await
            }
            Self::DeclareQueue(spec) => channel.declare_queue(spec).await,
            Self::Ack(delivery_tag) => channel.ack(*delivery_tag).await,
            Self::Cancel(consumer_tag) => channel.cancel(consumer_tag).await,
        }
    }
}

/// A channel that appears never to fail to its callers.
pub struct RecoveringChannel {
    connector: Box<dyn Connector>,
    topology: Topology,
    inner: Mutex<Option<Box<dyn Channel>>>,
}

impl RecoveringChannel {
    /// Wrap a connector, replaying `topology` on every (re)connect.
    #[must_use]
    pub fn new(connector: Box<dyn Connector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
            inner: Mutex::new(None),
        }
    }

    /// Establish the connection and declare the topology if not already
    /// ready. Safe to call repeatedly.
    pub async fn ensure_ready(&self) -> ChannelResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            let channel = self.connector.connect().await?;
            self.topology.declare(channel.as_ref()).await?;
            *guard = Some(channel);
            tracing::info!("transport channel ready, topology declared");
        }
        Ok(())
    }

    /// Close and discard the current channel, ignoring errors met while
    /// closing a connection that is already half dead.
    async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(channel) = guard.take() {
            let _ = channel.close().await;
        }
    }

    async fn attempt(&self, op: &Op<'_>) -> ChannelResult<()> {
        self.ensure_ready().await?;
        let guard = self.inner.lock().await;
        match guard.as_deref() {
            Some(channel) => op.run(channel).await,
            None => Err(ChannelError::Closed),
        }
    }

    /// Run one transport operation with the single-retry budget.
    async fn call(&self, op: Op<'_>) -> ChannelResult<()> {
        match self.attempt(&op).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transport() => {
                tracing::info!(
                    error = %err,
                    "transport call failed, reconnecting and retrying once"
                );
                self.reset().await;
                self.attempt(&op).await
            }
            Err(err) => Err(err),
        }
    }

    /// Publish a message, reconnecting once on failure.
    pub async fn publish(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> ChannelResult<()> {
        self.call(Op::Publish {
            exchange,
            routing_key,
            body: &body,
            properties: &properties,
        })
        .await
    }

    /// Declare a queue, reconnecting once on failure.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> ChannelResult<()> {
        self.call(Op::DeclareQueue(spec)).await
    }

    /// Acknowledge a delivery, reconnecting once on failure.
    pub async fn ack(&self, delivery_tag: u64) -> ChannelResult<()> {
        self.call(Op::Ack(delivery_tag)).await
    }

    /// Cancel a consumer, reconnecting once on failure.
    pub async fn cancel(&self, consumer_tag: &str) -> ChannelResult<()> {
        self.call(Op::Cancel(consumer_tag)).await
    }

    /// Start a consumer, reconnecting once on failure.
    ///
    /// The returned consumer is bound to the channel that created it; after
    /// a later reconnect its stream ends and the caller restarts its consume
    /// cycle.
    pub async fn consume(&self, queue: &str, prefetch: u16) -> ChannelResult<Consumer> {
        match self.attempt_consume(queue, prefetch).await {
            Ok(consumer) => Ok(consumer),
            Err(err) if err.is_transport() => {
                tracing::info!(
                    error = %err,
                    "consume failed, reconnecting and retrying once"
                );
                self.reset().await;
                self.attempt_consume(queue, prefetch).await
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt_consume(&self, queue: &str, prefetch: u16) -> ChannelResult<Consumer> {
        self.ensure_ready().await?;
        let guard = self.inner.lock().await;
        match guard.as_deref() {
            Some(channel) => channel.consume(queue, prefetch).await,
            None => Err(ChannelError::Closed),
        }
    }
}

impl std::fmt::Debug for RecoveringChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringChannel").finish_non_exhaustive()
    }
}
