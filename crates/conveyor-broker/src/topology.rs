//! Declarative broker topology, replayed idempotently on every (re)connect.

use crate::channel::{Channel, ChannelResult, ExchangeKind, QueueSpec};

/// One queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Binding key (ignored by fanout exchanges)
    pub routing_key: String,
}

/// The fixed set of declarations a channel needs before use.
///
/// Declarations are ordered: exchanges, then queues, then bindings, so a
/// binding never references an undeclared peer.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<(String, ExchangeKind)>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
}

impl Topology {
    /// Create an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange declaration
    #[must_use]
    pub fn with_exchange(mut self, name: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchanges.push((name.into(), kind));
        self
    }

    /// Add a queue declaration
    #[must_use]
    pub fn with_queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Add a binding declaration
    #[must_use]
    pub fn with_binding(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.bindings.push(Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// Replay every declaration against a live channel.
    pub async fn declare(&self, channel: &dyn Channel) -> ChannelResult<()> {
        for (name, kind) in &self.exchanges {
            channel.declare_exchange(name, *kind).await?;
        }
        for spec in &self.queues {
            channel.declare_queue(spec).await?;
        }
        for binding in &self.bindings {
            channel
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn test_declare_orders_exchanges_before_bindings() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        let topology = Topology::new()
            .with_exchange("events", ExchangeKind::Fanout)
            .with_queue(QueueSpec::durable("work"))
            .with_binding("work", "events", "any");
        topology.declare(&channel).await.unwrap();
        assert_eq!(broker.binding_count("work"), 1);
    }

    #[tokio::test]
    async fn test_declare_twice_is_idempotent() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel();
        let topology = Topology::new()
            .with_exchange("events", ExchangeKind::Fanout)
            .with_queue(QueueSpec::durable("work"))
            .with_binding("work", "events", "any");
        topology.declare(&channel).await.unwrap();
        topology.declare(&channel).await.unwrap();
        assert_eq!(broker.binding_count("work"), 1);
    }
}
