//! In-process broker backend.
//!
//! Implements the [`Channel`]/[`Connector`] seams over shared in-memory
//! state: fanout and direct exchanges, durable/exclusive queues, explicit
//! acks with requeue-on-close, and failure injection for reconnect tests.
//!
//! Semantics follow the AMQP defaults the protocol relies on: declarations
//! are idempotent, fanout ignores routing keys, a direct publish to a queue
//! nobody declared is silently dropped, and exclusive queues die with the
//! channel that declared them.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{
    Channel, ChannelError, ChannelResult, Connector, Consumer, Delivery, ExchangeKind,
    PublishProperties, QueueSpec,
};

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, routing key) pairs; fanout ignores the key
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    exclusive_owner: Option<u64>,
    buffer: VecDeque<Delivery>,
    consumers: Vec<ConsumerHandle>,
    /// Round-robin cursor so queue consumers share deliveries fairly
    rr_cursor: usize,
}

#[derive(Debug)]
struct ConsumerHandle {
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct PendingAck {
    queue: String,
    channel_id: u64,
    consumer_tag: String,
    delivery: Delivery,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, PendingAck>,
    open_channels: HashSet<u64>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    next_consumer_id: u64,
    fail_ops: u32,
    connects: u64,
}

/// Shared in-process broker.
///
/// Cheap to clone; every clone sees the same exchanges and queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel directly (tests and stubs).
    #[must_use]
    pub fn open_channel(&self) -> MemoryChannel {
        let mut state = self.lock();
        state.next_channel_id += 1;
        state.connects += 1;
        let id = state.next_channel_id;
        state.open_channels.insert(id);
        MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// A connector producing channels on this broker.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// Make the next `count` channel operations fail, tearing down the
    /// channel they ran on (simulates a dropped socket).
    pub fn inject_failures(&self, count: u32) {
        self.lock().fail_ops = count;
    }

    /// How many channels have been opened so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Messages currently buffered on a queue.
    #[must_use]
    pub fn queued(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.buffer.len())
    }

    /// Bindings currently pointing at a queue, across all exchanges.
    #[must_use]
    pub fn binding_count(&self, queue: &str) -> usize {
        self.lock()
            .exchanges
            .values()
            .flat_map(|exchange| exchange.bindings.iter())
            .filter(|(bound, _)| bound == queue)
            .count()
    }

    /// Whether a queue exists
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Close every open channel, requeueing unacknowledged deliveries
    /// (simulates a broker restart from the clients' point of view).
    pub fn kill_channels(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.open_channels.iter().copied().collect();
        for id in ids {
            close_channel(&mut state, id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One live channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail-injection check plus liveness check, run before every operation.
    fn guard_op(&self, state: &mut BrokerState) -> ChannelResult<()> {
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            close_channel(state, self.id);
            return Err(ChannelError::Io("injected transport failure".to_string()));
        }
        if !state.open_channels.contains(&self.id) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

/// Tear down one channel: drop its consumers, requeue its unacked
/// deliveries, delete its exclusive queues.
fn close_channel(state: &mut BrokerState, id: u64) {
    if !state.open_channels.remove(&id) {
        return;
    }
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel_id != id);
    }
    let requeue: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, pending)| pending.channel_id == id)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in requeue {
        if let Some(pending) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&pending.queue) {
                queue.buffer.push_front(pending.delivery);
            }
        }
    }
    state
        .queues
        .retain(|_, queue| queue.exclusive_owner != Some(id));
}

/// Remove consumers whose receiver is gone and requeue what they never
/// acknowledged, so a dropped consumer cannot strand deliveries.
fn reap_dead_consumers(state: &mut BrokerState, queue_name: &str) {
    let mut dead_tags = Vec::new();
    if let Some(queue) = state.queues.get_mut(queue_name) {
        for consumer in &queue.consumers {
            if consumer.sender.is_closed() {
                dead_tags.push(consumer.tag.clone());
            }
        }
        queue.consumers.retain(|c| !c.sender.is_closed());
    }
    for tag in dead_tags {
        requeue_for_consumer(state, &tag);
    }
}

/// Requeue every unacknowledged delivery handed to one consumer.
fn requeue_for_consumer(state: &mut BrokerState, consumer_tag: &str) {
    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, pending)| pending.consumer_tag == consumer_tag)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in tags {
        if let Some(pending) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&pending.queue) {
                queue.buffer.push_front(pending.delivery);
            }
        }
    }
}

/// Hand a delivery to the queue's next live consumer (round-robin), or
/// buffer it.
fn deliver(state: &mut BrokerState, queue_name: &str, delivery: Delivery) {
    reap_dead_consumers(state, queue_name);
    let mut pending = None;
    if let Some(queue) = state.queues.get_mut(queue_name) {
        if queue.consumers.is_empty() {
            queue.buffer.push_back(delivery);
        } else {
            let index = queue.rr_cursor % queue.consumers.len();
            queue.rr_cursor = queue.rr_cursor.wrapping_add(1);
            let consumer = &queue.consumers[index];
            if consumer.sender.send(delivery.clone()).is_ok() {
                pending = Some(PendingAck {
                    queue: queue_name.to_string(),
                    channel_id: consumer.channel_id,
                    consumer_tag: consumer.tag.clone(),
                    delivery,
                });
            } else {
                queue.buffer.push_back(delivery);
            }
        }
    }
    if let Some(pending) = pending {
        state.unacked.insert(pending.delivery.delivery_tag, pending);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(ChannelError::Precondition(format!(
                "exchange '{name}' already declared with a different kind"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        let channel_id = self.id;
        match state.queues.get(&spec.name) {
            Some(existing) => {
                if let Some(owner) = existing.exclusive_owner {
                    if owner != channel_id {
                        return Err(ChannelError::ResourceLocked(format!(
                            "queue '{}' is exclusively owned by another connection",
                            spec.name
                        )));
                    }
                }
                if existing.durable != spec.durable {
                    return Err(ChannelError::Precondition(format!(
                        "queue '{}' already declared with different durability",
                        spec.name
                    )));
                }
                Ok(())
            }
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        durable: spec.durable,
                        exclusive_owner: spec.exclusive.then_some(channel_id),
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        if !state.queues.contains_key(queue) {
            return Err(ChannelError::NotFound(format!("queue '{queue}'")));
        }
        let Some(exchange_state) = state.exchanges.get_mut(exchange) else {
            return Err(ChannelError::NotFound(format!("exchange '{exchange}'")));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        let destinations: Vec<String> = match exchange {
            None | Some("") => {
                // Default-exchange semantics: unroutable publishes are dropped.
                if state.queues.contains_key(routing_key) {
                    vec![routing_key.to_string()]
                } else {
                    Vec::new()
                }
            }
            Some(name) => {
                let Some(exchange_state) = state.exchanges.get(name) else {
                    return Err(ChannelError::NotFound(format!("exchange '{name}'")));
                };
                let mut seen = HashSet::new();
                exchange_state
                    .bindings
                    .iter()
                    .filter(|(_, key)| {
                        exchange_state.kind == ExchangeKind::Fanout || key == routing_key
                    })
                    .filter(|(queue, _)| seen.insert(queue.clone()))
                    .map(|(queue, _)| queue.clone())
                    .collect()
            }
        };
        let exchange_name = exchange.filter(|name| !name.is_empty()).map(String::from);
        for destination in destinations {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                exchange: exchange_name.clone(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                properties: properties.clone(),
                delivery_tag: state.next_delivery_tag,
            };
            deliver(&mut state, &destination, delivery);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> ChannelResult<Consumer> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        if !state.queues.contains_key(queue) {
            return Err(ChannelError::NotFound(format!("queue '{queue}'")));
        }
        reap_dead_consumers(&mut state, queue);
        state.next_consumer_id += 1;
        let tag = format!("ctag-{}", state.next_consumer_id);
        let (sender, receiver) = mpsc::unbounded_channel();

        // Hand over everything already buffered, then register for live
        // deliveries.
        let mut pendings = Vec::new();
        if let Some(queue_state) = state.queues.get_mut(queue) {
            while let Some(delivery) = queue_state.buffer.pop_front() {
                pendings.push(PendingAck {
                    queue: queue.to_string(),
                    channel_id: self.id,
                    consumer_tag: tag.clone(),
                    delivery: delivery.clone(),
                });
                // Receiver is held by the returned consumer; send cannot fail.
                let _ = sender.send(delivery);
            }
            queue_state.consumers.push(ConsumerHandle {
                tag: tag.clone(),
                channel_id: self.id,
                sender,
            });
        }
        for pending in pendings {
            state.unacked.insert(pending.delivery.delivery_tag, pending);
        }
        Ok(Consumer::new(tag, receiver))
    }

    async fn ack(&self, delivery_tag: u64) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        state.unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> ChannelResult<()> {
        let mut state = self.lock();
        self.guard_op(&mut state)?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        requeue_for_consumer(&mut state, consumer_tag);
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        let mut state = self.lock();
        if !state.open_channels.contains(&self.id) {
            return Err(ChannelError::Closed);
        }
        close_channel(&mut state, self.id);
        Ok(())
    }
}

/// Connector producing channels on a shared [`MemoryBroker`], with
/// connect-failure injection for reconnect tests.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    fail_connects: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Create a connector for the given broker
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            fail_connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> ChannelResult<Box<dyn Channel>> {
        let should_fail = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ChannelError::Connect(
                "injected connect failure".to_string(),
            ));
        }
        Ok(Box::new(self.broker.open_channel()))
    }
}
